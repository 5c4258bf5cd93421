// SPDX-License-Identifier: MPL-2.0

//! CPU identification and local interrupt control.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(test)] {
        // Under the host test harness there is no privileged CPU state to
        // read. Each test thread impersonates one CPU at a time; the tests
        // switch the id explicitly when they act on behalf of another CPU.
        use core::cell::Cell;

        std::thread_local! {
            static CURRENT_CPU: Cell<u32> = Cell::new(0);
            static IRQ_ENABLED: Cell<bool> = Cell::new(true);
        }

        pub(crate) fn this_cpu_id() -> u32 {
            CURRENT_CPU.with(Cell::get)
        }

        pub(crate) fn set_this_cpu_id(id: u32) {
            CURRENT_CPU.with(|c| c.set(id));
        }

        pub(crate) fn irqs_enabled() -> bool {
            IRQ_ENABLED.with(Cell::get)
        }

        pub(crate) fn disable_irqs() {
            IRQ_ENABLED.with(|c| c.set(false));
        }

        pub(crate) fn enable_irqs() {
            IRQ_ENABLED.with(|c| c.set(true));
        }
    } else {
        use core::arch::asm;

        /// Returns the id of the executing CPU.
        ///
        /// Read from `IA32_TSC_AUX`, which the bring-up code programs with
        /// the CPU number before this crate is used on that CPU.
        pub(crate) fn this_cpu_id() -> u32 {
            let aux: u32;
            unsafe {
                asm!(
                    "rdtscp",
                    out("eax") _,
                    out("edx") _,
                    out("ecx") aux,
                    options(nomem, nostack),
                );
            }
            aux
        }

        pub(crate) fn irqs_enabled() -> bool {
            x86_64::instructions::interrupts::are_enabled()
        }

        pub(crate) fn disable_irqs() {
            x86_64::instructions::interrupts::disable();
        }

        pub(crate) fn enable_irqs() {
            x86_64::instructions::interrupts::enable();
        }
    }
}
