// SPDX-License-Identifier: MPL-2.0

//! Local interrupt control.

use core::marker::PhantomData;

use crate::{arch, cpu::PinCurrentCpu};

/// Disables interrupts on the current CPU and returns a guard that restores
/// the previous state when dropped. Nesting is fine; only the outermost
/// guard re-enables.
pub fn disable_local() -> DisabledLocalIrqGuard {
    DisabledLocalIrqGuard::new()
}

/// A guard for disabled local IRQs.
///
/// While the guard is alive the holder cannot be preempted or migrated, so
/// it also serves as a [`PinCurrentCpu`] witness.
pub struct DisabledLocalIrqGuard {
    was_enabled: bool,
    // IRQ state is per CPU; the guard must not leave the CPU it was taken on.
    _not_send: PhantomData<*mut ()>,
}

impl DisabledLocalIrqGuard {
    fn new() -> Self {
        let was_enabled = arch::cpu::irqs_enabled();
        if was_enabled {
            arch::cpu::disable_irqs();
        }
        Self {
            was_enabled,
            _not_send: PhantomData,
        }
    }
}

impl Drop for DisabledLocalIrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            arch::cpu::enable_irqs();
        }
    }
}

impl PinCurrentCpu for DisabledLocalIrqGuard {}
