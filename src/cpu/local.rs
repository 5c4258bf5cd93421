// SPDX-License-Identifier: MPL-2.0

//! CPU-local storage.
//!
//! A [`CpuLocal`] holds one slot of `T` per CPU. Slots are allocated lazily
//! once the CPU count is known, so `CpuLocal` values can live in statics
//! that are constructed before boot discovers the topology.

use alloc::{boxed::Box, vec::Vec};

use spin::Once;

use crate::{cpu::CpuId, irq::DisabledLocalIrqGuard};

use super::PinCurrentCpu;

/// Per-CPU storage with one slot per CPU.
pub struct CpuLocal<T> {
    init: fn() -> T,
    slots: Once<Box<[T]>>,
}

impl<T> CpuLocal<T> {
    /// Creates CPU-local storage whose slots are built by `init`.
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            slots: Once::new(),
        }
    }

    fn slots(&self) -> &[T] {
        self.slots.call_once(|| {
            let num_cpus = crate::cpu::num_cpus() as usize;
            (0..num_cpus)
                .map(|_| (self.init)())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        })
    }

    /// Returns the slot of the given CPU.
    ///
    /// Cross-CPU access is safe only for slot types that synchronize their
    /// interior (the `T: Sync` bound on sharing the storage enforces this).
    pub fn get_on_cpu(&self, cpu: CpuId) -> &T {
        &self.slots()[cpu.as_usize()]
    }

    /// Returns the slot of the executing CPU.
    ///
    /// The IRQ guard pins the caller to its CPU for the lifetime of the
    /// returned borrow.
    pub fn get_with<'a>(&'a self, guard: &'a DisabledLocalIrqGuard) -> &'a T {
        self.get_on_cpu(guard.current_cpu())
    }
}
