// SPDX-License-Identifier: MPL-2.0

//! The memory-management substrate of the Mantle kernel.
//!
//! This crate owns the paging core of a small multi-core x86-64 kernel:
//! the kernel and per-process page tables, the address-space objects that
//! track which CPUs cache their translations, and the cross-CPU TLB
//! invalidation ("shootdown") protocol that keeps those caches coherent
//! when mappings are torn down.
//!
//! The crate is a substrate, not a kernel. The embedding kernel supplies
//! the collaborators this crate consumes:
//!
//! - a physical [`FrameAllocator`](mm::frame::FrameAllocator), callable
//!   with interrupts disabled;
//! - an IPI doorbell registered via [`smp::init`], through which
//!   [`PageSpace`](mm::PageSpace) requests shootdown scans on remote CPUs;
//! - interrupt plumbing that calls [`smp::handle_shootdown_ipi`] when the
//!   doorbell rings on a CPU.
//!
//! Bring-up order: [`init`] once on the bootstrap CPU, then
//! [`mm::tlb::init_current_cpu`] on every CPU (including the bootstrap CPU)
//! once its PCID capability is known.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub(crate) mod arch;
pub mod cpu;
pub mod irq;
pub mod mm;
pub mod prelude;
pub mod smp;
pub mod sync;

use crate::{
    cpu::CpuId,
    mm::frame::{FrameAllocError, FrameAllocator},
    mm::Paddr,
};

/// Initializes the memory-management substrate on the bootstrap CPU.
///
/// `kernel_root_table` is the physical frame of the kernel's root page
/// table, as handed over by the boot protocol. Absent upper-half entries of
/// the root are populated here so that every later client space can share
/// the kernel half by value copy; this may allocate from `allocator`.
///
/// `send_shootdown_ipi` must deliver a shootdown doorbell to the given CPU,
/// including the calling one (a self-IPI is fine). Delivery is
/// fire-and-forget.
pub fn init(
    num_cpus: u32,
    allocator: &'static dyn FrameAllocator,
    kernel_root_table: Paddr,
    send_shootdown_ipi: fn(CpuId),
) -> Result<(), FrameAllocError> {
    cpu::init(num_cpus);
    mm::frame::init(allocator);
    smp::init(send_shootdown_ipi);
    mm::kspace::init(kernel_root_table)?;
    Ok(())
}
