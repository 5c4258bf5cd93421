// SPDX-License-Identifier: MPL-2.0

//! Symmetric Multi-Processing (SMP) support.
//!
//! This crate does not drive the interrupt controller itself. The embedding
//! kernel registers a doorbell through [`init`]; when an address space
//! needs a shootdown scan, the doorbell is rung once per CPU. The kernel's
//! interrupt handler then calls [`handle_shootdown_ipi`] on each poked CPU.

use spin::Once;

use crate::cpu::{self, CpuId};

static SHOOTDOWN_DOORBELL: Once<fn(CpuId)> = Once::new();

/// Registers the shootdown doorbell.
///
/// `send_ipi` must deliver an interrupt to the given CPU whose handler
/// calls [`handle_shootdown_ipi`]. Delivery to the calling CPU itself must
/// work as well (a self-IPI). Fire-and-forget; no acknowledgement is
/// expected.
pub fn init(send_ipi: fn(CpuId)) {
    SHOOTDOWN_DOORBELL.call_once(|| send_ipi);
}

/// Requests a shootdown scan on every CPU, including the current one.
pub(crate) fn send_shootdown_ipi() {
    let doorbell = SHOOTDOWN_DOORBELL
        .get()
        .expect("the shootdown doorbell is not registered");
    for cpu in cpu::all_cpus() {
        doorbell(cpu);
    }
}

/// Handles a shootdown interrupt on the current CPU.
///
/// To be called from the interrupt handler backing the doorbell, at the
/// earliest point where taking spin locks is safe.
pub fn handle_shootdown_ipi() {
    crate::mm::tlb::process_pending_shootdowns();
}
