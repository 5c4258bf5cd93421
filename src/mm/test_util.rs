// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for the in-tree tests.
//!
//! The tests run on the host: "physical" frames are host heap allocations,
//! the linear mapping degenerates to the identity, the TLB instructions
//! are recorded instead of executed, and a test thread impersonates one
//! CPU at a time. Every test claims its own CPU ids and virtual ranges so
//! the suite can run concurrently against the shared singletons.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, Layout};

use crate::{
    cpu::{self, CpuId},
    mm::{frame, frame::FrameAllocator, tlb, Paddr, Vaddr, PAGE_SIZE},
};

const NR_TEST_CPUS: u32 = 64;

// Tests map into disjoint 1 GiB blocks so even their level-2 tables stay
// private to each test.
const VA_BLOCK_SIZE: usize = 0x4000_0000;

pub(crate) struct TestFrameAllocator;

impl FrameAllocator for TestFrameAllocator {
    fn allocate(&self, size: usize) -> Option<Paddr> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as Paddr)
        }
    }

    // The core intentionally never returns page-table frames; leaking them
    // in the tests mirrors that.
    fn free(&self, _paddr: Paddr, _size: usize) {}
}

static FRAME_ALLOCATOR: TestFrameAllocator = TestFrameAllocator;

/// Brings up the crate once for the whole test process.
pub(crate) fn init_test_env() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let kernel_root = FRAME_ALLOCATOR.allocate(PAGE_SIZE).unwrap();
        crate::init(NR_TEST_CPUS, &FRAME_ALLOCATOR, kernel_root, |_cpu| {}).unwrap();
    });
}

static NEXT_CPU: AtomicU32 = AtomicU32::new(0);

/// Claims a CPU id no other test uses, switches the calling thread onto
/// it, and brings up its paging state.
pub(crate) fn adopt_cpu(have_pcids: bool) -> CpuId {
    init_test_env();
    let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
    assert!(id < NR_TEST_CPUS, "test CPU ids exhausted");
    let cpu = CpuId(id);
    cpu::set_current(cpu);
    tlb::init_current_cpu(have_pcids);
    cpu
}

/// Continues the calling thread on another (already adopted) CPU.
pub(crate) fn switch_to(cpu: CpuId) {
    cpu::set_current(cpu);
}

/// Allocates one zeroed frame.
pub(crate) fn alloc_frame() -> Paddr {
    init_test_env();
    frame::alloc_frame().unwrap()
}

static NEXT_KERNEL_BLOCK: AtomicUsize = AtomicUsize::new(0);
static NEXT_USER_BLOCK: AtomicUsize = AtomicUsize::new(0);

/// A kernel-half virtual range no other test touches.
pub(crate) fn kernel_va_block() -> Vaddr {
    let block = NEXT_KERNEL_BLOCK.fetch_add(1, Ordering::Relaxed);
    0xffff_c000_0000_0000 + block * VA_BLOCK_SIZE
}

/// A user-half virtual range no other test touches.
pub(crate) fn user_va_block() -> Vaddr {
    let block = NEXT_USER_BLOCK.fetch_add(1, Ordering::Relaxed);
    0x100_0000_0000 + block * VA_BLOCK_SIZE
}
