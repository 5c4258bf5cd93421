// SPDX-License-Identifier: MPL-2.0

//! The physical frame allocator contract.
//!
//! The allocator itself lives in the embedding kernel; this crate only
//! draws page-table frames from it.

use core::fmt;

use spin::Once;

use crate::mm::{Paddr, PAGE_SIZE};

/// A provider of physical page frames.
///
/// All methods must be callable with interrupts disabled.
pub trait FrameAllocator: Sync {
    /// Allocates `size` bytes of page-aligned, physically contiguous
    /// memory. Returns `None` when physical memory is exhausted.
    fn allocate(&self, size: usize) -> Option<Paddr>;

    /// Returns a previously allocated region.
    fn free(&self, paddr: Paddr, size: usize);
}

/// Physical memory exhaustion, surfaced by mapping operations that need to
/// grow a page-table tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAllocError;

impl fmt::Display for FrameAllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "out of physical frames")
    }
}

static FRAME_ALLOCATOR: Once<&'static dyn FrameAllocator> = Once::new();

/// Installs the system frame allocator.
pub fn init(allocator: &'static dyn FrameAllocator) {
    FRAME_ALLOCATOR.call_once(|| allocator);
}

/// Allocates one page frame.
pub(crate) fn alloc_frame() -> Result<Paddr, FrameAllocError> {
    let allocator = FRAME_ALLOCATOR
        .get()
        .expect("the frame allocator is not installed");
    let frame = allocator.allocate(PAGE_SIZE).ok_or(FrameAllocError)?;
    debug_assert_eq!(frame % PAGE_SIZE, 0);
    Ok(frame)
}
