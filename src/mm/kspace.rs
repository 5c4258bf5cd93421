// SPDX-License-Identifier: MPL-2.0

//! Kernel memory space management.
//!
//! The kernel half of the virtual address space starts at
//! [`KERNEL_BASE_VADDR`] and is shared across every address space: client
//! root tables copy the kernel root's upper-half entries at construction.
//! The bottom of the kernel half is the linear mapping of all physical
//! memory, which [`PageAccessor`] uses to touch page-table frames without
//! creating new mappings.

use alloc::sync::Arc;

use log::info;
use spin::Once;

use crate::{
    mm::{
        frame::{self, FrameAllocError},
        page_prop::{CachePolicy, PageFlags, PageProperty, PrivilegedPageFlags},
        page_table::{self, PageTree},
        tlb::PageSpace,
        Paddr, Vaddr, PAGE_SIZE,
    },
    sync::SpinLock,
};

use crate::arch::mm::{PageTableEntry, NR_ENTRIES_PER_PAGE};

/// Start of the kernel address space: the lowest high-canonical address.
pub const KERNEL_BASE_VADDR: Vaddr = 0xffff_8000_0000_0000;

/// The base of the linear mapping of all physical memory in the kernel
/// address space.
pub const LINEAR_MAPPING_BASE_VADDR: Vaddr = 0xffff_8000_0000_0000;

/// The span of physical memory covered by the linear mapping.
pub const LINEAR_MAPPING_SIZE: usize = 0x4000_0000_0000;

/// Converts a physical address to a virtual address in the linear mapping.
#[cfg(not(test))]
pub(crate) fn paddr_to_vaddr(paddr: Paddr) -> usize {
    debug_assert!(paddr < LINEAR_MAPPING_SIZE);
    paddr + LINEAR_MAPPING_BASE_VADDR
}

// Under the host test harness, "physical" frames come from the host heap
// and are addressed directly.
#[cfg(test)]
pub(crate) fn paddr_to_vaddr(paddr: Paddr) -> usize {
    paddr
}

/// A window to access a physical page frame through the linear mapping.
///
/// The accessor is move-only. It needs no release logic because the linear
/// mapping is static.
pub struct PageAccessor {
    ptr: *mut u8,
}

impl PageAccessor {
    /// Opens a window to the given page-aligned frame.
    pub fn new(paddr: Paddr) -> Self {
        assert_eq!(paddr % PAGE_SIZE, 0);
        Self {
            ptr: paddr_to_vaddr(paddr) as *mut u8,
        }
    }

    /// The kernel-visible pointer to the first byte of the frame.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

/// The kernel page table.
///
/// Mappings installed here are global: they survive address-space switches
/// in the TLB. Consequently no shootdown is issued from these entries;
/// whoever changes a kernel mapping in place must arrange TLB invalidation
/// explicitly.
pub struct KernelPageTable {
    space: Arc<PageSpace>,
    tree: SpinLock<PageTree>,
}

/// The kernel page table singleton.
pub static KERNEL_PAGE_TABLE: Once<KernelPageTable> = Once::new();

/// Binds the kernel page table singleton to the given root table and
/// pre-populates the upper half of the root.
///
/// Every upper-half root entry is made present here, so that client spaces
/// constructed later can share the kernel half by value copy and never
/// observe a root slot appearing after the fact.
pub fn init(root_table: Paddr) -> Result<(), FrameAllocError> {
    assert_eq!(root_table % PAGE_SIZE, 0);
    assert!(KERNEL_PAGE_TABLE.get().is_none());

    let mut nr_populated = 0;
    for index in NR_ENTRIES_PER_PAGE / 2..NR_ENTRIES_PER_PAGE {
        let entry = page_table::read_entry(root_table, index);
        if entry.is_present() {
            assert!(!entry.is_user());
            continue;
        }
        let frame = frame::alloc_frame()?;
        let accessor = PageAccessor::new(frame);
        // SAFETY: the frame was just allocated for this table and is
        // covered by the linear mapping.
        unsafe { accessor.as_ptr().write_bytes(0, PAGE_SIZE) };
        page_table::write_entry(root_table, index, PageTableEntry::new_pt(frame, false));
        nr_populated += 1;
    }

    info!(
        "kernel page table at {:#x}, {} upper-half slots populated",
        root_table, nr_populated
    );

    KERNEL_PAGE_TABLE.call_once(|| KernelPageTable {
        space: Arc::new(PageSpace::new(root_table)),
        tree: SpinLock::new(PageTree::new(root_table)),
    });
    Ok(())
}

impl KernelPageTable {
    /// The address space bookkeeping of the kernel page table.
    pub fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    /// The physical frame of the kernel root table.
    pub fn root_table(&self) -> Paddr {
        self.space.root_table()
    }

    /// Maps one page in the kernel half.
    ///
    /// Absent intermediate tables are allocated zero-filled on the way
    /// down. The leaf is marked global; mapping an already mapped page is a
    /// kernel bug and panics.
    pub fn map_single(
        &self,
        vaddr: Vaddr,
        paddr: Paddr,
        flags: PageFlags,
        cache: CachePolicy,
    ) -> Result<(), FrameAllocError> {
        assert!(vaddr >= KERNEL_BASE_VADDR);
        let prop = PageProperty {
            flags,
            cache,
            priv_flags: PrivilegedPageFlags::GLOBAL,
        };
        self.tree.lock_irq_disabled().map_single(vaddr, paddr, prop)
    }

    /// Unmaps one page in the kernel half and returns the frame it mapped.
    ///
    /// The whole walk must be present; the kernel space never shrinks, so
    /// intermediate tables are not freed.
    pub fn unmap_single(&self, vaddr: Vaddr) -> Paddr {
        assert!(vaddr >= KERNEL_BASE_VADDR);
        self.tree.lock_irq_disabled().unmap_single(vaddr)
    }

    #[cfg(test)]
    pub(crate) fn query(&self, vaddr: Vaddr) -> Option<(Paddr, PageProperty)> {
        self.tree.lock_irq_disabled().query(vaddr)
    }
}
