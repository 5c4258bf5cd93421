// SPDX-License-Identifier: MPL-2.0

//! Client (per-process) page tables.

use log::warn;

use crate::{
    arch::mm::{PageTableEntry, NR_ENTRIES_PER_PAGE},
    mm::{
        frame::{self, FrameAllocError},
        kspace::KERNEL_PAGE_TABLE,
        page_prop::{CachePolicy, PageFlags, PageProperty},
        page_table::{self, PageTree, UnmapMode},
        tlb::PageSpace,
        Paddr, Vaddr, MAX_USERSPACE_VADDR,
    },
    prelude::*,
    sync::SpinLock,
};

/// The page table of one user address space.
///
/// The lower half of the root table is private to this space; the upper
/// half is copied from the kernel root table at construction, sharing all
/// kernel mappings.
///
/// Map and unmap only edit the tree. Before a frame unmapped here may be
/// reused, the caller must submit a shootdown through [`Self::space`] so
/// that every CPU still caching the translation drops it.
pub struct ClientPageTable {
    space: Arc<PageSpace>,
    tree: SpinLock<PageTree>,
}

impl ClientPageTable {
    /// Creates an empty user address space.
    pub fn new() -> Result<Self, FrameAllocError> {
        let kernel = KERNEL_PAGE_TABLE
            .get()
            .expect("the kernel page table is not initialized");

        let root = frame::alloc_frame()?;

        // The bottom half starts out unmapped.
        for index in 0..NR_ENTRIES_PER_PAGE / 2 {
            page_table::write_entry(root, index, PageTableEntry::new_absent());
        }

        // Share the top half with the kernel.
        let kernel_root = kernel.root_table();
        for index in NR_ENTRIES_PER_PAGE / 2..NR_ENTRIES_PER_PAGE {
            let entry = page_table::read_entry(kernel_root, index);
            assert!(entry.is_present());
            page_table::write_entry(root, index, entry);
        }

        Ok(Self {
            space: Arc::new(PageSpace::new(root)),
            tree: SpinLock::new(PageTree::new(root)),
        })
    }

    /// The address space bookkeeping of this table.
    ///
    /// Activation and shootdown submission go through the returned space.
    pub fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    /// Maps one page in the user half.
    ///
    /// With `user_visible`, the page and every intermediate table on its
    /// path are reachable from unprivileged mode. The user mode of an
    /// intermediate table is fixed when it is first created; mixing modes
    /// under the same intermediate is a kernel bug and panics, as does
    /// mapping an already mapped page.
    pub fn map_single(
        &self,
        vaddr: Vaddr,
        paddr: Paddr,
        user_visible: bool,
        flags: PageFlags,
        cache: CachePolicy,
    ) -> Result<(), FrameAllocError> {
        assert!(vaddr < MAX_USERSPACE_VADDR);
        let prop = if user_visible {
            PageProperty::new_user(flags, cache)
        } else {
            PageProperty::new(flags, cache)
        };
        self.tree.lock_irq_disabled().map_single(vaddr, paddr, prop)
    }

    /// Unmaps every page in `vaddr..vaddr + size`.
    ///
    /// In [`UnmapMode::Normal`], each page of the range must currently be
    /// mapped. In [`UnmapMode::Remap`], holes are skipped silently.
    pub fn unmap_range(&self, vaddr: Vaddr, size: usize, mode: UnmapMode) {
        assert!(vaddr.checked_add(size).is_some_and(|end| end <= MAX_USERSPACE_VADDR));
        self.tree.lock_irq_disabled().unmap_range(vaddr, size, mode);
    }

    /// Returns whether a leaf is currently present for the given address.
    pub fn is_mapped(&self, vaddr: Vaddr) -> bool {
        self.tree.lock_irq_disabled().query(vaddr).is_some()
    }

    #[cfg(test)]
    pub(crate) fn query(&self, vaddr: Vaddr) -> Option<(Paddr, PageProperty)> {
        self.tree.lock_irq_disabled().query(vaddr)
    }

    /// Checks that the kernel half of this root still mirrors the kernel
    /// root table. The kernel never grows new upper-half root entries after
    /// construction; this catches it if that ever changes.
    fn kernel_half_is_stable(&self) -> bool {
        let kernel_root = match KERNEL_PAGE_TABLE.get() {
            Some(kernel) => kernel.root_table(),
            None => return true,
        };
        let root = self.tree.lock_irq_disabled().root();
        (NR_ENTRIES_PER_PAGE / 2..NR_ENTRIES_PER_PAGE).all(|index| {
            page_table::read_entry(root, index) == page_table::read_entry(kernel_root, index)
        })
    }
}

impl Drop for ClientPageTable {
    fn drop(&mut self) {
        debug_assert!(self.kernel_half_is_stable());
        // TODO: walk the lower half and return the intermediate frames to
        // the allocator once the lifetime contract with in-flight
        // shootdowns is settled.
        warn!(
            "client page table at {:#x} does not deallocate its page tables",
            self.space.root_table()
        );
    }
}

// The table is shared across CPUs; all interior mutability is behind the
// space and tree locks.
static_assertions::assert_impl_all!(ClientPageTable: Send, Sync);
