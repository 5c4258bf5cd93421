// SPDX-License-Identifier: MPL-2.0

//! The four-level page-table walk.
//!
//! [`PageTree`] is the walk machinery shared by the kernel and client page
//! tables; the two table types differ only in policy (global vs. per-user
//! leaves, kernel-half sharing), not in how they traverse the tree.
//!
//! Misuse of the walk — double-mapping, unmapping an absent page outside
//! [`UnmapMode::Remap`], changing the user mode of an existing intermediate
//! table — is a kernel bug and panics.

use crate::arch::mm::{PageTableEntry, NR_ENTRIES_PER_PAGE};
use crate::mm::{
    frame::{self, FrameAllocError},
    kspace::PageAccessor,
    page_prop::{PageProperty, PrivilegedPageFlags},
    Paddr, PagingLevel, Vaddr, NR_LEVELS, PAGE_SIZE,
};

#[cfg(test)]
mod test;

/// How [`ClientPageTable::unmap_range`] treats holes in the range.
///
/// [`ClientPageTable::unmap_range`]: crate::mm::ClientPageTable::unmap_range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmapMode {
    /// Every page of the range must currently be mapped.
    Normal,
    /// Absent intermediate tables and absent leaves are silently skipped.
    Remap,
}

/// The number of virtual address bits used to index a PTE within a table.
const PTE_INDEX_BITS: usize = NR_ENTRIES_PER_PAGE.ilog2() as usize;

/// The index of a virtual address's PTE in a page table at the given level.
pub(crate) const fn pte_index(va: Vaddr, level: PagingLevel) -> usize {
    (va >> (PAGE_SIZE.ilog2() as usize + PTE_INDEX_BITS * (level as usize - 1)))
        & (NR_ENTRIES_PER_PAGE - 1)
}

/// Reads one entry of the page-table frame at `table`.
pub(crate) fn read_entry(table: Paddr, index: usize) -> PageTableEntry {
    debug_assert!(index < NR_ENTRIES_PER_PAGE);
    let accessor = PageAccessor::new(table);
    // SAFETY: the index is in bounds and page-table frames are covered by
    // the linear mapping. The hardware may concurrently set accessed/dirty
    // bits, hence the volatile access.
    unsafe {
        (accessor.as_ptr() as *const PageTableEntry)
            .add(index)
            .read_volatile()
    }
}

/// Writes one entry of the page-table frame at `table`.
pub(crate) fn write_entry(table: Paddr, index: usize, entry: PageTableEntry) {
    debug_assert!(index < NR_ENTRIES_PER_PAGE);
    let accessor = PageAccessor::new(table);
    // SAFETY: as in `read_entry`; exclusivity is the caller's table lock.
    unsafe {
        (accessor.as_ptr() as *mut PageTableEntry)
            .add(index)
            .write_volatile(entry)
    }
}

/// A page-table tree rooted at one physical frame.
///
/// The tree exclusively owns its intermediate frames. All methods take the
/// tree by `&mut`; serialization is the owning table's spin lock.
pub(crate) struct PageTree {
    root: Paddr,
}

impl PageTree {
    pub(crate) fn new(root: Paddr) -> Self {
        debug_assert_eq!(root % PAGE_SIZE, 0);
        Self { root }
    }

    /// Walks down to the level-1 table of `vaddr`, allocating absent
    /// intermediate tables zero-filled.
    ///
    /// `user` decides the USER bit of newly created intermediate entries
    /// and is asserted against existing ones: the user mode of an
    /// intermediate table is fixed when it is created.
    fn ensure_leaf_table(&mut self, vaddr: Vaddr, user: bool) -> Result<Paddr, FrameAllocError> {
        let mut table = self.root;
        for level in (2..=NR_LEVELS).rev() {
            let index = pte_index(vaddr, level);
            let entry = read_entry(table, index);
            table = if entry.is_present() {
                assert_eq!(
                    entry.is_user(),
                    user,
                    "user mode of the level-{} table of {:#x} cannot change",
                    level - 1,
                    vaddr
                );
                entry.paddr()
            } else {
                let frame = frame::alloc_frame()?;
                let accessor = PageAccessor::new(frame);
                // SAFETY: freshly allocated table frame, covered by the
                // linear mapping.
                unsafe { accessor.as_ptr().write_bytes(0, PAGE_SIZE) };
                write_entry(table, index, PageTableEntry::new_pt(frame, user));
                frame
            };
        }
        Ok(table)
    }

    /// Installs a leaf PTE for `vaddr`, which must not be mapped yet.
    pub(crate) fn map_single(
        &mut self,
        vaddr: Vaddr,
        paddr: Paddr,
        prop: PageProperty,
    ) -> Result<(), FrameAllocError> {
        assert_eq!(vaddr % PAGE_SIZE, 0);
        assert_eq!(paddr % PAGE_SIZE, 0);

        let user = prop.priv_flags.contains(PrivilegedPageFlags::USER);
        let table = self.ensure_leaf_table(vaddr, user)?;
        let index = pte_index(vaddr, 1);
        let old = read_entry(table, index);
        assert!(!old.is_present(), "{:#x} is already mapped", vaddr);
        write_entry(table, index, PageTableEntry::new_page(paddr, prop));
        Ok(())
    }

    /// Clears the present bit of the leaf PTE for `vaddr` and returns the
    /// frame it mapped. The whole walk must be present.
    pub(crate) fn unmap_single(&mut self, vaddr: Vaddr) -> Paddr {
        assert_eq!(vaddr % PAGE_SIZE, 0);

        let mut table = self.root;
        for level in (2..=NR_LEVELS).rev() {
            let entry = read_entry(table, pte_index(vaddr, level));
            assert!(entry.is_present(), "{:#x} is not mapped", vaddr);
            table = entry.paddr();
        }
        let index = pte_index(vaddr, 1);
        let mut entry = read_entry(table, index);
        assert!(entry.is_present(), "{:#x} is not mapped", vaddr);
        entry.clear_present();
        write_entry(table, index, entry);
        entry.paddr()
    }

    /// Clears the present bit of every leaf PTE in `vaddr..vaddr + size`.
    pub(crate) fn unmap_range(&mut self, vaddr: Vaddr, size: usize, mode: UnmapMode) {
        assert_eq!(vaddr % PAGE_SIZE, 0);
        assert_eq!(size % PAGE_SIZE, 0);

        'pages: for progress in (0..size).step_by(PAGE_SIZE) {
            let va = vaddr + progress;
            let mut table = self.root;
            for level in (2..=NR_LEVELS).rev() {
                let entry = read_entry(table, pte_index(va, level));
                if mode == UnmapMode::Remap && !entry.is_present() {
                    continue 'pages;
                }
                assert!(entry.is_present(), "{:#x} is not mapped", va);
                table = entry.paddr();
            }
            let index = pte_index(va, 1);
            let mut entry = read_entry(table, index);
            if mode == UnmapMode::Remap && !entry.is_present() {
                continue;
            }
            assert!(entry.is_present(), "{:#x} is not mapped", va);
            entry.clear_present();
            write_entry(table, index, entry);
        }
    }

    /// A software emulation of the MMU address translation process.
    ///
    /// Returns the mapped frame and the decoded property of the leaf PTE,
    /// or `None` anywhere the walk finds an absent entry. Never asserts.
    pub(crate) fn query(&self, vaddr: Vaddr) -> Option<(Paddr, PageProperty)> {
        let mut table = self.root;
        for level in (2..=NR_LEVELS).rev() {
            let entry = read_entry(table, pte_index(vaddr, level));
            if !entry.is_present() {
                return None;
            }
            table = entry.paddr();
        }
        let entry = read_entry(table, pte_index(vaddr, 1));
        if entry.is_present() {
            Some((entry.paddr(), entry.prop()))
        } else {
            None
        }
    }

    pub(crate) fn root(&self) -> Paddr {
        self.root
    }
}
