// SPDX-License-Identifier: MPL-2.0

//! x86-64 paging: the hardware page-table entry layout and the TLB
//! maintenance instructions.

use core::fmt;

use bitflags::bitflags;
use cfg_if::cfg_if;
use static_assertions::const_assert_eq;

use crate::mm::{
    page_prop::{CachePolicy, PageFlags, PageProperty, PrivilegedPageFlags as PrivFlags},
    Paddr, PAGE_SIZE,
};

pub(crate) const NR_ENTRIES_PER_PAGE: usize = 512;

bitflags! {
    /// Possible flags for a page table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct PageTableFlags: u64 {
        /// Specifies whether the mapped frame or page table is loaded in memory.
        const PRESENT =         1 << 0;
        /// Controls whether writes to the mapped frames are allowed.
        const WRITABLE =        1 << 1;
        /// Controls whether accesses from userspace (i.e. ring 3) are permitted.
        const USER =            1 << 2;
        /// If this bit is set, a "write-through" policy is used for the cache.
        const WRITE_THROUGH =   1 << 3;
        /// Disables caching for the pointed entry.
        const NO_CACHE =        1 << 4;
        /// Whether this entry has been used for linear-address translation.
        const ACCESSED =        1 << 5;
        /// Whether the memory area represented by this entry is modified.
        const DIRTY =           1 << 6;
        /// The PAT (page attribute table) bit of a level-1 entry.
        const PAT =             1 << 7;
        /// Indicates that the mapping is present in all address spaces, so it
        /// isn't flushed from the TLB on an address space switch.
        const GLOBAL =          1 << 8;
        /// Forbid execution of code on the page. The NXE bit in the EFER MSR
        /// must be set.
        const NO_EXECUTE =      1 << 63;
    }
}

/// One entry of a page table, at any of the four levels.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PageTableEntry(u64);

const_assert_eq!(core::mem::size_of::<PageTableEntry>(), 8);
const_assert_eq!(NR_ENTRIES_PER_PAGE * core::mem::size_of::<PageTableEntry>(), PAGE_SIZE);

impl PageTableEntry {
    const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Creates a new PTE that points to nothing.
    pub(crate) fn new_absent() -> Self {
        Self(0)
    }

    /// Creates a new level-1 PTE mapping a frame with the given property.
    pub(crate) fn new_page(paddr: Paddr, prop: PageProperty) -> Self {
        let mut bits = (paddr as u64 & Self::PHYS_ADDR_MASK) | PageTableFlags::PRESENT.bits();
        if prop.flags.contains(PageFlags::W) {
            bits |= PageTableFlags::WRITABLE.bits();
        }
        if !prop.flags.contains(PageFlags::X) {
            bits |= PageTableFlags::NO_EXECUTE.bits();
        }
        if prop.priv_flags.contains(PrivFlags::USER) {
            bits |= PageTableFlags::USER.bits();
        }
        if prop.priv_flags.contains(PrivFlags::GLOBAL) {
            bits |= PageTableFlags::GLOBAL.bits();
        }
        bits |= match prop.cache {
            CachePolicy::Writeback => 0,
            CachePolicy::Writethrough => PageTableFlags::WRITE_THROUGH.bits(),
            CachePolicy::WriteCombining => {
                PageTableFlags::PAT.bits() | PageTableFlags::WRITE_THROUGH.bits()
            }
            CachePolicy::Uncacheable => PageTableFlags::NO_CACHE.bits(),
        };
        Self(bits)
    }

    /// Creates a new PTE that points to a child page table.
    ///
    /// The USER bit of an intermediate entry is fixed for its whole
    /// lifetime; walks assert that it never changes.
    pub(crate) fn new_pt(paddr: Paddr, user: bool) -> Self {
        let mut bits = (paddr as u64 & Self::PHYS_ADDR_MASK)
            | PageTableFlags::PRESENT.bits()
            | PageTableFlags::WRITABLE.bits();
        if user {
            bits |= PageTableFlags::USER.bits();
        }
        Self(bits)
    }

    pub(crate) fn is_present(&self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    pub(crate) fn is_user(&self) -> bool {
        self.0 & PageTableFlags::USER.bits() != 0
    }

    /// The physical address of the child table or of the mapped frame.
    pub(crate) fn paddr(&self) -> Paddr {
        (self.0 & Self::PHYS_ADDR_MASK) as Paddr
    }

    /// Clears the present bit, leaving every other bit in place.
    pub(crate) fn clear_present(&mut self) {
        self.0 &= !PageTableFlags::PRESENT.bits();
    }

    /// Decodes the property of a level-1 PTE.
    pub(crate) fn prop(&self) -> PageProperty {
        let mut flags = PageFlags::empty();
        if self.0 & PageTableFlags::WRITABLE.bits() != 0 {
            flags |= PageFlags::W;
        }
        if self.0 & PageTableFlags::NO_EXECUTE.bits() == 0 {
            flags |= PageFlags::X;
        }
        let mut priv_flags = PrivFlags::empty();
        if self.0 & PageTableFlags::USER.bits() != 0 {
            priv_flags |= PrivFlags::USER;
        }
        if self.0 & PageTableFlags::GLOBAL.bits() != 0 {
            priv_flags |= PrivFlags::GLOBAL;
        }
        let cache = if self.0 & PageTableFlags::NO_CACHE.bits() != 0 {
            CachePolicy::Uncacheable
        } else if self.0 & PageTableFlags::PAT.bits() != 0 {
            CachePolicy::WriteCombining
        } else if self.0 & PageTableFlags::WRITE_THROUGH.bits() != 0 {
            CachePolicy::Writethrough
        } else {
            CachePolicy::Writeback
        };
        PageProperty {
            flags,
            cache,
            priv_flags,
        }
    }

    #[cfg(test)]
    pub(crate) fn bits(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("present", &self.is_present())
            .field(
                "flags",
                &PageTableFlags::from_bits_truncate(self.0 & !Self::PHYS_ADDR_MASK),
            )
            .finish()
    }
}

cfg_if! {
    if #[cfg(test)] {
        pub(crate) use self::mock::{
            activate_root, take_tlb_ops, tlb_flush_addr, tlb_flush_addr_for_pcid,
            tlb_flush_pcid_all, TlbOp,
        };

        /// Recording stand-ins for the TLB maintenance instructions.
        ///
        /// The host test harness cannot execute `invlpg`/`invpcid` or write
        /// CR3; instead every operation is appended to a per-thread log that
        /// the tests inspect.
        pub(crate) mod mock {
            use core::cell::RefCell;

            use crate::mm::{Paddr, Vaddr};

            #[derive(Clone, Debug, PartialEq, Eq)]
            pub(crate) enum TlbOp {
                FlushAddr(Vaddr),
                FlushAddrForPcid(Vaddr, u16),
                FlushPcidAll(u16),
                SetRoot {
                    root: Paddr,
                    pcid: u16,
                    preserve: bool,
                },
            }

            std::thread_local! {
                static TLB_OPS: RefCell<Vec<TlbOp>> = RefCell::new(Vec::new());
            }

            fn record(op: TlbOp) {
                TLB_OPS.with(|ops| ops.borrow_mut().push(op));
            }

            /// Drains the operations recorded on this thread so far.
            pub(crate) fn take_tlb_ops() -> Vec<TlbOp> {
                TLB_OPS.with(|ops| ops.take())
            }

            pub(crate) fn tlb_flush_addr(vaddr: Vaddr) {
                record(TlbOp::FlushAddr(vaddr));
            }

            pub(crate) fn tlb_flush_addr_for_pcid(vaddr: Vaddr, pcid: u16) {
                record(TlbOp::FlushAddrForPcid(vaddr, pcid));
            }

            pub(crate) fn tlb_flush_pcid_all(pcid: u16) {
                record(TlbOp::FlushPcidAll(pcid));
            }

            pub(crate) unsafe fn activate_root(root: Paddr, pcid: u16, preserve: bool) {
                record(TlbOp::SetRoot {
                    root,
                    pcid,
                    preserve,
                });
            }
        }
    } else {
        use core::arch::asm;

        use crate::mm::Vaddr;

        // `invpcid` takes a 128-bit memory descriptor: the PCID in the low
        // word, the address in the high word.
        const INVPCID_INDIVIDUAL_ADDRESS: u64 = 0;
        const INVPCID_SINGLE_CONTEXT: u64 = 1;

        /// Flushes any TLB entry that contains the map of the given virtual
        /// address, in the current PCID.
        pub(crate) fn tlb_flush_addr(vaddr: Vaddr) {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr as u64));
        }

        /// Flushes the TLB entry for the given virtual address in the given
        /// PCID, which need not be the active one.
        pub(crate) fn tlb_flush_addr_for_pcid(vaddr: Vaddr, pcid: u16) {
            let descriptor = [pcid as u64, vaddr as u64];
            unsafe {
                asm!(
                    "invpcid {ty}, [{desc}]",
                    ty = in(reg) INVPCID_INDIVIDUAL_ADDRESS,
                    desc = in(reg) descriptor.as_ptr(),
                    options(nostack),
                );
            }
        }

        /// Flushes all TLB entries tagged with the given PCID.
        pub(crate) fn tlb_flush_pcid_all(pcid: u16) {
            let descriptor = [pcid as u64, 0u64];
            unsafe {
                asm!(
                    "invpcid {ty}, [{desc}]",
                    ty = in(reg) INVPCID_SINGLE_CONTEXT,
                    desc = in(reg) descriptor.as_ptr(),
                    options(nostack),
                );
            }
        }

        /// Points the root-pointer register at the given root table, tagged
        /// with `pcid`.
        ///
        /// With `preserve` set, bit 63 of the written value instructs the
        /// hardware to keep TLB entries of other PCIDs; only meaningful on
        /// PCID-capable CPUs.
        ///
        /// # Safety
        ///
        /// Changing the root page table can violate memory safety through
        /// the new mappings; the caller must guarantee the table is valid.
        pub(crate) unsafe fn activate_root(root: Paddr, pcid: u16, preserve: bool) {
            let mut value = root as u64 | pcid as u64;
            if preserve {
                value |= 1 << 63;
            }
            unsafe {
                asm!("mov cr3, {}", in(reg) value, options(nostack));
            }
        }
    }
}
