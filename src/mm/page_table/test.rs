// SPDX-License-Identifier: MPL-2.0

use super::*;
use crate::{
    arch::mm::PageTableFlags,
    mm::{
        kspace::{KernelPageTable, PageAccessor, KERNEL_PAGE_TABLE},
        page_prop::{CachePolicy, PageFlags, PageProperty, PrivilegedPageFlags},
        test_util,
        uspace::ClientPageTable,
        PAGE_SIZE,
    },
};

fn kernel_table() -> &'static KernelPageTable {
    test_util::init_test_env();
    KERNEL_PAGE_TABLE.get().unwrap()
}

fn client_table() -> ClientPageTable {
    test_util::init_test_env();
    ClientPageTable::new().unwrap()
}

/// Reads the raw leaf PTE of `va`, asserting the walk is present.
fn raw_leaf(root: Paddr, va: Vaddr) -> u64 {
    let mut table = root;
    for level in (2..=NR_LEVELS).rev() {
        let entry = read_entry(table, pte_index(va, level));
        assert!(entry.is_present());
        table = entry.paddr();
    }
    read_entry(table, pte_index(va, 1)).bits()
}

mod kernel_table_ops {
    use super::*;

    #[test]
    fn map_installs_a_global_leaf() {
        let kpt = kernel_table();
        let va = test_util::kernel_va_block();
        let pa = test_util::alloc_frame();

        kpt.map_single(va, pa, PageFlags::W, CachePolicy::Writeback)
            .unwrap();

        let (mapped, prop) = kpt.query(va).unwrap();
        assert_eq!(mapped, pa);
        assert_eq!(prop.flags, PageFlags::W);
        assert_eq!(prop.cache, CachePolicy::Writeback);
        assert!(prop.priv_flags.contains(PrivilegedPageFlags::GLOBAL));
        assert!(!prop.priv_flags.contains(PrivilegedPageFlags::USER));
    }

    #[test]
    fn unmap_returns_the_frame_and_clears_the_leaf() {
        let kpt = kernel_table();
        let va = test_util::kernel_va_block();
        let pa = test_util::alloc_frame();

        kpt.map_single(va, pa, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        assert_eq!(kpt.unmap_single(va), pa);
        assert!(kpt.query(va).is_none());

        // The address translates like it never was mapped.
        kpt.map_single(va, pa, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        assert_eq!(kpt.query(va).unwrap().0, pa);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_is_a_bug() {
        let kpt = kernel_table();
        let va = test_util::kernel_va_block();
        let pa = test_util::alloc_frame();
        kpt.map_single(va, pa, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        let _ = kpt.map_single(va, pa, PageFlags::W, CachePolicy::Writeback);
    }

    #[test]
    #[should_panic(expected = "is not mapped")]
    fn unmap_of_absent_is_a_bug() {
        let kpt = kernel_table();
        let va = test_util::kernel_va_block();
        kpt.unmap_single(va);
    }

    #[test]
    fn no_execute_unless_requested() {
        let kpt = kernel_table();
        let va = test_util::kernel_va_block();

        kpt.map_single(va, test_util::alloc_frame(), PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        kpt.map_single(
            va + PAGE_SIZE,
            test_util::alloc_frame(),
            PageFlags::W | PageFlags::X,
            CachePolicy::Writeback,
        )
        .unwrap();

        let root = kpt.root_table();
        assert_ne!(raw_leaf(root, va) & PageTableFlags::NO_EXECUTE.bits(), 0);
        assert_eq!(
            raw_leaf(root, va + PAGE_SIZE) & PageTableFlags::NO_EXECUTE.bits(),
            0
        );
        assert_ne!(raw_leaf(root, va) & PageTableFlags::GLOBAL.bits(), 0);
    }
}

mod leaf_encoding {
    use super::*;

    #[test]
    fn cache_modes_encode_to_the_architected_bits() {
        test_util::init_test_env();
        let mut tree = PageTree::new(test_util::alloc_frame());
        let cache_mask = (PageTableFlags::WRITE_THROUGH
            | PageTableFlags::NO_CACHE
            | PageTableFlags::PAT)
            .bits();
        let cases = [
            (CachePolicy::Writeback, 0),
            (CachePolicy::Writethrough, PageTableFlags::WRITE_THROUGH.bits()),
            (
                CachePolicy::WriteCombining,
                (PageTableFlags::PAT | PageTableFlags::WRITE_THROUGH).bits(),
            ),
            (CachePolicy::Uncacheable, PageTableFlags::NO_CACHE.bits()),
        ];

        for (nth, (cache, expected)) in cases.into_iter().enumerate() {
            let va = test_util::user_va_block() + nth * PAGE_SIZE;
            tree.map_single(va, test_util::alloc_frame(), PageProperty::new(PageFlags::W, cache))
                .unwrap();
            assert_eq!(raw_leaf(tree.root(), va) & cache_mask, expected);
            // And the decoder agrees.
            assert_eq!(tree.query(va).unwrap().1.cache, cache);
        }
    }
}

mod client_table_ops {
    use super::*;

    #[test]
    fn root_shares_the_kernel_half() {
        let kpt = kernel_table();
        let ct = ClientPageTable::new().unwrap();
        let root = ct.space().root_table();
        let kernel_root = kpt.root_table();

        for index in 0..NR_ENTRIES_PER_PAGE / 2 {
            assert!(!read_entry(root, index).is_present());
        }
        for index in NR_ENTRIES_PER_PAGE / 2..NR_ENTRIES_PER_PAGE {
            assert_eq!(read_entry(root, index), read_entry(kernel_root, index));
        }
    }

    #[test]
    fn user_bit_covers_the_whole_path() {
        let ct = client_table();
        let va = test_util::user_va_block();
        ct.map_single(va, test_util::alloc_frame(), true, PageFlags::W, CachePolicy::Writeback)
            .unwrap();

        let mut table = ct.space().root_table();
        for level in (2..=NR_LEVELS).rev() {
            let entry = read_entry(table, pte_index(va, level));
            assert!(entry.is_present() && entry.is_user());
            table = entry.paddr();
        }
        let (_, prop) = ct.query(va).unwrap();
        assert!(prop.priv_flags.contains(PrivilegedPageFlags::USER));
    }

    #[test]
    #[should_panic(expected = "cannot change")]
    fn intermediate_user_mode_cannot_change() {
        let ct = client_table();
        let va = test_util::user_va_block();
        ct.map_single(va, test_util::alloc_frame(), true, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        // Lands in the same leaf table, but kernel-only this time.
        let _ = ct.map_single(
            va + PAGE_SIZE,
            test_util::alloc_frame(),
            false,
            PageFlags::W,
            CachePolicy::Writeback,
        );
    }

    #[test]
    fn unmap_range_clears_every_leaf() {
        let ct = client_table();
        let va = test_util::user_va_block();
        for nth in 0..3 {
            ct.map_single(
                va + nth * PAGE_SIZE,
                test_util::alloc_frame(),
                true,
                PageFlags::W,
                CachePolicy::Writeback,
            )
            .unwrap();
        }

        ct.unmap_range(va, 3 * PAGE_SIZE, UnmapMode::Normal);
        for nth in 0..3 {
            assert!(!ct.is_mapped(va + nth * PAGE_SIZE));
        }
    }

    #[test]
    #[should_panic(expected = "is not mapped")]
    fn normal_unmap_rejects_holes() {
        let ct = client_table();
        let va = test_util::user_va_block();
        ct.map_single(va, test_util::alloc_frame(), true, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        // The second page was never mapped.
        ct.unmap_range(va, 2 * PAGE_SIZE, UnmapMode::Normal);
    }

    #[test]
    fn remap_unmap_skips_holes() {
        let ct = client_table();
        let va = test_util::user_va_block();
        ct.map_single(
            va + PAGE_SIZE,
            test_util::alloc_frame(),
            true,
            PageFlags::W,
            CachePolicy::Writeback,
        )
        .unwrap();

        ct.unmap_range(va, 3 * PAGE_SIZE, UnmapMode::Remap);
        assert!(!ct.is_mapped(va + PAGE_SIZE));

        // On a range with no mappings at all it is a no-op.
        ct.unmap_range(va, 3 * PAGE_SIZE, UnmapMode::Remap);
    }

    #[test]
    fn is_mapped_reflects_the_leaf() {
        let ct = client_table();
        let va = test_util::user_va_block();
        assert!(!ct.is_mapped(va));
        ct.map_single(va, test_util::alloc_frame(), true, PageFlags::W, CachePolicy::Writeback)
            .unwrap();
        assert!(ct.is_mapped(va));
        ct.unmap_range(va, PAGE_SIZE, UnmapMode::Normal);
        assert!(!ct.is_mapped(va));
    }
}

mod accessor {
    use super::*;

    #[test]
    #[should_panic]
    fn rejects_unaligned_frames() {
        test_util::init_test_env();
        let pa = test_util::alloc_frame();
        let _ = PageAccessor::new(pa + 1);
    }
}
