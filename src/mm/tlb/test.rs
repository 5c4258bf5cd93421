// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::{
    arch::mm::{take_tlb_ops, TlbOp},
    mm::{test_util, uspace::ClientPageTable},
    smp,
};

fn new_space() -> ClientPageTable {
    test_util::init_test_env();
    ClientPageTable::new().unwrap()
}

fn counted_node(address: Vaddr, size: usize) -> (ShootNode, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let completions = counter.clone();
    let node = ShootNode::new(address, size, move || {
        completions.fetch_add(1, Ordering::Relaxed);
    });
    (node, counter)
}

#[test]
fn unbound_space_completes_synchronously() {
    let ct = new_space();
    let (node, counter) = counted_node(test_util::user_va_block(), PAGE_SIZE);

    ct.space().submit_shootdown(node);

    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(ct.space().queue_sequences().is_empty());
}

#[test]
fn activate_binds_and_programs_the_root() {
    let _cpu = test_util::adopt_cpu(true);
    let ct = new_space();

    take_tlb_ops();
    PageSpace::activate(ct.space());

    assert_eq!(
        take_tlb_ops(),
        vec![
            TlbOp::FlushPcidAll(1),
            TlbOp::SetRoot {
                root: ct.space().root_table(),
                pcid: 1,
                preserve: true,
            },
        ]
    );
    assert_eq!(ct.space().num_bindings(), 1);
}

#[test]
fn warm_binding_switch_keeps_other_tags() {
    let _cpu = test_util::adopt_cpu(true);
    let a = new_space();
    let b = new_space();

    PageSpace::activate(a.space());
    take_tlb_ops();

    PageSpace::activate(b.space());
    assert_eq!(
        take_tlb_ops(),
        vec![
            TlbOp::FlushPcidAll(2),
            TlbOp::SetRoot {
                root: b.space().root_table(),
                pcid: 2,
                preserve: true,
            },
        ]
    );

    // Back to the warm binding: nothing of tag 1 is flushed, only the
    // root pointer is rewritten (with the no-invalidate bit).
    PageSpace::activate(a.space());
    assert_eq!(
        take_tlb_ops(),
        vec![TlbOp::SetRoot {
            root: a.space().root_table(),
            pcid: 1,
            preserve: true,
        }]
    );

    // Re-activating the primary space is free.
    PageSpace::activate(a.space());
    assert!(take_tlb_ops().is_empty());
}

#[test]
fn activation_evicts_the_least_recently_primary_binding() {
    let _cpu = test_util::adopt_cpu(true);
    let spaces: Vec<ClientPageTable> = (0..=NR_PCID_BINDINGS).map(|_| new_space()).collect();

    for space in &spaces[..NR_PCID_BINDINGS] {
        PageSpace::activate(space.space());
    }
    for space in &spaces[..NR_PCID_BINDINGS] {
        assert_eq!(space.space().num_bindings(), 1);
    }

    take_tlb_ops();
    PageSpace::activate(spaces[NR_PCID_BINDINGS].space());

    // The first-activated binding carried the smallest stamp.
    assert_eq!(spaces[0].space().num_bindings(), 0);
    assert_eq!(spaces[NR_PCID_BINDINGS].space().num_bindings(), 1);
    for space in &spaces[1..NR_PCID_BINDINGS] {
        assert_eq!(space.space().num_bindings(), 1);
    }
    assert_eq!(
        take_tlb_ops(),
        vec![
            TlbOp::FlushPcidAll(1),
            TlbOp::SetRoot {
                root: spaces[NR_PCID_BINDINGS].space().root_table(),
                pcid: 1,
                preserve: true,
            },
        ]
    );
}

#[test]
fn cross_cpu_shootdown_completes_each_node_once() {
    let cpu0 = test_util::adopt_cpu(true);
    let cpu1 = test_util::adopt_cpu(true);
    let ct = new_space();

    test_util::switch_to(cpu0);
    PageSpace::activate(ct.space());
    test_util::switch_to(cpu1);
    PageSpace::activate(ct.space());

    let va = test_util::user_va_block();
    let (first, first_counter) = counted_node(va, PAGE_SIZE);
    let (second, second_counter) = counted_node(va + PAGE_SIZE, 2 * PAGE_SIZE);
    ct.space().submit_shootdown(first);
    ct.space().submit_shootdown(second);
    assert_eq!(ct.space().queue_sequences(), vec![1, 2]);

    test_util::switch_to(cpu0);
    take_tlb_ops();
    smp::handle_shootdown_ipi();
    // The backward scan invalidates the newer node's pages first, each by
    // (PCID, address).
    assert_eq!(
        take_tlb_ops(),
        vec![
            TlbOp::FlushAddrForPcid(va + PAGE_SIZE, 1),
            TlbOp::FlushAddrForPcid(va + 2 * PAGE_SIZE, 1),
            TlbOp::FlushAddrForPcid(va, 1),
        ]
    );
    // One binding is still outstanding on each node.
    assert_eq!(first_counter.load(Ordering::Relaxed), 0);
    assert_eq!(second_counter.load(Ordering::Relaxed), 0);
    assert_eq!(ct.space().queue_sequences(), vec![1, 2]);

    test_util::switch_to(cpu1);
    smp::handle_shootdown_ipi();
    assert_eq!(first_counter.load(Ordering::Relaxed), 1);
    assert_eq!(second_counter.load(Ordering::Relaxed), 1);
    assert!(ct.space().queue_sequences().is_empty());

    // Both bindings are caught up; another scan is a no-op.
    take_tlb_ops();
    smp::handle_shootdown_ipi();
    assert!(take_tlb_ops().is_empty());
    assert_eq!(first_counter.load(Ordering::Relaxed), 1);
}

#[test]
fn rebind_absorbs_pending_shootdowns() {
    let _cpu = test_util::adopt_cpu(false);
    let a = new_space();
    let b = new_space();

    PageSpace::activate(a.space());
    let (node, counter) = counted_node(test_util::user_va_block(), PAGE_SIZE);
    a.space().submit_shootdown(node);
    assert_eq!(counter.load(Ordering::Relaxed), 0);
    assert_eq!(a.space().queue_sequences(), vec![1]);

    // The IPI has not been seen on this CPU; switching away hands off the
    // binding's charge instead.
    take_tlb_ops();
    PageSpace::activate(b.space());

    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(a.space().queue_sequences().is_empty());
    assert_eq!(a.space().num_bindings(), 0);
    assert_eq!(b.space().num_bindings(), 1);
    // No PCIDs here: a plain root write flushes everything non-global.
    assert_eq!(
        take_tlb_ops(),
        vec![TlbOp::SetRoot {
            root: b.space().root_table(),
            pcid: 0,
            preserve: false,
        }]
    );
}

#[test]
fn dead_space_invalidates_the_tag_lazily() {
    let _cpu = test_util::adopt_cpu(true);
    let ct = new_space();
    PageSpace::activate(ct.space());

    // All strong references go away while the binding still points there.
    drop(ct);

    take_tlb_ops();
    smp::handle_shootdown_ipi();
    assert_eq!(take_tlb_ops(), vec![TlbOp::FlushPcidAll(1)]);

    // The weak reference was cleared; nothing is left to do.
    smp::handle_shootdown_ipi();
    assert!(take_tlb_ops().is_empty());
}

#[test]
fn binding_created_after_submission_is_not_charged() {
    let cpu0 = test_util::adopt_cpu(true);
    let cpu1 = test_util::adopt_cpu(true);
    let ct = new_space();

    test_util::switch_to(cpu0);
    PageSpace::activate(ct.space());
    let (node, counter) = counted_node(test_util::user_va_block(), PAGE_SIZE);
    ct.space().submit_shootdown(node);

    // This binding starts caught up: the node does not wait for it.
    test_util::switch_to(cpu1);
    PageSpace::activate(ct.space());
    take_tlb_ops();
    smp::handle_shootdown_ipi();
    assert!(!take_tlb_ops()
        .iter()
        .any(|op| matches!(op, TlbOp::FlushAddrForPcid(..))));
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    test_util::switch_to(cpu0);
    smp::handle_shootdown_ipi();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
    assert!(ct.space().queue_sequences().is_empty());
}

#[test]
fn shootdown_without_pcids_flushes_by_address() {
    let _cpu = test_util::adopt_cpu(false);
    let ct = new_space();
    PageSpace::activate(ct.space());

    let va = test_util::user_va_block();
    let (node, counter) = counted_node(va, 2 * PAGE_SIZE);
    ct.space().submit_shootdown(node);

    take_tlb_ops();
    smp::handle_shootdown_ipi();
    assert_eq!(
        take_tlb_ops(),
        vec![TlbOp::FlushAddr(va), TlbOp::FlushAddr(va + PAGE_SIZE)]
    );
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn queue_stays_sorted_by_sequence() {
    let _cpu = test_util::adopt_cpu(true);
    let ct = new_space();
    PageSpace::activate(ct.space());

    let va = test_util::user_va_block();
    for nth in 0..3 {
        ct.space()
            .submit_shootdown(ShootNode::new(va + nth * PAGE_SIZE, PAGE_SIZE, || {}));
    }
    assert_eq!(ct.space().queue_sequences(), vec![1, 2, 3]);

    smp::handle_shootdown_ipi();
    assert!(ct.space().queue_sequences().is_empty());
}

#[test]
#[should_panic(expected = "page-aligned")]
fn misaligned_shootdown_is_a_bug() {
    let _cpu = test_util::adopt_cpu(true);
    let ct = new_space();
    PageSpace::activate(ct.space());

    ct.space()
        .submit_shootdown(ShootNode::new(0x123, PAGE_SIZE, || {}));
    smp::handle_shootdown_ipi();
}
