// SPDX-License-Identifier: MPL-2.0

//! TLB coherence across address spaces and CPUs.
//!
//! Every CPU owns a small, fixed array of [`PageBinding`]s, one per
//! hardware context tag (PCID). A binding associates its tag with one
//! [`PageSpace`]; the binding whose root table is currently programmed
//! into the MMU is the CPU's primary binding. Switching address spaces
//! reuses a warm binding when one exists and otherwise evicts the least
//! recently primary one, so TLB contents tagged with other PCIDs survive
//! the switch.
//!
//! When a mapping is torn down, the owner submits a [`ShootNode`] to the
//! space. The node receives the space's next sequence number, is charged
//! with the number of live bindings, and every CPU is poked through the
//! IPI doorbell. Each binding catches up by scanning the space's queue
//! backwards from the tail down to the last sequence it has already
//! processed, invalidating locally as it goes. Because sequences are
//! monotone and every binding only moves forward, each binding visits each
//! node at most once; total shootdown cost is proportional to the
//! outstanding work. The binding that drops a node's charge to zero
//! removes it from the queue and fires its completion callback outside all
//! locks.
//!
//! Lock order: a CPU's paging-state lock may nest around space locks, and
//! never are two space locks held at once ([`PageBinding::rebind`] takes
//! the old space's lock and releases it before taking the new one).

use alloc::collections::VecDeque;
use alloc::sync::Weak;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use static_assertions::const_assert;

use crate::{
    arch,
    cpu::local::CpuLocal,
    irq,
    mm::PAGE_SIZE,
    prelude::*,
    smp,
    sync::SpinLock,
};

#[cfg(test)]
mod test;

/// The number of PCID binding slots on each CPU.
pub const NR_PCID_BINDINGS: usize = 8;

// Context tags 1..=NR_PCID_BINDINGS must fit the 12-bit PCID field.
const_assert!(NR_PCID_BINDINGS < 4096);

/// One pending cross-CPU TLB invalidation request.
///
/// Submitted to a [`PageSpace`] via [`PageSpace::submit_shootdown`]. The
/// completion closure runs exactly once, when the last charged binding has
/// invalidated the range (or synchronously during submission if no binding
/// holds the space).
pub struct ShootNode {
    address: Vaddr,
    size: usize,
    sequence: u64,
    bindings_to_shoot: AtomicUsize,
    on_shot_down: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
}

impl ShootNode {
    /// Creates a request to invalidate `address..address + size`.
    ///
    /// `address` must be page-aligned and `size` a multiple of the page
    /// size.
    pub fn new(address: Vaddr, size: usize, on_shot_down: impl FnOnce() + Send + 'static) -> Self {
        Self {
            address,
            size,
            sequence: 0,
            bindings_to_shoot: AtomicUsize::new(0),
            on_shot_down: SpinLock::new(Some(Box::new(on_shot_down))),
        }
    }

    /// The start of the range to invalidate.
    pub fn address(&self) -> Vaddr {
        self.address
    }

    /// The length of the range to invalidate.
    pub fn size(&self) -> usize {
        self.size
    }

    fn complete(&self) {
        let callback = self.on_shot_down.lock_irq_disabled().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Fires completions in submission order.
fn complete_all(nodes: Vec<Arc<ShootNode>>) {
    // Backward scans collect newest-first.
    for node in nodes.into_iter().rev() {
        node.complete();
    }
}

/// An address space, from the point of view of the TLB.
///
/// A `PageSpace` owns the root table frame of one address space and tracks
/// how many CPU bindings currently hold its translations. It is the unit
/// of activation and of shootdown bookkeeping; the kernel and client page
/// tables each compose one.
pub struct PageSpace {
    root_table: Paddr,
    inner: SpinLock<SpaceInner>,
}

struct SpaceInner {
    /// The number of `PageBinding`s whose bound space is this one.
    num_bindings: usize,
    /// Monotone counter stamping shootdown submissions. Pre-incremented so
    /// a binding that snapshots the counter at rebind is charged exactly
    /// for the nodes submitted after the snapshot.
    shoot_sequence: u64,
    /// In-flight shootdowns, strictly ascending by sequence.
    shoot_queue: VecDeque<Arc<ShootNode>>,
}

impl PageSpace {
    pub(crate) fn new(root_table: Paddr) -> Self {
        debug_assert_eq!(root_table % PAGE_SIZE, 0);
        Self {
            root_table,
            inner: SpinLock::new(SpaceInner {
                num_bindings: 0,
                shoot_sequence: 0,
                shoot_queue: VecDeque::new(),
            }),
        }
    }

    /// The physical frame of this space's root table.
    pub fn root_table(&self) -> Paddr {
        self.root_table
    }

    /// Submits a shootdown of the node's range to every CPU that holds
    /// this space.
    ///
    /// Does not wait: completion is delivered through the node's callback.
    /// If no binding holds the space, the node completes synchronously
    /// before this returns.
    pub fn submit_shootdown(&self, mut node: ShootNode) {
        let mut inner = self.inner.lock_irq_disabled();
        if inner.num_bindings == 0 {
            drop(inner);
            node.complete();
            return;
        }

        inner.shoot_sequence += 1;
        node.sequence = inner.shoot_sequence;
        node.bindings_to_shoot
            .store(inner.num_bindings, Ordering::Relaxed);
        debug_assert!(inner
            .shoot_queue
            .back()
            .map_or(true, |tail| tail.sequence < node.sequence));
        inner.shoot_queue.push_back(Arc::new(node));
        drop(inner);

        smp::send_shootdown_ipi();
    }

    /// Makes `space` the active address space on the current CPU.
    ///
    /// Reuses a warm binding when the space is already bound here;
    /// otherwise rebinds the least recently primary slot (slot 0 on CPUs
    /// without PCIDs).
    pub fn activate(space: &Arc<PageSpace>) {
        let irq_guard = irq::disable_local();
        let mut state = PAGE_STATE.get_with(&irq_guard).lock();
        assert!(state.initialized, "paging used before per-CPU init");
        let completions = state.activate(space);
        drop(state);
        drop(irq_guard);
        complete_all(completions);
    }

    #[cfg(test)]
    pub(crate) fn num_bindings(&self) -> usize {
        self.inner.lock_irq_disabled().num_bindings
    }

    #[cfg(test)]
    pub(crate) fn queue_sequences(&self) -> Vec<u64> {
        self.inner
            .lock_irq_disabled()
            .shoot_queue
            .iter()
            .map(|node| node.sequence)
            .collect()
    }
}

/// Scans `inner`'s queue backwards while the sequence exceeds
/// `already_shot`, calling `visit` on each node and taking over its
/// charge. Nodes whose charge reaches zero are unlinked and returned for
/// completion (newest first).
fn scan_queue(
    inner: &mut SpaceInner,
    already_shot: u64,
    mut visit: impl FnMut(&ShootNode),
) -> Vec<Arc<ShootNode>> {
    let mut completions = Vec::new();
    let mut index = inner.shoot_queue.len();
    while index > 0 {
        index -= 1;
        let node = &inner.shoot_queue[index];
        if node.sequence <= already_shot {
            break;
        }
        visit(node);
        // The binding that observes the transition to zero acquires the
        // node for completion.
        if node.bindings_to_shoot.fetch_sub(1, Ordering::AcqRel) == 1 {
            let node = inner.shoot_queue.remove(index).unwrap();
            completions.push(node);
        }
    }
    completions
}

/// The association of one context tag on one CPU with an address space.
///
/// Bindings hold their space weakly: a space may die while bindings still
/// point at it, and the binding then lazily invalidates the tag when it
/// next notices (see [`Self::shootdown`]).
struct PageBinding {
    /// The hardware context tag, assigned once at CPU bring-up. 0 means
    /// "no PCID".
    pcid: u16,
    bound_space: Option<Weak<PageSpace>>,
    /// Forces the next `make_primary` to rewrite the root-pointer register
    /// even if this binding is already primary.
    was_rebound: bool,
    /// When this binding last became primary, for LRU eviction.
    primary_stamp: u64,
    /// The newest shootdown sequence of the bound space that this binding
    /// has already processed.
    already_shot_sequence: u64,
}

impl PageBinding {
    const fn new() -> Self {
        Self {
            pcid: 0,
            bound_space: None,
            was_rebound: false,
            primary_stamp: 0,
            already_shot_sequence: 0,
        }
    }

    fn bound_space(&self) -> Option<Arc<PageSpace>> {
        self.bound_space.as_ref().and_then(Weak::upgrade)
    }

    /// Points this binding at another space.
    ///
    /// Any queue entries of the old space that this binding was charged
    /// for are handed off here: the binding decrements them as if it had
    /// scanned them, which may complete nodes (returned to the caller to
    /// fire outside all locks). The binding starts caught up on the new
    /// space: nodes submitted before the rebind do not wait for it.
    fn rebind(&mut self, space: &Arc<PageSpace>, have_pcids: bool) -> Vec<Arc<ShootNode>> {
        let unbound = self.bound_space();
        if unbound.as_ref().is_some_and(|u| Arc::ptr_eq(u, space)) {
            return Vec::new();
        }

        // Entries tagged with this PCID belong to the old space.
        if have_pcids {
            arch::mm::tlb_flush_pcid_all(self.pcid);
        }

        self.was_rebound = true;

        let mut completions = Vec::new();
        if let Some(unbound) = unbound {
            let mut inner = unbound.inner.lock_irq_disabled();
            completions = scan_queue(&mut inner, self.already_shot_sequence, |_node| ());
            inner.num_bindings -= 1;
        }

        let target_sequence;
        {
            let mut inner = space.inner.lock_irq_disabled();
            target_sequence = inner.shoot_sequence;
            inner.num_bindings += 1;
        }
        self.bound_space = Some(Arc::downgrade(space));
        self.already_shot_sequence = target_sequence;

        completions
    }

    /// Catches this binding up with its space's shootdown queue.
    ///
    /// Runs on the CPU owning the binding when a shootdown IPI arrives. If
    /// the space has died, the stale tag is invalidated and the binding
    /// forgets it; the queue of a dead space needs no processing since no
    /// CPU can activate it again.
    fn shootdown(&mut self, have_pcids: bool) -> Vec<Arc<ShootNode>> {
        debug_assert!(have_pcids || self.pcid == 0);

        let Some(weak) = self.bound_space.as_ref() else {
            return Vec::new();
        };
        let Some(space) = weak.upgrade() else {
            if have_pcids {
                arch::mm::tlb_flush_pcid_all(self.pcid);
            }
            self.bound_space = None;
            return Vec::new();
        };

        let target_sequence;
        let completions;
        {
            let mut inner = space.inner.lock_irq_disabled();
            if inner.shoot_queue.is_empty() {
                return Vec::new();
            }
            target_sequence = inner.shoot_queue.back().unwrap().sequence;

            let pcid = self.pcid;
            completions = scan_queue(&mut inner, self.already_shot_sequence, |node| {
                assert_eq!(node.address % PAGE_SIZE, 0, "shoot range must be page-aligned");
                assert_eq!(node.size % PAGE_SIZE, 0, "shoot range must be page-aligned");
                trace!(
                    "shooting down {:#x}..{:#x} (pcid {})",
                    node.address,
                    node.address + node.size,
                    pcid
                );
                for progress in (0..node.size).step_by(PAGE_SIZE) {
                    if have_pcids {
                        arch::mm::tlb_flush_addr_for_pcid(node.address + progress, pcid);
                    } else {
                        arch::mm::tlb_flush_addr(node.address + progress);
                    }
                }
            });
        }
        self.already_shot_sequence = target_sequence;

        completions
    }
}

/// Per-CPU context for paging.
struct PageContext {
    /// Timestamp source for the LRU mechanism of PCIDs.
    next_stamp: u64,
    /// The binding currently reflected in the MMU root-pointer register.
    primary_binding: Option<usize>,
}

/// All the paging state one CPU owns.
struct CpuPageState {
    initialized: bool,
    have_pcids: bool,
    context: PageContext,
    bindings: [PageBinding; NR_PCID_BINDINGS],
}

impl CpuPageState {
    const fn new() -> Self {
        const UNBOUND: PageBinding = PageBinding::new();
        Self {
            initialized: false,
            have_pcids: false,
            context: PageContext {
                next_stamp: 1,
                primary_binding: None,
            },
            bindings: [UNBOUND; NR_PCID_BINDINGS],
        }
    }

    fn activate(&mut self, space: &Arc<PageSpace>) -> Vec<Arc<ShootNode>> {
        let mut victim = 0;
        for index in 0..NR_PCID_BINDINGS {
            // If the space is currently bound, always keep that binding:
            // its tagged TLB entries are still warm.
            let bound = self.bindings[index].bound_space();
            if bound.is_some_and(|bound| Arc::ptr_eq(&bound, space)) {
                self.make_primary(index);
                return Vec::new();
            }

            // Without PCIDs only the first binding is ever used.
            if !self.have_pcids {
                break;
            }

            if self.bindings[index].primary_stamp < self.bindings[victim].primary_stamp {
                victim = index;
            }
        }

        let completions = self.bindings[victim].rebind(space, self.have_pcids);
        self.make_primary(victim);
        completions
    }

    fn make_primary(&mut self, index: usize) {
        debug_assert!(self.have_pcids || self.bindings[index].pcid == 0);

        let binding = &self.bindings[index];
        // If this binding is already primary, the root pointer may be
        // up to date; rewrite it only after a rebind.
        if binding.was_rebound || self.context.primary_binding != Some(index) {
            let space = binding
                .bound_space()
                .expect("the primary binding must refer to a live space");
            // SAFETY: the space is alive and owns a valid root table; the
            // no-invalidate bit keeps other tags only when PCIDs exist.
            unsafe { arch::mm::activate_root(space.root_table(), binding.pcid, self.have_pcids) };
        }

        let binding = &mut self.bindings[index];
        binding.was_rebound = false;
        binding.primary_stamp = self.context.next_stamp;
        self.context.next_stamp += 1;
        self.context.primary_binding = Some(index);
    }

    fn shootdown_all(&mut self) -> Vec<Arc<ShootNode>> {
        let have_pcids = self.have_pcids;
        let mut completions = Vec::new();
        for binding in self.bindings.iter_mut() {
            completions.extend(binding.shootdown(have_pcids));
        }
        completions
    }
}

static PAGE_STATE: CpuLocal<SpinLock<CpuPageState>> =
    CpuLocal::new(|| SpinLock::new(CpuPageState::new()));

/// Initializes the paging state of the current CPU.
///
/// Must run once per CPU during bring-up, after the CPU's PCID capability
/// has been probed. On PCID-capable CPUs the binding slots receive the
/// distinct context tags `1..=NR_PCID_BINDINGS`; tag assignment happens
/// exactly once.
pub fn init_current_cpu(have_pcids: bool) {
    let irq_guard = irq::disable_local();
    let mut state = PAGE_STATE.get_with(&irq_guard).lock();
    assert!(!state.initialized, "per-CPU paging state initialized twice");
    state.initialized = true;
    state.have_pcids = have_pcids;
    if have_pcids {
        for (index, binding) in state.bindings.iter_mut().enumerate() {
            assert_eq!(binding.pcid, 0);
            binding.pcid = (index + 1) as u16;
        }
    }
}

/// Lets every binding of the current CPU catch up with its space's
/// shootdown queue. The local half of [`smp::handle_shootdown_ipi`].
pub(crate) fn process_pending_shootdowns() {
    let irq_guard = irq::disable_local();
    let mut state = PAGE_STATE.get_with(&irq_guard).lock();
    let completions = state.shootdown_all();
    drop(state);
    drop(irq_guard);
    complete_all(completions);
}
