//! Ownership properties over generated transition sequences
//!
//! Transition sequences are proptest strategies; illegal transitions are
//! refused by the tracker and the properties must hold either way.

use proptest::prelude::*;
use seqbox::config::presets::CodeTable;
use seqbox::config::types::{ErrorKind, OwnershipState};
use seqbox::core::library::{NativeCall, TargetLibrary};
use seqbox::core::types::{HandleId, HandleKind, NativeHandle, OperationId, RawSignal};
use seqbox::ownership::{Owner, OwnershipTracker, TransitionAction};
use seqbox::safety::cleanup::CleanupGuarantor;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One generated tracker transition. Handle positions are taken modulo the
/// number of candidates at the time the step runs.
#[derive(Clone, Debug)]
enum Step {
    Register { parent: Option<usize> },
    Reference { target: usize, holder: Option<usize> },
    Reparent { handle: usize, to: Target },
    Release { handle: usize, cascade: bool },
    DropReference { handle: usize },
}

#[derive(Clone, Copy, Debug)]
enum Target {
    Detach,
    Root,
    Handle(usize),
}

fn arb_target() -> impl Strategy<Value = Target> {
    prop_oneof![
        Just(Target::Detach),
        Just(Target::Root),
        (0..64usize).prop_map(Target::Handle),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => proptest::option::of(0..64usize).prop_map(|parent| Step::Register { parent }),
        1 => (0..64usize, proptest::option::of(0..64usize))
            .prop_map(|(target, holder)| Step::Reference { target, holder }),
        1 => (0..64usize, arb_target()).prop_map(|(handle, to)| Step::Reparent { handle, to }),
        2 => (0..64usize, any::<bool>())
            .prop_map(|(handle, cascade)| Step::Release { handle, cascade }),
        1 => (0..64usize).prop_map(|handle| Step::DropReference { handle }),
    ]
}

fn pick(ids: &[HandleId], at: usize) -> Option<HandleId> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[at % ids.len()])
    }
}

/// Library that frees anything and counts destroys per native address.
#[derive(Default)]
struct Ledger {
    frees: Arc<Mutex<BTreeMap<u64, u32>>>,
    destructor: Option<&'static str>,
}

impl Ledger {
    fn with_destructor() -> Self {
        Self {
            destructor: Some("ledger_free"),
            ..Self::default()
        }
    }
}

impl TargetLibrary for Ledger {
    fn name(&self) -> &str {
        "ledger"
    }

    fn kinds(&self) -> Vec<HandleKind> {
        vec![HandleKind::new("ledger.node")]
    }

    fn create(&mut self, _call: &NativeCall) -> RawSignal {
        RawSignal::unsupported("create")
    }

    fn mutate(&mut self, _call: &NativeCall) -> RawSignal {
        RawSignal::unsupported("mutate")
    }

    fn query(&mut self, _call: &NativeCall) -> RawSignal {
        RawSignal::unsupported("query")
    }

    fn destroy(&mut self, call: &NativeCall) -> RawSignal {
        if let Some(native) = call.handle_at(0) {
            *self.frees.lock().unwrap().entry(native.0).or_insert(0) += 1;
        }
        RawSignal::Void
    }

    fn destructor(&self, _kind: &HandleKind) -> Option<&'static str> {
        self.destructor
    }

    fn detach(&mut self, _parent: NativeHandle, _child: NativeHandle) -> RawSignal {
        RawSignal::Void
    }
}

fn node() -> HandleKind {
    HandleKind::new("ledger.node")
}

/// Apply `steps` to a fresh tracker; illegal ones are refused.
fn apply(steps: &[Step]) -> OwnershipTracker {
    let mut tracker = OwnershipTracker::new();
    let mut next_native = 0x1000u64;

    for (n, step) in steps.iter().enumerate() {
        let op = Some(OperationId(n as u32 + 1));
        let owned: Vec<HandleId> = tracker
            .entries()
            .filter(|e| !e.is_reference())
            .map(|e| e.id)
            .collect();
        let references: Vec<HandleId> = tracker
            .entries()
            .filter(|e| e.is_reference())
            .map(|e| e.id)
            .collect();

        match *step {
            Step::Register { parent } => {
                next_native += 0x10;
                let owner = parent
                    .and_then(|at| pick(&owned, at))
                    .map(Owner::Handle)
                    .unwrap_or(Owner::Root);
                let _ = tracker.register(NativeHandle(next_native), node(), owner, op);
            }
            Step::Reference { target, holder } => {
                if let Some(target) = pick(&owned, target) {
                    let native = tracker.get(target).map(|e| e.native).unwrap();
                    let holder = holder.and_then(|at| pick(&owned, at));
                    let _ = tracker.mark_reference(native, node(), target, holder, op);
                }
            }
            Step::Reparent { handle, to } => {
                if let Some(id) = pick(&owned, handle) {
                    let new_owner = match to {
                        Target::Detach => None,
                        Target::Root => Some(Owner::Root),
                        Target::Handle(at) => pick(&owned, at).map(Owner::Handle),
                    };
                    let _ = tracker.reparent(id, new_owner, op);
                }
            }
            Step::Release { handle, cascade } => {
                if let Some(id) = pick(&owned, handle) {
                    let _ = tracker.release(id, cascade, op);
                }
            }
            Step::DropReference { handle } => {
                if let Some(id) = pick(&references, handle) {
                    let _ = tracker.drop_reference(id, op);
                }
            }
        }
    }
    tracker
}

fn releases_per_handle(tracker: &OwnershipTracker) -> BTreeMap<HandleId, usize> {
    let mut counts = BTreeMap::new();
    for t in tracker.journal() {
        if matches!(
            t.action,
            TransitionAction::Release | TransitionAction::CascadeRelease
        ) {
            *counts.entry(t.handle).or_insert(0) += 1;
        }
    }
    counts
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// No legal or refused sequence releases a handle twice.
    #[test]
    fn prop_release_is_observed_at_most_once(
        steps in proptest::collection::vec(arb_step(), 1..80),
    ) {
        let tracker = apply(&steps);
        for entry in tracker.entries() {
            prop_assert!(entry.releases <= 1, "{} released {} times", entry.id, entry.releases);
        }
        for (handle, count) in releases_per_handle(&tracker) {
            prop_assert_eq!(count, 1, "{} journaled {} releases", handle, count);
        }
    }

    /// The drain frees every live handle once and a second drain is a no-op.
    #[test]
    fn prop_drain_leaves_nothing_live(
        steps in proptest::collection::vec(arb_step(), 1..60),
    ) {
        let mut tracker = apply(&steps);
        let mut ledger = Ledger::with_destructor();
        let frees = Arc::clone(&ledger.frees);
        let table = CodeTable::generic("ledger");
        let mut guarantor = CleanupGuarantor::new();

        let report = guarantor.drain(&mut tracker, &mut ledger, &table);
        prop_assert!(report.errors.is_empty(), "{:?}", report.errors);
        prop_assert!(tracker.finalize().is_empty());
        prop_assert!(tracker.leaked().is_empty());
        prop_assert!(frees.lock().unwrap().values().all(|n| *n == 1));
        for entry in tracker.entries() {
            prop_assert!(entry.releases <= 1, "{}", entry.id);
        }

        let again = guarantor.drain(&mut tracker, &mut ledger, &table);
        prop_assert!(again.already_drained);
        prop_assert!(again.steps.is_empty());
    }

    /// Freed owners and freed handles are refused as InvalidArgument, never
    /// as a fatal dangling reference.
    #[test]
    fn prop_moves_involving_freed_handles_are_invalid_argument(
        steps in proptest::collection::vec(arb_step(), 1..40),
    ) {
        let mut tracker = apply(&steps);
        let freed: Vec<HandleId> = tracker
            .entries()
            .filter(|e| !e.is_reference() && e.state == OwnershipState::Freed)
            .map(|e| e.id)
            .collect();
        for id in freed {
            let err = tracker.reparent(id, Some(Owner::Root), None).unwrap_err();
            prop_assert_eq!(err.kind, ErrorKind::InvalidArgument);
            let err = tracker
                .register(NativeHandle(0xdead_0000 + id.0), node(), Owner::Handle(id), None)
                .unwrap_err();
            prop_assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
    }
}

#[test]
fn test_missing_destructor_marks_subtree_leaked() {
    let mut tracker = OwnershipTracker::new();
    let root = tracker
        .register(NativeHandle(0x10), node(), Owner::Root, None)
        .unwrap();
    let child = tracker
        .register(NativeHandle(0x20), node(), Owner::Handle(root), None)
        .unwrap();
    let mut ledger = Ledger::default();
    let report = CleanupGuarantor::new().drain(
        &mut tracker,
        &mut ledger,
        &CodeTable::generic("ledger"),
    );

    assert!(report.steps.is_empty());
    assert!(report.leaked.contains(&root));
    assert!(report.leaked.contains(&child));
    assert_eq!(tracker.state(child), Some(OwnershipState::Leaked));
    assert!(tracker.finalize().is_empty());
}

#[test]
fn test_releasing_a_reference_is_invalid_argument() {
    let mut tracker = OwnershipTracker::new();
    let target = tracker
        .register(NativeHandle(0x10), node(), Owner::Root, None)
        .unwrap();
    let alias = tracker
        .mark_reference(NativeHandle(0x10), node(), target, None, None)
        .unwrap();

    let err = tracker.release(alias, true, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(tracker.state(target), Some(OwnershipState::Owned));
    assert_eq!(tracker.release_count(alias), 0);
}

#[test]
fn test_second_release_is_double_free_and_journaled() {
    let mut tracker = OwnershipTracker::new();
    let id = tracker
        .register(NativeHandle(0x10), node(), Owner::Root, None)
        .unwrap();
    tracker.release(id, true, Some(OperationId(1))).unwrap();

    let err = tracker.release(id, true, Some(OperationId(2))).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DoubleFree);
    assert_eq!(tracker.release_count(id), 1);
    assert_eq!(tracker.count_actions(TransitionAction::DoubleFreeBlocked), 1);
}

#[test]
fn test_reference_to_freed_handle_dangles() {
    let mut tracker = OwnershipTracker::new();
    let holder = tracker
        .register(NativeHandle(0x10), node(), Owner::Root, None)
        .unwrap();
    let target = tracker
        .register(NativeHandle(0x20), node(), Owner::Root, None)
        .unwrap();
    let alias = tracker
        .mark_reference(NativeHandle(0x20), node(), target, Some(holder), None)
        .unwrap();
    tracker.release(target, true, None).unwrap();

    let err = tracker.resolve(alias).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DanglingReference);
}
