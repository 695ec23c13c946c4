/// Cleanup guarantor
///
/// Scoped acquisition of owned handles. Every Owned handle gets one move-only
/// [`Guard`]; guards nest the way ownership nests, so attaching a child moves
/// its guard under the parent's and detaching moves it back out. At the end
/// of a run the guarantor drains whatever the tracker still reports as live:
/// leaves before ancestors, siblings in reverse registration order, each
/// detached from its parent first and released with the canonical destructor
/// of its kind. The drain is idempotent.
use crate::config::presets::CodeTable;
use crate::config::types::{ErrorKind, OwnershipState};
use crate::core::library::{Arg, NativeCall, TargetLibrary};
use crate::core::script::Capability;
use crate::core::types::{HandleId, HandleKind, NativeHandle};
use crate::ownership::tracker::{OwnershipTracker, OwnershipViolation, TrackerResult};
use crate::verdict::classifier::{Classification, ErrorClassifier, ExpectedShape};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Release obligation for one owned handle
///
/// Not `Clone`: there is exactly one guard per owned handle. Dropping a guard
/// that is still armed means the obligation was lost and is logged.
#[derive(Debug)]
pub struct Guard {
    handle: HandleId,
    kind: HandleKind,
    native: NativeHandle,
    children: Vec<Guard>,
    armed: bool,
}

impl Guard {
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    pub fn native(&self) -> NativeHandle {
        self.native
    }

    /// Child guards held under this one
    pub fn children(&self) -> impl Iterator<Item = &Guard> {
        self.children.iter()
    }

    /// Disarm this guard and its subtree. Returns how many were disarmed.
    fn disarm(mut self) -> usize {
        self.armed = false;
        let children = std::mem::take(&mut self.children);
        1 + children.into_iter().map(Guard::disarm).sum::<usize>()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "guard for {} ({}) dropped while still armed",
                self.handle, self.kind
            );
        }
    }
}

/// Outcome of one drain step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeardownStep {
    pub handle: HandleId,
    pub kind: HandleKind,
    /// Destructor used
    pub function: String,
    /// Handles freed by the call (more than one when it cascaded)
    pub freed: Vec<HandleId>,
}

/// Summary of a guarantor drain
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
    /// Native detaches performed
    pub detaches: usize,
    /// Handles left to an ancestor's cascading release
    pub fallbacks: Vec<HandleId>,
    pub leaked: Vec<HandleId>,
    pub errors: Vec<String>,
    /// Set when the drain had already run
    pub already_drained: bool,
}

impl TeardownReport {
    pub fn freed_count(&self) -> usize {
        self.steps.iter().map(|s| s.freed.len()).sum()
    }
}

#[derive(Debug, Default)]
pub struct CleanupGuarantor {
    /// Guards owned by the run root (or detached)
    roots: Vec<Guard>,
    drained: bool,
    cleanup_errors: Vec<String>,
}

fn find_mut(guards: &mut [Guard], id: HandleId) -> Option<&mut Guard> {
    for guard in guards.iter_mut() {
        if guard.handle == id {
            return Some(guard);
        }
        if let Some(found) = find_mut(&mut guard.children, id) {
            return Some(found);
        }
    }
    None
}

fn find(guards: &[Guard], id: HandleId) -> Option<&Guard> {
    for guard in guards {
        if guard.handle == id {
            return Some(guard);
        }
        if let Some(found) = find(&guard.children, id) {
            return Some(found);
        }
    }
    None
}

fn take_from(guards: &mut Vec<Guard>, id: HandleId) -> Option<Guard> {
    if let Some(pos) = guards.iter().position(|g| g.handle == id) {
        return Some(guards.remove(pos));
    }
    for guard in guards.iter_mut() {
        if let Some(found) = take_from(&mut guard.children, id) {
            return Some(found);
        }
    }
    None
}

fn count_armed(guards: &[Guard]) -> usize {
    guards
        .iter()
        .map(|g| g.armed as usize + count_armed(&g.children))
        .sum()
}

impl CleanupGuarantor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard for an owned handle. References carry no release
    /// obligation and are refused.
    pub fn acquire(&self, tracker: &OwnershipTracker, id: HandleId) -> TrackerResult<Guard> {
        let entry = tracker.resolve(id)?;
        if entry.state == OwnershipState::Reference {
            return Err(OwnershipViolation {
                kind: ErrorKind::InvalidArgument,
                handle: Some(id),
                detail: format!("{} is a reference and cannot be guarded", id),
            });
        }
        if self.holds(id) {
            return Err(OwnershipViolation {
                kind: ErrorKind::InvalidArgument,
                handle: Some(id),
                detail: format!("{} is already guarded", id),
            });
        }
        Ok(Guard {
            handle: id,
            kind: entry.kind.clone(),
            native: entry.native,
            children: Vec::new(),
            armed: true,
        })
    }

    /// Hold a guard under `owner` (the root when None or when the owner has
    /// no guard of its own).
    pub fn hold(&mut self, guard: Guard, owner: Option<HandleId>) {
        match owner.and_then(|p| find_mut(&mut self.roots, p)) {
            Some(parent) => parent.children.push(guard),
            None => self.roots.push(guard),
        }
    }

    /// Take a guard (with its subtree) out of wherever it is held.
    pub fn take(&mut self, id: HandleId) -> Option<Guard> {
        take_from(&mut self.roots, id)
    }

    /// Move a guard under a new owner. Returns false when no guard was held.
    pub fn transfer(&mut self, id: HandleId, new_owner: Option<HandleId>) -> bool {
        match self.take(id) {
            Some(guard) => {
                self.hold(guard, new_owner);
                true
            }
            None => false,
        }
    }

    /// Discharge the guard of a released handle and of its subtree.
    pub fn release(&mut self, id: HandleId) -> usize {
        match self.take(id) {
            Some(guard) => guard.disarm(),
            None => 0,
        }
    }

    pub fn holds(&self, id: HandleId) -> bool {
        find(&self.roots, id).is_some()
    }

    /// Handle whose guard holds `id`'s guard, if nested.
    pub fn guard_parent(&self, id: HandleId) -> Option<HandleId> {
        fn walk(guards: &[Guard], id: HandleId, parent: Option<HandleId>) -> Option<Option<HandleId>> {
            for guard in guards {
                if guard.handle == id {
                    return Some(parent);
                }
                if let Some(found) = walk(&guard.children, id, Some(guard.handle)) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.roots, id, None).flatten()
    }

    /// Armed guards still held
    pub fn armed_count(&self) -> usize {
        count_armed(&self.roots)
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Drain every live handle. A second call is a no-op.
    pub fn drain(
        &mut self,
        tracker: &mut OwnershipTracker,
        library: &mut dyn TargetLibrary,
        table: &CodeTable,
    ) -> TeardownReport {
        if self.drained {
            debug!("cleanup drain already ran; skipping");
            return TeardownReport {
                already_drained: true,
                ..TeardownReport::default()
            };
        }
        self.drained = true;

        let live = tracker.finalize();
        info!("Draining {} live handles", live.len());
        let mut report = TeardownReport::default();

        for id in tracker.teardown_order(&live) {
            let entry = match tracker.get(id) {
                Some(entry) if entry.state.is_live() => entry.clone(),
                // Freed by an ancestor's cascade earlier in the walk
                _ => continue,
            };

            if let Some(parent) = entry.parent() {
                let parent_native = match tracker.get(parent) {
                    Some(p) => p.native,
                    None => NativeHandle::NULL,
                };
                let signal = library.detach(parent_native, entry.native);
                let shape = ExpectedShape::new(Capability::Mutate, "detach", table);
                match ErrorClassifier::classify(&signal, &shape) {
                    Classification::Success => {
                        if let Err(e) = tracker.reparent(id, None, None) {
                            report.errors.push(format!("detach {}: {}", id, e));
                            continue;
                        }
                        self.transfer(id, None);
                        report.detaches += 1;
                    }
                    Classification::Failure { kind, diagnostic } => {
                        debug!(
                            "{} stays under {} for cascading release ({}: {})",
                            id, parent, kind, diagnostic
                        );
                        report.fallbacks.push(id);
                        continue;
                    }
                }
            }

            let function = match library.destructor(&entry.kind) {
                Some(function) => function,
                None => {
                    self.leak_subtree(tracker, id, &mut report);
                    report.errors.push(format!(
                        "no destructor for {} ({}); marked leaked",
                        id, entry.kind
                    ));
                    continue;
                }
            };

            let call = NativeCall::new(function, Capability::Destroy, vec![Arg::Handle(entry.native)]);
            let signal = library.destroy(&call);
            let shape = ExpectedShape::new(Capability::Destroy, function, table);
            match ErrorClassifier::classify(&signal, &shape) {
                Classification::Success => match tracker.release(id, true, None) {
                    Ok(freed) => {
                        debug!("{} released by {} ({} freed)", id, function, freed.len());
                        self.release(id);
                        report.steps.push(TeardownStep {
                            handle: id,
                            kind: entry.kind.clone(),
                            function: function.to_string(),
                            freed,
                        });
                    }
                    Err(e) => report.errors.push(format!("release {}: {}", id, e)),
                },
                Classification::Failure { kind, diagnostic } => {
                    warn!("{} failed for {}: {} ({})", function, id, kind, diagnostic);
                    report
                        .errors
                        .push(format!("{} failed for {}: {}", function, id, diagnostic));
                    self.leak_subtree(tracker, id, &mut report);
                }
            }
        }

        for error in &report.errors {
            self.cleanup_errors.push(error.clone());
        }
        info!(
            "Drain complete: {} released, {} detached, {} leaked",
            report.freed_count(),
            report.detaches,
            report.leaked.len()
        );
        report
    }

    fn leak_subtree(
        &mut self,
        tracker: &mut OwnershipTracker,
        id: HandleId,
        report: &mut TeardownReport,
    ) {
        let mut pending = vec![id];
        while let Some(handle) = pending.pop() {
            pending.extend(tracker.children(handle));
            if tracker.mark_leaked(handle, None) {
                report.leaked.push(handle);
            }
        }
        self.release(id);
    }

    /// Get cleanup errors
    pub fn get_errors(&self) -> &[String] {
        &self.cleanup_errors
    }

    /// Check if cleanup had errors
    pub fn has_errors(&self) -> bool {
        !self.cleanup_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets;
    use crate::core::types::RawSignal;
    use crate::ownership::graph::Owner;

    /// Records destroy calls; detach support and failing kinds are switchable.
    struct Recorder {
        destroyed: Vec<NativeHandle>,
        detached: Vec<NativeHandle>,
        can_detach: bool,
        failing: Option<NativeHandle>,
    }

    impl Recorder {
        fn new(can_detach: bool) -> Self {
            Self {
                destroyed: Vec::new(),
                detached: Vec::new(),
                can_detach,
                failing: None,
            }
        }
    }

    impl TargetLibrary for Recorder {
        fn name(&self) -> &str {
            "cjson"
        }

        fn kinds(&self) -> Vec<HandleKind> {
            vec![HandleKind::new("json.array")]
        }

        fn create(&mut self, _call: &NativeCall) -> RawSignal {
            RawSignal::unsupported("test")
        }

        fn mutate(&mut self, _call: &NativeCall) -> RawSignal {
            RawSignal::unsupported("test")
        }

        fn query(&mut self, _call: &NativeCall) -> RawSignal {
            RawSignal::unsupported("test")
        }

        fn destroy(&mut self, call: &NativeCall) -> RawSignal {
            let native = call.handle_at(0).unwrap_or(NativeHandle::NULL);
            if Some(native) == self.failing {
                return RawSignal::Bool(false);
            }
            self.destroyed.push(native);
            RawSignal::Void
        }

        fn destructor(&self, _kind: &HandleKind) -> Option<&'static str> {
            Some("cJSON_Delete")
        }

        fn detach(&mut self, _parent: NativeHandle, child: NativeHandle) -> RawSignal {
            if !self.can_detach {
                return RawSignal::unsupported("no detach");
            }
            self.detached.push(child);
            RawSignal::handle(child, "json.array")
        }
    }

    fn register(
        tracker: &mut OwnershipTracker,
        guarantor: &mut CleanupGuarantor,
        token: u64,
        owner: Option<HandleId>,
    ) -> HandleId {
        let id = tracker
            .register(
                NativeHandle(token),
                HandleKind::new("json.array"),
                owner.map(Owner::Handle).unwrap_or(Owner::Root),
                None,
            )
            .unwrap();
        let guard = guarantor.acquire(tracker, id).unwrap();
        guarantor.hold(guard, owner);
        id
    }

    #[test]
    fn test_drain_releases_leaves_before_ancestors() {
        let mut tracker = OwnershipTracker::new();
        let mut guarantor = CleanupGuarantor::new();
        let root = register(&mut tracker, &mut guarantor, 0x10, None);
        let a = register(&mut tracker, &mut guarantor, 0x20, Some(root));
        let b = register(&mut tracker, &mut guarantor, 0x30, Some(root));
        assert_eq!(guarantor.guard_parent(a), Some(root));

        let mut library = Recorder::new(true);
        let report = guarantor.drain(&mut tracker, &mut library, &presets::cjson());

        assert_eq!(
            library.destroyed,
            vec![NativeHandle(0x30), NativeHandle(0x20), NativeHandle(0x10)]
        );
        assert_eq!(report.detaches, 2);
        assert!(tracker.finalize().is_empty());
        for id in [root, a, b] {
            assert_eq!(tracker.release_count(id), 1);
        }
        assert_eq!(guarantor.armed_count(), 0);
    }

    #[test]
    fn test_drain_falls_back_to_cascade_without_native_detach() {
        let mut tracker = OwnershipTracker::new();
        let mut guarantor = CleanupGuarantor::new();
        let root = register(&mut tracker, &mut guarantor, 0x10, None);
        let child = register(&mut tracker, &mut guarantor, 0x20, Some(root));

        let mut library = Recorder::new(false);
        let report = guarantor.drain(&mut tracker, &mut library, &presets::cjson());

        assert_eq!(library.destroyed, vec![NativeHandle(0x10)]);
        assert_eq!(report.fallbacks, vec![child]);
        assert_eq!(tracker.state(child), Some(OwnershipState::Freed));
        assert_eq!(report.freed_count(), 2);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let mut tracker = OwnershipTracker::new();
        let mut guarantor = CleanupGuarantor::new();
        register(&mut tracker, &mut guarantor, 0x10, None);

        let mut library = Recorder::new(true);
        let first = guarantor.drain(&mut tracker, &mut library, &presets::cjson());
        let journal_len = tracker.journal().len();
        let second = guarantor.drain(&mut tracker, &mut library, &presets::cjson());

        assert_eq!(first.steps.len(), 1);
        assert!(second.already_drained);
        assert!(second.steps.is_empty());
        assert_eq!(tracker.journal().len(), journal_len);
        assert_eq!(library.destroyed.len(), 1);
    }

    #[test]
    fn test_failed_destructor_marks_leaked() {
        let mut tracker = OwnershipTracker::new();
        let mut guarantor = CleanupGuarantor::new();
        let id = register(&mut tracker, &mut guarantor, 0x10, None);

        let mut library = Recorder::new(true);
        library.failing = Some(NativeHandle(0x10));
        let report = guarantor.drain(&mut tracker, &mut library, &presets::cjson());

        assert_eq!(report.leaked, vec![id]);
        assert_eq!(tracker.state(id), Some(OwnershipState::Leaked));
        assert!(guarantor.has_errors());
    }

    #[test]
    fn test_reference_cannot_be_guarded() {
        let mut tracker = OwnershipTracker::new();
        let guarantor = CleanupGuarantor::new();
        let target = tracker
            .register(NativeHandle(0x10), HandleKind::new("json.array"), Owner::Root, None)
            .unwrap();
        let alias = tracker
            .mark_reference(NativeHandle(0x11), HandleKind::new("json.array"), target, None, None)
            .unwrap();
        let err = guarantor.acquire(&tracker, alias).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_transfer_moves_guard_subtree() {
        let mut tracker = OwnershipTracker::new();
        let mut guarantor = CleanupGuarantor::new();
        let x = register(&mut tracker, &mut guarantor, 0x10, None);
        let y = register(&mut tracker, &mut guarantor, 0x20, None);
        let child = register(&mut tracker, &mut guarantor, 0x30, Some(x));

        assert!(guarantor.transfer(child, None));
        assert_eq!(guarantor.guard_parent(child), None);
        assert!(guarantor.transfer(child, Some(y)));
        assert_eq!(guarantor.guard_parent(child), Some(y));

        assert_eq!(guarantor.release(y), 2);
        assert!(!guarantor.holds(child));
        assert_eq!(guarantor.armed_count(), 1);
        guarantor.release(x);
    }
}
