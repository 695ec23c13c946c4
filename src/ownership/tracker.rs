/// Resource ownership tracker
///
/// Owns the handle graph and is the only place handle states change. Every
/// mutation is validated first and journaled after; illegal transitions come
/// back as [`OwnershipViolation`]s carrying their classified kind. A rejected
/// second release is journaled but never applied, so a handle's release
/// count can never exceed one.
use crate::config::types::{ErrorKind, OwnershipState};
use crate::core::types::{HandleId, HandleKind, NativeHandle, OperationId};
use crate::ownership::graph::{HandleEntry, Owner, OwnershipGraph};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Illegal ownership transition
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct OwnershipViolation {
    pub kind: ErrorKind,
    pub handle: Option<HandleId>,
    pub detail: String,
}

impl OwnershipViolation {
    fn new(kind: ErrorKind, handle: Option<HandleId>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            handle,
            detail: detail.into(),
        }
    }

    fn invalid(handle: HandleId, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, Some(handle), detail)
    }

    fn dangling(handle: HandleId, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::DanglingReference, Some(handle), detail)
    }
}

pub type TrackerResult<T> = std::result::Result<T, OwnershipViolation>;

/// Journaled action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    Register,
    Reference,
    Attach,
    MoveToRoot,
    Detach,
    Release,
    CascadeRelease,
    DropReference,
    /// A second release that was refused
    DoubleFreeBlocked,
    Leak,
}

/// One journal entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub operation: Option<OperationId>,
    pub handle: HandleId,
    pub action: TransitionAction,
    pub before: Option<OwnershipState>,
    pub after: OwnershipState,
}

#[derive(Debug)]
pub struct OwnershipTracker {
    graph: OwnershipGraph,
    journal: Vec<Transition>,
    seq: u64,
}

impl Default for OwnershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self {
            graph: OwnershipGraph::new(),
            journal: Vec::new(),
            seq: 0,
        }
    }

    // ---- queries ----

    pub fn get(&self, id: HandleId) -> Option<&HandleEntry> {
        self.graph.get(id)
    }

    pub fn state(&self, id: HandleId) -> Option<OwnershipState> {
        self.graph.get(id).map(|e| e.state)
    }

    pub fn owner(&self, id: HandleId) -> Option<Owner> {
        self.graph.get(id).and_then(|e| e.owner)
    }

    /// Live owned children, in registration order
    pub fn children(&self, id: HandleId) -> Vec<HandleId> {
        self.graph.children(id)
    }

    pub fn release_count(&self, id: HandleId) -> u32 {
        self.graph.get(id).map(|e| e.releases).unwrap_or(0)
    }

    pub fn ref_count(&self, id: HandleId) -> u32 {
        self.graph.get(id).map(|e| e.ref_count).unwrap_or(0)
    }

    /// Live owning entry for a native token (references are ignored).
    pub fn lookup_native(&self, native: NativeHandle) -> Option<HandleId> {
        self.graph.live_owner_of_native(native)
    }

    pub fn entries(&self) -> impl Iterator<Item = &HandleEntry> {
        self.graph.entries()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn journal(&self) -> &[Transition] {
        &self.journal
    }

    /// Handles marked Leaked
    pub fn leaked(&self) -> Vec<HandleId> {
        self.graph
            .entries()
            .filter(|e| e.state == OwnershipState::Leaked)
            .map(|e| e.id)
            .collect()
    }

    /// Every handle still Owned or Detached, in registration order
    pub fn finalize(&self) -> Vec<HandleId> {
        self.graph.live()
    }

    /// Leaves-first teardown order for a set of live handles
    pub fn teardown_order(&self, ids: &[HandleId]) -> Vec<HandleId> {
        self.graph.teardown_order(ids)
    }

    fn entry(&self, id: HandleId) -> TrackerResult<&HandleEntry> {
        self.graph
            .get(id)
            .ok_or_else(|| OwnershipViolation::invalid(id, format!("{} is not tracked", id)))
    }

    /// Entry usable as a call argument: live, or a reference whose chain
    /// still reaches a live handle.
    pub fn resolve(&self, id: HandleId) -> TrackerResult<&HandleEntry> {
        let entry = self.entry(id)?;
        if entry.state.is_terminal() {
            return Err(OwnershipViolation::dangling(
                id,
                format!("{} ({}) was already {:?}", id, entry.kind, entry.state),
            ));
        }
        if entry.is_reference() {
            self.live_target(id)?;
        }
        Ok(entry)
    }

    /// Follow a reference chain to the live handle it aliases.
    fn live_target(&self, id: HandleId) -> TrackerResult<HandleId> {
        let mut cursor = id;
        for _ in 0..=self.graph.len() {
            let entry = self.entry(cursor)?;
            match (entry.state, entry.referent) {
                (OwnershipState::Owned | OwnershipState::Detached, _) => return Ok(cursor),
                (OwnershipState::Reference, Some(next)) => cursor = next,
                _ => {
                    return Err(OwnershipViolation::dangling(
                        id,
                        format!("{} refers to {} which is {:?}", id, cursor, entry.state),
                    ))
                }
            }
        }
        Err(OwnershipViolation::dangling(id, format!("{} has a cyclic reference chain", id)))
    }

    fn require_live_owner(&self, owner: Owner) -> TrackerResult<()> {
        let parent = match owner {
            Owner::Root => return Ok(()),
            Owner::Handle(parent) => parent,
        };
        let entry = self.entry(parent)?;
        match entry.state {
            OwnershipState::Owned | OwnershipState::Detached => Ok(()),
            OwnershipState::Reference => Err(OwnershipViolation::invalid(
                parent,
                format!("{} is a reference and cannot own handles", parent),
            )),
            OwnershipState::Freed | OwnershipState::Leaked => Err(OwnershipViolation::invalid(
                parent,
                format!("owner {} was already {:?}", parent, entry.state),
            )),
        }
    }

    fn record(
        &mut self,
        operation: Option<OperationId>,
        handle: HandleId,
        action: TransitionAction,
        before: Option<OwnershipState>,
        after: OwnershipState,
    ) {
        self.seq += 1;
        debug!(
            "ownership #{} {} {:?}: {:?} -> {:?}",
            self.seq, handle, action, before, after
        );
        self.journal.push(Transition {
            seq: self.seq,
            operation,
            handle,
            action,
            before,
            after,
        });
    }

    // ---- register ----

    pub fn check_register(&self, native: NativeHandle, owner: Owner) -> TrackerResult<()> {
        if native.is_null() {
            return Err(OwnershipViolation::new(
                ErrorKind::InvalidArgument,
                None,
                "cannot register a NULL handle",
            ));
        }
        self.require_live_owner(owner)?;
        if let Some(existing) = self.graph.live_owner_of_native(native) {
            return Err(OwnershipViolation::invalid(
                existing,
                format!("native {} is already owned by {}", native, existing),
            ));
        }
        Ok(())
    }

    /// Register a newly created handle as Owned by `owner`.
    pub fn register(
        &mut self,
        native: NativeHandle,
        kind: HandleKind,
        owner: Owner,
        operation: Option<OperationId>,
    ) -> TrackerResult<HandleId> {
        self.check_register(native, owner)?;
        let id = self.graph.allocate_id();
        self.graph.insert(HandleEntry {
            id,
            kind,
            native,
            created_by: operation,
            state: OwnershipState::Owned,
            owner: Some(owner),
            referent: None,
            holder: None,
            ref_count: 0,
            releases: 0,
        });
        self.record(operation, id, TransitionAction::Register, None, OwnershipState::Owned);
        Ok(id)
    }

    // ---- references ----

    pub fn check_mark_reference(
        &self,
        native: NativeHandle,
        target: HandleId,
        holder: Option<HandleId>,
    ) -> TrackerResult<()> {
        if native.is_null() {
            return Err(OwnershipViolation::invalid(target, "reference to a NULL handle"));
        }
        self.resolve(target)?;
        if let Some(holder) = holder {
            self.require_live_owner(Owner::Handle(holder))?;
            let referent = self.live_target(target)?;
            if self.graph.is_ancestor_or_self(referent, holder) {
                return Err(OwnershipViolation::invalid(
                    holder,
                    format!("{} holding an alias of {} would create a cycle", holder, referent),
                ));
            }
        }
        Ok(())
    }

    /// Register a non-owning alias of `target`.
    pub fn mark_reference(
        &mut self,
        native: NativeHandle,
        kind: HandleKind,
        target: HandleId,
        holder: Option<HandleId>,
        operation: Option<OperationId>,
    ) -> TrackerResult<HandleId> {
        self.check_mark_reference(native, target, holder)?;
        let id = self.graph.allocate_id();
        self.graph.insert(HandleEntry {
            id,
            kind,
            native,
            created_by: operation,
            state: OwnershipState::Reference,
            owner: None,
            referent: Some(target),
            holder,
            ref_count: 0,
            releases: 0,
        });
        if let Some(entry) = self.graph.get_mut(target) {
            entry.ref_count += 1;
        }
        self.record(
            operation,
            id,
            TransitionAction::Reference,
            None,
            OwnershipState::Reference,
        );
        Ok(id)
    }

    pub fn check_drop_reference(&self, id: HandleId) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        if !entry.is_reference() {
            return Err(OwnershipViolation::invalid(id, format!("{} is not a reference", id)));
        }
        if entry.state != OwnershipState::Reference {
            return Err(OwnershipViolation::new(
                ErrorKind::DoubleFree,
                Some(id),
                format!("reference {} was already dropped", id),
            ));
        }
        Ok(())
    }

    /// Drop a reference. The referent is never destroyed by this.
    pub fn drop_reference(
        &mut self,
        id: HandleId,
        operation: Option<OperationId>,
    ) -> TrackerResult<()> {
        if let Err(violation) = self.check_drop_reference(id) {
            if violation.kind == ErrorKind::DoubleFree {
                self.block_double_free(id, operation);
            }
            return Err(violation);
        }
        self.drop_reference_unchecked(id, operation);
        Ok(())
    }

    fn drop_reference_unchecked(&mut self, id: HandleId, operation: Option<OperationId>) {
        let referent = match self.graph.get_mut(id) {
            Some(entry) => {
                entry.state = OwnershipState::Freed;
                entry.releases += 1;
                entry.referent
            }
            None => return,
        };
        if let Some(target) = referent.and_then(|t| self.graph.get_mut(t)) {
            target.ref_count = target.ref_count.saturating_sub(1);
        }
        self.record(
            operation,
            id,
            TransitionAction::DropReference,
            Some(OwnershipState::Reference),
            OwnershipState::Freed,
        );
    }

    // ---- reparent ----

    /// Validate a move of `id` under `new_owner` (None detaches).
    pub fn check_reparent(&self, id: HandleId, new_owner: Option<Owner>) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        match entry.state {
            OwnershipState::Owned | OwnershipState::Detached => {}
            OwnershipState::Reference => {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!("{} is a reference and cannot be owned", id),
                ))
            }
            OwnershipState::Freed | OwnershipState::Leaked => {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!("{} was already {:?} and cannot be moved", id, entry.state),
                ))
            }
        }
        let owner = match new_owner {
            Some(owner) => owner,
            None => return Ok(()),
        };
        self.require_live_owner(owner)?;
        if let Owner::Handle(parent) = owner {
            if let Some(current) = entry.parent() {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!(
                        "{} is already owned by {}; detach it before attaching to {}",
                        id, current, parent
                    ),
                ));
            }
            if self.graph.is_ancestor_or_self(id, parent) {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!("attaching {} under {} would create a cycle", id, parent),
                ));
            }
        }
        Ok(())
    }

    /// Move `id` under `new_owner`, or detach it when `new_owner` is None.
    pub fn reparent(
        &mut self,
        id: HandleId,
        new_owner: Option<Owner>,
        operation: Option<OperationId>,
    ) -> TrackerResult<()> {
        self.check_reparent(id, new_owner)?;
        let (before, after, action) = match self.graph.get_mut(id) {
            Some(entry) => {
                let before = entry.state;
                entry.owner = new_owner;
                entry.state = if new_owner.is_some() {
                    OwnershipState::Owned
                } else {
                    OwnershipState::Detached
                };
                let action = match new_owner {
                    Some(Owner::Handle(_)) => TransitionAction::Attach,
                    Some(Owner::Root) => TransitionAction::MoveToRoot,
                    None => TransitionAction::Detach,
                };
                (before, entry.state, action)
            }
            None => return Ok(()),
        };
        self.record(operation, id, action, Some(before), after);
        Ok(())
    }

    // ---- release ----

    pub fn check_release(&self, id: HandleId, cascade: bool) -> TrackerResult<()> {
        let entry = self.entry(id)?;
        if entry.is_reference() {
            return Err(OwnershipViolation::invalid(
                id,
                format!("{} is a reference; drop it instead of releasing it", id),
            ));
        }
        if entry.state.is_terminal() {
            return Err(OwnershipViolation::new(
                ErrorKind::DoubleFree,
                Some(id),
                format!(
                    "{} ({}) was already {:?}; release refused",
                    id, entry.kind, entry.state
                ),
            ));
        }
        if let Some(parent) = entry.parent() {
            let parent_live = self
                .graph
                .get(parent)
                .map(|p| p.state.is_live())
                .unwrap_or(false);
            if parent_live {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!("{} is still owned by {}; detach it first", id, parent),
                ));
            }
        }
        if !cascade {
            let children = self.graph.children(id);
            if !children.is_empty() {
                return Err(OwnershipViolation::invalid(
                    id,
                    format!("{} still owns {} live children", id, children.len()),
                ));
            }
        }
        Ok(())
    }

    /// Release `id` (and its owned subtree with `cascade`). Returns the freed
    /// handles, leaves first.
    pub fn release(
        &mut self,
        id: HandleId,
        cascade: bool,
        operation: Option<OperationId>,
    ) -> TrackerResult<Vec<HandleId>> {
        if let Err(violation) = self.check_release(id, cascade) {
            if violation.kind == ErrorKind::DoubleFree {
                self.block_double_free(id, operation);
            }
            return Err(violation);
        }
        let freed = if cascade {
            self.graph.subtree_postorder(id)
        } else {
            vec![id]
        };
        for handle in &freed {
            let action = if *handle == id {
                TransitionAction::Release
            } else {
                TransitionAction::CascadeRelease
            };
            self.free_entry(*handle, action, operation);
        }
        Ok(freed)
    }

    fn free_entry(
        &mut self,
        id: HandleId,
        action: TransitionAction,
        operation: Option<OperationId>,
    ) {
        let before = match self.graph.get_mut(id) {
            Some(entry) => {
                let before = entry.state;
                entry.state = OwnershipState::Freed;
                entry.releases += 1;
                before
            }
            None => return,
        };
        self.record(operation, id, action, Some(before), OwnershipState::Freed);
        for alias in self.graph.held_references(id) {
            self.drop_reference_unchecked(alias, operation);
        }
    }

    fn block_double_free(&mut self, id: HandleId, operation: Option<OperationId>) {
        let state = match self.state(id) {
            Some(state) => state,
            None => return,
        };
        warn!("blocked second release of {} ({:?})", id, state);
        self.record(
            operation,
            id,
            TransitionAction::DoubleFreeBlocked,
            Some(state),
            state,
        );
    }

    /// Mark a live handle Leaked. Returns false for handles that are not
    /// live (already freed handles are never reported as leaks).
    pub fn mark_leaked(&mut self, id: HandleId, operation: Option<OperationId>) -> bool {
        let before = match self.graph.get_mut(id) {
            Some(entry) if !entry.is_reference() && entry.state.is_live() => {
                let before = entry.state;
                entry.state = OwnershipState::Leaked;
                before
            }
            _ => return false,
        };
        self.record(
            operation,
            id,
            TransitionAction::Leak,
            Some(before),
            OwnershipState::Leaked,
        );
        true
    }

    /// Number of journaled actions of one type
    pub fn count_actions(&self, action: TransitionAction) -> usize {
        self.journal.iter().filter(|t| t.action == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u32) -> Option<OperationId> {
        Some(OperationId(n))
    }

    fn node(tracker: &mut OwnershipTracker, token: u64, owner: Owner) -> HandleId {
        tracker
            .register(NativeHandle(token), HandleKind::new("json.array"), owner, op(1))
            .unwrap()
    }

    #[test]
    fn test_register_and_finalize_in_registration_order() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let b = node(&mut tracker, 0x20, Owner::Handle(a));
        let c = node(&mut tracker, 0x30, Owner::Root);
        assert_eq!(tracker.finalize(), vec![a, b, c]);
        assert_eq!(tracker.children(a), vec![b]);
        assert_eq!(tracker.journal().len(), 3);
    }

    #[test]
    fn test_second_owned_path_is_rejected() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let err = tracker
            .register(NativeHandle(0x10), HandleKind::new("json.array"), Owner::Root, op(2))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let x = node(&mut tracker, 0x20, Owner::Root);
        let y = node(&mut tracker, 0x30, Owner::Root);
        tracker.reparent(a, Some(Owner::Handle(x)), op(3)).unwrap();
        let err = tracker.reparent(a, Some(Owner::Handle(y)), op(4)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let b = node(&mut tracker, 0x20, Owner::Handle(a));
        tracker.reparent(a, None, op(2)).unwrap();
        let err = tracker.reparent(a, Some(Owner::Handle(b)), op(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.detail.contains("cycle"));
    }

    #[test]
    fn test_release_is_at_most_once() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        tracker.release(a, true, op(2)).unwrap();
        let err = tracker.release(a, true, op(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoubleFree);
        assert_eq!(tracker.release_count(a), 1);
        assert_eq!(tracker.state(a), Some(OwnershipState::Freed));
        assert_eq!(tracker.count_actions(TransitionAction::DoubleFreeBlocked), 1);
    }

    #[test]
    fn test_releasing_reference_is_invalid_argument() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let r = tracker
            .mark_reference(NativeHandle(0x11), HandleKind::new("json.array"), a, None, op(2))
            .unwrap();
        let err = tracker.release(r, true, op(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(tracker.ref_count(a), 1);

        tracker.drop_reference(r, op(4)).unwrap();
        assert_eq!(tracker.ref_count(a), 0);
        assert_eq!(tracker.state(a), Some(OwnershipState::Owned));
        let err = tracker.drop_reference(r, op(5)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DoubleFree);
    }

    #[test]
    fn test_cascade_release_frees_subtree_and_held_aliases() {
        let mut tracker = OwnershipTracker::new();
        let x = node(&mut tracker, 0x10, Owner::Root);
        let child = node(&mut tracker, 0x20, Owner::Handle(x));
        let y = node(&mut tracker, 0x30, Owner::Root);
        let alias = tracker
            .mark_reference(NativeHandle(0x21), HandleKind::new("json.number"), child, Some(y), op(2))
            .unwrap();

        let freed = tracker.release(y, true, op(3)).unwrap();
        assert_eq!(freed, vec![y]);
        assert_eq!(tracker.state(alias), Some(OwnershipState::Freed));
        assert_eq!(tracker.state(child), Some(OwnershipState::Owned));

        let freed = tracker.release(x, true, op(4)).unwrap();
        assert_eq!(freed, vec![child, x]);
        assert_eq!(tracker.release_count(child), 1);
        assert!(tracker.finalize().is_empty());
    }

    #[test]
    fn test_non_cascading_release_with_children_is_rejected() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        node(&mut tracker, 0x20, Owner::Handle(a));
        let err = tracker.release(a, false, op(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(tracker.state(a), Some(OwnershipState::Owned));
    }

    #[test]
    fn test_releasing_attached_child_requires_detach() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let b = node(&mut tracker, 0x20, Owner::Handle(a));
        assert_eq!(tracker.check_release(b, true).unwrap_err().kind, ErrorKind::InvalidArgument);
        tracker.reparent(b, None, op(2)).unwrap();
        assert_eq!(tracker.state(b), Some(OwnershipState::Detached));
        tracker.release(b, true, op(3)).unwrap();
    }

    #[test]
    fn test_dangling_reference_on_dereference() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let r = tracker
            .mark_reference(NativeHandle(0x11), HandleKind::new("json.array"), a, None, op(2))
            .unwrap();
        tracker.release(a, true, op(3)).unwrap();
        assert_eq!(tracker.resolve(r).unwrap_err().kind, ErrorKind::DanglingReference);
        assert_eq!(tracker.resolve(a).unwrap_err().kind, ErrorKind::DanglingReference);

        let err = tracker
            .mark_reference(NativeHandle(0x12), HandleKind::new("json.array"), a, None, op(4))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DanglingReference);
    }

    #[test]
    fn test_freed_owner_or_handle_is_invalid_argument() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        tracker.release(a, true, op(2)).unwrap();

        let err = tracker
            .register(NativeHandle(0x20), HandleKind::new("json.array"), Owner::Handle(a), op(3))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = tracker.reparent(a, None, op(4)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let b = node(&mut tracker, 0x30, Owner::Root);
        let err = tracker.reparent(b, Some(Owner::Handle(a)), op(5)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let c = node(&mut tracker, 0x40, Owner::Root);
        assert!(tracker.mark_leaked(c, None));
        let err = tracker.reparent(c, Some(Owner::Root), op(6)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_alias_held_inside_its_own_target_is_rejected() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let b = node(&mut tracker, 0x20, Owner::Handle(a));
        let kind = HandleKind::new("json.array");

        let err = tracker
            .mark_reference(NativeHandle(0x11), kind.clone(), a, Some(a), op(2))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = tracker
            .mark_reference(NativeHandle(0x12), kind.clone(), a, Some(b), op(3))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        // The other direction is a plain alias.
        tracker
            .mark_reference(NativeHandle(0x13), kind, b, Some(a), op(4))
            .unwrap();
    }

    #[test]
    fn test_check_does_not_mutate() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let journal_len = tracker.journal().len();
        tracker.check_release(a, true).unwrap();
        tracker.check_reparent(a, None).unwrap();
        assert_eq!(tracker.state(a), Some(OwnershipState::Owned));
        assert_eq!(tracker.journal().len(), journal_len);
    }

    #[test]
    fn test_mark_leaked_skips_freed() {
        let mut tracker = OwnershipTracker::new();
        let a = node(&mut tracker, 0x10, Owner::Root);
        let b = node(&mut tracker, 0x20, Owner::Root);
        tracker.release(a, true, op(2)).unwrap();
        assert!(!tracker.mark_leaked(a, None));
        assert!(tracker.mark_leaked(b, None));
        assert_eq!(tracker.leaked(), vec![b]);
        assert!(tracker.finalize().is_empty());
    }
}
