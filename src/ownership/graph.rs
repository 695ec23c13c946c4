/// Ownership graph storage
///
/// A forest over tracked handles. Each owning entry has at most one owner
/// (a parent handle or the run root); reference entries point at a referent
/// and optionally at the container that holds them. Ids are handed out in
/// registration order, so ordering by id is ordering by registration.
use crate::config::types::OwnershipState;
use crate::core::types::{HandleId, HandleKind, NativeHandle, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Owner of an owned handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// The run itself
    Root,
    /// A parent handle
    Handle(HandleId),
}

/// One tracked handle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandleEntry {
    pub id: HandleId,
    pub kind: HandleKind,
    pub native: NativeHandle,
    pub created_by: Option<OperationId>,
    pub state: OwnershipState,
    /// Owner while Owned; None while Detached or for references
    pub owner: Option<Owner>,
    /// Referent, for reference entries
    pub referent: Option<HandleId>,
    /// Container holding this alias, for reference entries
    pub holder: Option<HandleId>,
    /// Live references pointing at this handle
    pub ref_count: u32,
    /// Accepted releases (never more than one)
    pub releases: u32,
}

impl HandleEntry {
    pub fn is_reference(&self) -> bool {
        self.referent.is_some()
    }

    pub fn parent(&self) -> Option<HandleId> {
        match self.owner {
            Some(Owner::Handle(parent)) => Some(parent),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OwnershipGraph {
    entries: BTreeMap<HandleId, HandleEntry>,
    next_id: u64,
}

impl OwnershipGraph {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, entry: HandleEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, id: HandleId) -> Option<&HandleEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut HandleEntry> {
        self.entries.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HandleEntry> {
        self.entries.values()
    }

    /// Live owning entries, in registration order
    pub fn live(&self) -> Vec<HandleId> {
        self.entries
            .values()
            .filter(|e| !e.is_reference() && e.state.is_live())
            .map(|e| e.id)
            .collect()
    }

    /// Live owned children of `id`, in registration order
    pub fn children(&self, id: HandleId) -> Vec<HandleId> {
        self.entries
            .values()
            .filter(|e| e.state == OwnershipState::Owned && e.owner == Some(Owner::Handle(id)))
            .map(|e| e.id)
            .collect()
    }

    /// Live references held by container `id`
    pub fn held_references(&self, id: HandleId) -> Vec<HandleId> {
        self.entries
            .values()
            .filter(|e| e.state == OwnershipState::Reference && e.holder == Some(id))
            .map(|e| e.id)
            .collect()
    }

    /// Live owning entry for a native token. References are never returned,
    /// so a pointer shared by owner and alias resolves to the owner.
    pub fn live_owner_of_native(&self, native: NativeHandle) -> Option<HandleId> {
        self.entries
            .values()
            .find(|e| !e.is_reference() && e.state.is_live() && e.native == native)
            .map(|e| e.id)
    }

    /// Whether `ancestor` is on the owner chain of `id` (or is `id`).
    pub fn is_ancestor_or_self(&self, ancestor: HandleId, id: HandleId) -> bool {
        let mut current = Some(id);
        let mut seen = BTreeSet::new();
        while let Some(cursor) = current {
            if cursor == ancestor {
                return true;
            }
            if !seen.insert(cursor) {
                return false;
            }
            current = self.get(cursor).and_then(HandleEntry::parent);
        }
        false
    }

    /// Descendants of `id` followed by `id` itself: leaves first, siblings
    /// in reverse registration order.
    pub fn subtree_postorder(&self, id: HandleId) -> Vec<HandleId> {
        let mut order = Vec::new();
        self.postorder_into(id, &mut order);
        order
    }

    fn postorder_into(&self, id: HandleId, order: &mut Vec<HandleId>) {
        for child in self.children(id).into_iter().rev() {
            self.postorder_into(child, order);
        }
        order.push(id);
    }

    /// Teardown order over a set of live handles: roots of the set in reverse
    /// registration order, each expanded leaves-first.
    pub fn teardown_order(&self, ids: &[HandleId]) -> Vec<HandleId> {
        let members: BTreeSet<HandleId> = ids.iter().copied().collect();
        let mut order = Vec::with_capacity(ids.len());
        for id in ids.iter().rev() {
            let parent_in_set = self
                .get(*id)
                .and_then(HandleEntry::parent)
                .map(|p| members.contains(&p))
                .unwrap_or(false);
            if parent_in_set {
                continue;
            }
            for member in self.subtree_postorder(*id) {
                if members.contains(&member) {
                    order.push(member);
                }
            }
        }
        order
    }
}
