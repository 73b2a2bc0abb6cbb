//! Resource store contract.

use crate::error::StoreError;
use crate::node::{NewResource, ResourceId, ResourceNode, ResourcePatch};
use iotdm_protocol::ResourceType;

/// Key-indexed access to the resource tree.
///
/// Writes are atomic with respect to the parent's child sequence. A create
/// racing a delete of its parent fails with a conflict.
pub trait ResourceStore: Send + Sync {
    fn get(&self, id: &str) -> Result<ResourceNode, StoreError>;

    /// Looks up a child by name; `parent_id = None` searches the roots.
    fn get_by_name(&self, parent_id: Option<&str>, name: &str)
        -> Result<ResourceNode, StoreError>;

    /// Creates a root (CSE base) node.
    fn create_root(&self, resource: NewResource) -> Result<ResourceId, StoreError>;

    /// Creates a child and appends it to the parent's child sequence.
    fn create(&self, parent_id: &str, resource: NewResource) -> Result<ResourceId, StoreError>;

    /// Applies a patch and returns the updated node.
    fn update(&self, id: &str, patch: ResourcePatch) -> Result<ResourceNode, StoreError>;

    /// Deletes a resource and its whole subtree.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Lists children matching a filter.
    fn list_children(&self, id: &str, filter: ChildFilter) -> Result<Children<'_>, StoreError>;
}

/// Filter applied while iterating children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildFilter {
    pub resource_type: Option<ResourceType>,
    /// Only children carrying all of these labels (empty = all).
    pub labels: Vec<String>,
    pub limit: Option<usize>,
}

impl ChildFilter {
    pub fn of_type(resource_type: ResourceType) -> Self {
        Self {
            resource_type: Some(resource_type),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the node matches this filter.
    pub fn matches(&self, node: &ResourceNode) -> bool {
        let labels = node.labels();
        self.resource_type.map_or(true, |t| t == node.resource_type)
            && self.labels.iter().all(|l| labels.contains(&l.as_str()))
    }
}

/// Snapshot of a child sequence, resolved lazily.
///
/// The id list is fixed when the listing is taken; nodes are fetched one at
/// a time during iteration. Children deleted in the meantime are skipped.
/// Calling [`Children::iter`] again restarts from the first child.
pub struct Children<'a> {
    store: &'a dyn ResourceStore,
    ids: Vec<ResourceId>,
    filter: ChildFilter,
}

impl<'a> Children<'a> {
    pub fn new(store: &'a dyn ResourceStore, ids: Vec<ResourceId>, filter: ChildFilter) -> Self {
        Self { store, ids, filter }
    }

    /// Child ids captured at listing time, unfiltered.
    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    pub fn iter(&self) -> ChildIter<'_> {
        ChildIter {
            store: self.store,
            ids: self.ids.iter(),
            filter: &self.filter,
            yielded: 0,
        }
    }
}

impl<'c> IntoIterator for &'c Children<'_> {
    type Item = Result<ResourceNode, StoreError>;
    type IntoIter = ChildIter<'c>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`Children`] snapshot.
pub struct ChildIter<'c> {
    store: &'c dyn ResourceStore,
    ids: std::slice::Iter<'c, ResourceId>,
    filter: &'c ChildFilter,
    yielded: usize,
}

impl Iterator for ChildIter<'_> {
    type Item = Result<ResourceNode, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        for id in self.ids.by_ref() {
            match self.store.get(id) {
                Ok(node) if self.filter.matches(&node) => {
                    self.yielded += 1;
                    return Some(Ok(node));
                }
                Ok(_) | Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
