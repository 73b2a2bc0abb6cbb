//! In-memory resource store.

use crate::error::StoreError;
use crate::node::{merge_content, NewResource, ResourceId, ResourceNode, ResourcePatch};
use crate::store::{ChildFilter, Children, ResourceStore};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Node plus its tombstone flag.
#[derive(Debug)]
struct Slot {
    node: ResourceNode,
    deleted: bool,
}

type SharedSlot = Arc<RwLock<Slot>>;

/// Name index key: (parent id, name). Roots use `None`.
type NameKey = (Option<ResourceId>, String);

/// Resource tree held in memory.
///
/// Each node sits behind its own lock, so operations on unrelated resources
/// never contend. When two locks are needed the parent is always taken first.
pub struct MemoryStore {
    nodes: DashMap<ResourceId, SharedSlot>,
    names: DashMap<NameKey, ResourceId>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            names: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Takes the store offline; every later call fails with `Unavailable`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Resource store closed ({} resources)", self.nodes.len());
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("resource store is closed".into()));
        }
        Ok(())
    }

    /// Clones the slot handle so no map shard stays locked.
    fn slot(&self, id: &str) -> Result<SharedSlot, StoreError> {
        self.nodes
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StoreError::not_found(id))
    }

    fn allocate_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Whether the id was handed out before and is gone now.
    fn was_deleted(&self, id: &str) -> bool {
        id.parse::<u64>()
            .map(|n| n < self.next_id.load(Ordering::SeqCst) && !self.nodes.contains_key(id))
            .unwrap_or(false)
    }

    /// Registers a node under the name index and the id map.
    fn insert_named(
        &self,
        parent_id: Option<ResourceId>,
        resource: NewResource,
    ) -> Result<ResourceId, StoreError> {
        let id = self.allocate_id();
        let name = resource.name.unwrap_or_else(|| id.clone());
        match self.names.entry((parent_id.clone(), name.clone())) {
            Entry::Occupied(_) => Err(StoreError::NameExists {
                parent_id: parent_id.unwrap_or_else(|| "<root>".to_string()),
                name,
            }),
            Entry::Vacant(vacant) => {
                let node = ResourceNode::new(
                    id.clone(),
                    parent_id,
                    name,
                    resource.resource_type,
                    resource.content,
                );
                self.nodes.insert(
                    id.clone(),
                    Arc::new(RwLock::new(Slot {
                        node,
                        deleted: false,
                    })),
                );
                vacant.insert(id.clone());
                Ok(id)
            }
        }
    }

    /// Tombstones every descendant breadth-first and drops them from the maps.
    fn delete_subtree(&self, mut pending: VecDeque<ResourceId>) {
        while let Some(child_id) = pending.pop_front() {
            let Ok(child) = self.slot(&child_id) else {
                continue;
            };
            let key = {
                let mut guard = child.write();
                if guard.deleted {
                    continue;
                }
                guard.deleted = true;
                pending.extend(guard.node.children.iter().cloned());
                (guard.node.parent_id.clone(), guard.node.name.clone())
            };
            self.names.remove(&key);
            self.nodes.remove(&child_id);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore for MemoryStore {
    fn get(&self, id: &str) -> Result<ResourceNode, StoreError> {
        self.check_open()?;
        let slot = self.slot(id)?;
        let guard = slot.read();
        if guard.deleted {
            return Err(StoreError::not_found(id));
        }
        Ok(guard.node.clone())
    }

    fn get_by_name(
        &self,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<ResourceNode, StoreError> {
        self.check_open()?;
        let key = (parent_id.map(str::to_string), name.to_string());
        let id = self
            .names
            .get(&key)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::not_found(name))?;
        self.get(&id)
    }

    fn create_root(&self, resource: NewResource) -> Result<ResourceId, StoreError> {
        self.check_open()?;
        let id = self.insert_named(None, resource)?;
        tracing::debug!("Created root resource {}", id);
        Ok(id)
    }

    fn create(&self, parent_id: &str, resource: NewResource) -> Result<ResourceId, StoreError> {
        self.check_open()?;
        let parent = match self.slot(parent_id) {
            Ok(slot) => slot,
            Err(_) if self.was_deleted(parent_id) => {
                return Err(StoreError::ParentDeleted {
                    parent_id: parent_id.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let mut parent_guard = parent.write();
        if parent_guard.deleted {
            return Err(StoreError::ParentDeleted {
                parent_id: parent_id.to_string(),
            });
        }
        let id = self.insert_named(Some(parent_id.to_string()), resource)?;
        parent_guard.node.append_child(id.clone());
        tracing::debug!("Created resource {} under {}", id, parent_id);
        Ok(id)
    }

    fn update(&self, id: &str, patch: ResourcePatch) -> Result<ResourceNode, StoreError> {
        self.check_open()?;
        let slot = self.slot(id)?;
        let mut guard = slot.write();
        if guard.deleted {
            return Err(StoreError::not_found(id));
        }
        if let Some(expected) = patch.expected_revision {
            if guard.node.revision != expected {
                return Err(StoreError::RevisionConflict {
                    resource_id: id.to_string(),
                    expected,
                    actual: guard.node.revision,
                });
            }
        }
        guard.node.content = merge_content(&guard.node.content, &patch.content);
        guard.node.revision += 1;
        guard.node.modified_at = Utc::now();
        Ok(guard.node.clone())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let slot = self.slot(id)?;
        let parent_id = {
            let guard = slot.read();
            if guard.deleted {
                return Err(StoreError::not_found(id));
            }
            guard.node.parent_id.clone()
        };
        let parent = parent_id.as_deref().and_then(|p| self.slot(p).ok());

        let (key, pending) = {
            let mut parent_guard = parent.as_ref().map(|p| p.write());
            let mut guard = slot.write();
            if guard.deleted {
                return Err(StoreError::not_found(id));
            }
            guard.deleted = true;
            if let Some(parent_guard) = parent_guard.as_mut() {
                parent_guard.node.remove_child(id);
            }
            (
                (guard.node.parent_id.clone(), guard.node.name.clone()),
                guard.node.children.iter().cloned().collect::<VecDeque<_>>(),
            )
        };
        self.names.remove(&key);
        self.nodes.remove(id);

        let descendants = pending.len();
        self.delete_subtree(pending);
        tracing::debug!("Deleted resource {} ({} direct children)", id, descendants);
        Ok(())
    }

    fn list_children(&self, id: &str, filter: ChildFilter) -> Result<Children<'_>, StoreError> {
        let node = self.get(id)?;
        Ok(Children::new(self, node.children, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_protocol::ResourceType;
    use proptest::prelude::*;
    use serde_json::json;
    use std::thread;

    fn store_with_root() -> (MemoryStore, ResourceId) {
        let store = MemoryStore::new();
        let root = store
            .create_root(NewResource::new(ResourceType::CseBase, json!({})).with_name("InCSE1"))
            .unwrap();
        (store, root)
    }

    fn ae(name: &str) -> NewResource {
        NewResource::new(ResourceType::Ae, json!({"api": "app"})).with_name(name)
    }

    #[test]
    fn test_create_appends_child() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        let b = store.create(&root, ae("b")).unwrap();
        assert_ne!(a, b);

        let root_node = store.get(&root).unwrap();
        assert_eq!(root_node.children, vec![a.clone(), b.clone()]);
        assert_eq!(root_node.oldest_child, Some(a.clone()));
        assert_eq!(root_node.latest_child, Some(b));

        let child = store.get(&a).unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(child.revision, 1);
    }

    #[test]
    fn test_unnamed_resource_uses_id() {
        let (store, root) = store_with_root();
        let id = store
            .create(&root, NewResource::new(ResourceType::Container, json!({})))
            .unwrap();
        assert_eq!(store.get(&id).unwrap().name, id);
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let (store, root) = store_with_root();
        store.create(&root, ae("a")).unwrap();
        let err = store.create(&root, ae("a")).unwrap_err();
        assert!(matches!(err, StoreError::NameExists { .. }));
        assert_eq!(store.get(&root).unwrap().children.len(), 1);
    }

    #[test]
    fn test_get_by_name() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        assert_eq!(store.get_by_name(None, "InCSE1").unwrap().id, root);
        assert_eq!(store.get_by_name(Some(&root), "a").unwrap().id, a);
        assert!(matches!(
            store.get_by_name(Some(&root), "missing"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_removes_subtree() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        let cnt = store
            .create(&a, NewResource::new(ResourceType::Container, json!({})).with_name("c"))
            .unwrap();
        let cin = store
            .create(&cnt, NewResource::new(ResourceType::ContentInstance, json!({"con": "1"})))
            .unwrap();

        store.delete(&a).unwrap();

        assert!(store.get(&root).unwrap().children.is_empty());
        for id in [&a, &cnt, &cin] {
            assert!(matches!(store.get(id), Err(StoreError::NotFound { .. })));
        }
        assert!(store.get_by_name(Some(&root), "a").is_err());
        assert_eq!(store.len(), 1);

        // name can be reused once the old resource is gone
        store.create(&root, ae("a")).unwrap();
    }

    #[test]
    fn test_delete_twice_is_not_found() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        store.delete(&a).unwrap();
        assert!(matches!(store.delete(&a), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_create_under_deleted_parent_conflicts() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        store.delete(&a).unwrap();

        let err = store.create(&a, ae("late")).unwrap_err();
        assert!(matches!(err, StoreError::ParentDeleted { .. }));
        assert!(err.is_conflict());

        // never-allocated ids are plain not-found
        let err = store.create("999999", ae("x")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_update_checks_revision() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();

        let updated = store
            .update(&a, ResourcePatch::new(json!({"rr": true})).with_expected_revision(1))
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.content, json!({"api": "app", "rr": true}));

        let err = store
            .update(&a, ResourcePatch::new(json!({"rr": false})).with_expected_revision(1))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::RevisionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(store.get(&a).unwrap().content["rr"], json!(true));

        // unconditional update always applies
        store.update(&a, ResourcePatch::new(json!({"rr": false}))).unwrap();
        assert_eq!(store.get(&a).unwrap().revision, 3);
    }

    #[test]
    fn test_concurrent_creates_both_land() {
        let (store, root) = store_with_root();
        let store = Arc::new(store);

        let handles: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|name| {
                let store = store.clone();
                let root = root.clone();
                thread::spawn(move || store.create(&root, ae(name)).unwrap())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let children = store.get(&root).unwrap().children;
        assert_eq!(children.len(), 2);
        for id in ids {
            assert!(children.contains(&id));
        }
    }

    #[test]
    fn test_create_racing_parent_delete() {
        for _ in 0..50 {
            let (store, root) = store_with_root();
            let store = Arc::new(store);
            let parent = store.create(&root, ae("p")).unwrap();

            let creator = {
                let store = store.clone();
                let parent = parent.clone();
                thread::spawn(move || store.create(&parent, ae("child")))
            };
            let deleter = {
                let store = store.clone();
                let parent = parent.clone();
                thread::spawn(move || store.delete(&parent))
            };

            let created = creator.join().unwrap();
            deleter.join().unwrap().unwrap();

            match created {
                Ok(child) => assert!(store.get(&child).is_err()),
                Err(e) => assert!(e.is_conflict(), "unexpected error {:?}", e),
            }
            assert_eq!(store.len(), 1);
        }
    }

    #[test]
    fn test_list_children_is_lazy_and_restartable() {
        let (store, root) = store_with_root();
        let a = store.create(&root, ae("a")).unwrap();
        let c = store
            .create(&root, NewResource::new(ResourceType::Container, json!({})))
            .unwrap();
        let b = store.create(&root, ae("b")).unwrap();

        let children = store
            .list_children(&root, ChildFilter::of_type(ResourceType::Ae))
            .unwrap();
        assert_eq!(children.ids(), &[a.clone(), c, b.clone()]);

        // deleted after the snapshot was taken: skipped during iteration
        store.delete(&a).unwrap();

        let first: Vec<_> = children.iter().map(|n| n.unwrap().id).collect();
        let second: Vec<_> = children.iter().map(|n| n.unwrap().id).collect();
        assert_eq!(first, vec![b.clone()]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_list_children_limit_and_labels() {
        let (store, root) = store_with_root();
        for i in 0..5 {
            let labels = if i % 2 == 0 { json!(["even"]) } else { json!(["odd"]) };
            store
                .create(
                    &root,
                    NewResource::new(ResourceType::Container, json!({ "lbl": labels })),
                )
                .unwrap();
        }

        let limited = store
            .list_children(&root, ChildFilter::default().with_limit(2))
            .unwrap();
        assert_eq!(limited.iter().count(), 2);

        let even = store
            .list_children(
                &root,
                ChildFilter {
                    labels: vec!["even".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(even.iter().count(), 3);
    }

    #[test]
    fn test_closed_store_is_unavailable() {
        let (store, root) = store_with_root();
        store.close();
        assert!(matches!(store.get(&root), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.create(&root, ae("a")),
            Err(StoreError::Unavailable(_))
        ));
        // closing twice is harmless
        store.close();
    }

    proptest! {
        #[test]
        fn prop_child_sequences_have_no_dangling_ids(
            ops in proptest::collection::vec((0usize..8, any::<bool>()), 1..40)
        ) {
            let (store, root) = store_with_root();
            let mut known = vec![root.clone()];
            for (pick, delete) in ops {
                let target = known[pick % known.len()].clone();
                if delete && target != root {
                    let _ = store.delete(&target);
                } else if store.create(&target, NewResource::new(ResourceType::Container, json!({}))).is_ok() {
                    known = store_ids(&store);
                }
                known.retain(|id| store.get(id).is_ok());
            }
            for id in store_ids(&store) {
                let node = store.get(&id).unwrap();
                for child in &node.children {
                    let child_node = store.get(child).unwrap();
                    prop_assert_eq!(child_node.parent_id.as_deref(), Some(id.as_str()));
                }
            }
        }
    }

    fn store_ids(store: &MemoryStore) -> Vec<ResourceId> {
        store.nodes.iter().map(|r| r.key().clone()).collect()
    }
}
