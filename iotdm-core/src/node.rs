//! Resource node types.

use chrono::{DateTime, Utc};
use iotdm_protocol::ResourceType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable resource identifier assigned by the store.
pub type ResourceId = String;

/// A resource in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// None only for CSE base roots.
    pub parent_id: Option<ResourceId>,
    pub name: String,
    pub resource_type: ResourceType,
    /// Child ids in creation order.
    pub children: Vec<ResourceId>,
    /// Opaque attribute blob.
    pub content: Value,
    pub oldest_child: Option<ResourceId>,
    pub latest_child: Option<ResourceId>,
    /// Bumped on every successful update.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ResourceNode {
    pub(crate) fn new(
        id: ResourceId,
        parent_id: Option<ResourceId>,
        name: String,
        resource_type: ResourceType,
        content: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id,
            name,
            resource_type,
            children: Vec::new(),
            content,
            oldest_child: None,
            latest_child: None,
            revision: 1,
            created_at: now,
            modified_at: now,
        }
    }

    /// Looks up a top-level attribute of the content blob.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// Labels (`lbl`) attached to the resource.
    pub fn labels(&self) -> Vec<&str> {
        self.attribute("lbl")
            .and_then(Value::as_array)
            .map(|labels| labels.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub(crate) fn append_child(&mut self, child_id: ResourceId) {
        if self.oldest_child.is_none() {
            self.oldest_child = Some(child_id.clone());
        }
        self.latest_child = Some(child_id.clone());
        self.children.push(child_id);
    }

    pub(crate) fn remove_child(&mut self, child_id: &str) {
        self.children.retain(|c| c != child_id);
        self.oldest_child = self.children.first().cloned();
        self.latest_child = self.children.last().cloned();
    }
}

/// Input for creating a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    /// Name among siblings; the store uses the id when absent.
    pub name: Option<String>,
    pub resource_type: ResourceType,
    pub content: Value,
}

impl NewResource {
    pub fn new(resource_type: ResourceType, content: Value) -> Self {
        Self {
            name: None,
            resource_type,
            content,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Partial update applied to a resource's content.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePatch {
    /// Attributes to set; `null` removes an attribute.
    pub content: Value,
    /// Rejects the update with a conflict unless the stored revision matches.
    pub expected_revision: Option<u64>,
}

impl ResourcePatch {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            expected_revision: None,
        }
    }

    pub fn with_expected_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}

/// Merges patch attributes into the current content.
pub(crate) fn merge_content(current: &Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(current_map), Value::Object(patch_map)) => {
            let mut result = current_map.clone();
            for (k, v) in patch_map {
                if v.is_null() {
                    result.remove(k);
                } else {
                    result.insert(k.clone(), v.clone());
                }
            }
            Value::Object(result)
        }
        (_, Value::Object(_)) => merge_content(&Value::Object(Default::default()), patch),
        _ => current.clone(),
    }
}
