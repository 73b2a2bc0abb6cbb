//! # iotdm-core
//!
//! Resource tree for iotdm.
//!
//! This crate provides:
//! - The `ResourceStore` contract the request pipeline depends on
//! - Resource nodes with ordered child sequences
//! - Lazy, restartable child listings
//! - An in-memory store with per-resource serialization

pub mod error;
pub mod memory;
pub mod node;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use node::{NewResource, ResourceId, ResourceNode, ResourcePatch};
pub use store::{ChildFilter, Children, ResourceStore};
