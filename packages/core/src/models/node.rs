//! Node Data Structure
//!
//! The universal entity of the repository: every node has a unique id
//! (assigned at creation, immutable afterwards), an optional type used as a
//! search classifier, an optional primary parent (the one edge used for
//! cascade deletion and ACL inheritance), a last-modified timestamp
//! maintained by the storage engine, a version flag marking immutable
//! historical snapshots, and a map of named properties.
//!
//! # Examples
//!
//! ```rust
//! use strata_core::models::{Node, PropValue};
//!
//! let mut node = Node::new("document");
//! node.put("title", PropValue::from("quarterly report"));
//! node.put("pages", PropValue::Int(12));
//! assert_eq!(node.get("pages"), Some(&PropValue::Int(12)));
//! ```

use crate::models::PropValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A property-bearing entity with an optional single primary parent.
///
/// `id` is `None` until the repository assigns one at creation (callers may
/// also supply a valid GUID up front). `modified` is populated on reads and
/// drives optimistic locking; callers never set it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier, assigned at creation and never changed
    pub id: Option<String>,

    /// Type classifier used to filter searches
    pub node_type: Option<String>,

    /// Primary parent id (cascade deletion, ACL inheritance)
    pub parent_id: Option<String>,

    /// Last modification timestamp, maintained by the repository
    pub modified: Option<DateTime<Utc>>,

    /// Marks an immutable historical snapshot, skipped by normal search
    #[serde(default)]
    pub version: bool,

    /// Named properties
    #[serde(default)]
    pub properties: HashMap<String, PropValue>,
}

impl Node {
    /// Create a node of the given type with no properties
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: Some(node_type.into()),
            ..Self::default()
        }
    }

    /// Create a node of the given type with initial properties
    pub fn with_properties(
        node_type: impl Into<String>,
        properties: HashMap<String, PropValue>,
    ) -> Self {
        Self {
            node_type: Some(node_type.into()),
            properties,
            ..Self::default()
        }
    }

    /// Create a node with a caller-supplied id. The id must be a valid GUID
    /// (see [`crate::models::guid`]) and is checked for uniqueness at
    /// creation.
    pub fn with_id(
        id: impl Into<String>,
        node_type: impl Into<String>,
        properties: HashMap<String, PropValue>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            node_type: Some(node_type.into()),
            properties,
            ..Self::default()
        }
    }

    /// Get a property value by name
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.properties.get(name)
    }

    /// Set a property value
    pub fn put(&mut self, name: impl Into<String>, value: PropValue) {
        self.properties.insert(name.into(), value);
    }

    /// Remove a property
    pub fn remove(&mut self, name: &str) -> Option<PropValue> {
        self.properties.remove(name)
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }
}
