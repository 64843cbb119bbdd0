//! Access control entries.

use serde::{Deserialize, Serialize};

/// One (authority, mask) pair attached to a node.
///
/// The mask is a bitmap; standard bits are defined on
/// [`crate::services::AclService`], callers may add their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ace {
    pub node_id: String,
    pub authority_id: String,
    pub mask: i32,
}

impl Ace {
    pub fn new(node_id: impl Into<String>, authority_id: impl Into<String>, mask: i32) -> Self {
        Self {
            node_id: node_id.into(),
            authority_id: authority_id.into(),
            mask,
        }
    }
}
