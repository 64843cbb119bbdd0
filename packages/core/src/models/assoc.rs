//! Associations between nodes.
//!
//! Associations are close to UML: directed (source and target), typed
//! (classifier) and optionally named (role). They are not required to be
//! unique per (source, type, target) unless the caller asks for an existence
//! check when adding one.

use serde::{Deserialize, Serialize};

/// A typed, optionally named directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assoc {
    /// Classifier
    pub assoc_type: String,
    /// Role name
    pub name: Option<String>,
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
}

impl Assoc {
    pub fn new(
        assoc_type: impl Into<String>,
        name: Option<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            assoc_type: assoc_type.into(),
            name,
            source: source.into(),
            target: target.into(),
        }
    }
}
