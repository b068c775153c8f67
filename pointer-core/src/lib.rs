use serde::{Deserialize, Serialize};
use std::fmt;

pub mod collab;
pub mod snapshot;

pub use collab::{CollabError, ReplicatedDocument, UpdateOrigin, FRAGMENT_NAME};
pub use snapshot::{ContentHash, Mark, Node, Snapshot};

/// Stable key of one logical document (a note's pointer id).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentIdentity(String);

impl DocumentIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the replication room this document lives in.
    pub fn room_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0)
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}
