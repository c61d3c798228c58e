//! Write model shared by the engine and the adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field the adapter stamps with the server's last-updated time
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Field the adapter stamps with the server's last-synced time
pub const LAST_SYNCED_FIELD: &str = "lastSynced";

/// Reasons a document reference or write cannot be built
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefError {
    /// Collection name is empty
    #[error("Collection name is empty")]
    EmptyCollection,

    /// Document id is empty
    #[error("Document id is empty")]
    EmptyId,

    /// A path segment contains a separator or reserved name
    #[error("Invalid path segment: {0:?}")]
    InvalidSegment(String),

    /// Upsert without a payload
    #[error("Missing payload for upsert of {0}")]
    MissingPayload(String),

    /// Upsert payload is not a JSON object, so it cannot be merged
    #[error("Payload for {0} is not an object")]
    NotAnObject(String),
}

/// Address of a document: `(collection, id)` under the user's scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    collection: String,
    id: String,
}

impl DocumentRef {
    /// Build a reference, validating both path segments
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Result<Self, RefError> {
        let collection = collection.into();
        let id = id.into();

        if collection.is_empty() {
            return Err(RefError::EmptyCollection);
        }
        if id.is_empty() {
            return Err(RefError::EmptyId);
        }
        for segment in [&collection, &id] {
            if segment.contains('/') || segment == "." || segment == ".." {
                return Err(RefError::InvalidSegment(segment.clone()));
            }
        }

        Ok(Self { collection, id })
    }

    /// Collection name
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Document id
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Kind of a remote write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    /// Create or merge into a document
    Upsert,
    /// Delete a document
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::Upsert => write!(f, "upsert"),
            WriteKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single write against the remote store
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    /// Merge `payload` into the document, creating it if needed
    Upsert {
        /// Target document
        doc: DocumentRef,
        /// Fields to merge
        payload: Map<String, Value>,
    },
    /// Remove the document
    Delete {
        /// Target document
        doc: DocumentRef,
    },
}

impl RemoteWrite {
    /// Build an upsert; the payload must be present and a JSON object
    pub fn upsert(doc: DocumentRef, payload: Option<Value>) -> Result<Self, RefError> {
        match payload {
            Some(Value::Object(payload)) => Ok(RemoteWrite::Upsert { doc, payload }),
            Some(_) => Err(RefError::NotAnObject(doc.to_string())),
            None => Err(RefError::MissingPayload(doc.to_string())),
        }
    }

    /// Build a delete
    pub fn delete(doc: DocumentRef) -> Self {
        RemoteWrite::Delete { doc }
    }

    /// Target document
    pub fn doc(&self) -> &DocumentRef {
        match self {
            RemoteWrite::Upsert { doc, .. } | RemoteWrite::Delete { doc } => doc,
        }
    }

    /// Kind of this write
    pub fn kind(&self) -> WriteKind {
        match self {
            RemoteWrite::Upsert { .. } => WriteKind::Upsert,
            RemoteWrite::Delete { .. } => WriteKind::Delete,
        }
    }
}

/// Server-assigned timestamps an adapter applies to upserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStamps {
    /// Last-updated time
    pub updated_at: DateTime<Utc>,
    /// Last-synced time
    pub last_synced: DateTime<Utc>,
}

impl ServerStamps {
    /// Stamps for a commit happening now
    pub fn now() -> Self {
        let now = Utc::now();
        Self { updated_at: now, last_synced: now }
    }

    /// Return `payload` with both stamp fields set
    pub fn apply(&self, mut payload: Map<String, Value>) -> Map<String, Value> {
        payload.insert(UPDATED_AT_FIELD.to_string(), Value::String(self.updated_at.to_rfc3339()));
        payload.insert(LAST_SYNCED_FIELD.to_string(), Value::String(self.last_synced.to_rfc3339()));
        payload
    }
}
