/// Real-time collaborative document editing core
/// Operation-based synchronization with transform, conflict handling and presence
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod operations;
pub use operations::*;

mod transform;
pub use transform::*;

mod conflict;
pub use conflict::*;

mod presence;
pub use presence::*;

mod protocol;
pub use protocol::*;

mod transport;
pub use transport::*;

mod config;
pub use config::*;

mod session;
pub use session::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("not connected to a document session")]
    NotConnected,

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// Identifier of a collaborator, as issued by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollaboratorId(pub String);

impl CollaboratorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollaboratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollaboratorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of the document a session is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic document version counter
pub type DocumentVersion = u64;
