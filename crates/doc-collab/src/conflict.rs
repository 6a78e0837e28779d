/// Conflict detection and resolution for collaborative editing
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{transform, Operation, OperationBody, TextEdit};

/// Edits closer than this many positions are treated as colliding
pub const PROXIMITY_THRESHOLD: usize = 5;

/// Unique conflict identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a conflict gets settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the locally issued operation
    Local,

    /// Keep the operation received from the remote collaborator
    Remote,

    /// Combine both, local taking precedence where they overlap
    Merge,
}

/// A collision between one pending local operation and one remote operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub local_operation: Operation,
    pub remote_operation: Operation,
    pub resolved: bool,
    pub resolution: Option<Resolution>,

    /// When the conflict was detected
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl Conflict {
    pub fn new(local_operation: Operation, remote_operation: Operation) -> Self {
        Self {
            id: ConflictId::new(),
            local_operation,
            remote_operation,
            resolved: false,
            resolution: None,
            detected_at: chrono::Utc::now(),
        }
    }
}

/// Decides whether two concurrently issued operations collide
#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    proximity_threshold: usize,
}

impl ConflictDetector {
    pub fn new(proximity_threshold: usize) -> Self {
        Self {
            proximity_threshold,
        }
    }

    pub fn proximity_threshold(&self) -> usize {
        self.proximity_threshold
    }

    /// Check if two operations conflict. The result does not depend on
    /// argument order.
    pub fn detect_conflict(&self, local: &Operation, remote: &Operation) -> bool {
        match (&local.body, &remote.body) {
            (OperationBody::Text { edits: a }, OperationBody::Text { edits: b }) => {
                self.edits_collide(a, b)
            }

            (OperationBody::Metadata { patch: a }, OperationBody::Metadata { patch: b }) => {
                a.conflicts_with(b)
            }

            (
                OperationBody::Opaque {
                    tag: tag_a,
                    fields: a,
                },
                OperationBody::Opaque {
                    tag: tag_b,
                    fields: b,
                },
            ) if tag_a == tag_b => a
                .iter()
                .any(|(key, value)| b.get(key).is_some_and(|other| other != value)),

            // Different kinds never conflict
            _ => false,
        }
    }

    fn edits_collide(&self, a: &[TextEdit], b: &[TextEdit]) -> bool {
        a.iter().filter(|e| e.is_mutation()).any(|ea| {
            b.iter()
                .filter(|e| e.is_mutation())
                .any(|eb| ea.position().abs_diff(eb.position()) < self.proximity_threshold)
        })
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(PROXIMITY_THRESHOLD)
    }
}

/// Produces the single winning operation of a conflict
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict with the chosen resolution
    pub fn resolve(&self, conflict: &Conflict, resolution: Resolution) -> Operation {
        match resolution {
            Resolution::Local => conflict.local_operation.clone(),
            Resolution::Remote => conflict.remote_operation.clone(),
            Resolution::Merge => self.merge(&conflict.local_operation, &conflict.remote_operation),
        }
    }

    fn merge(&self, local: &Operation, remote: &Operation) -> Operation {
        let body = match (&local.body, &remote.body) {
            (OperationBody::Text { .. }, OperationBody::Text { edits: remote_edits }) => {
                let rebased = transform(local, remote);
                let mut edits = remote_edits.clone();
                edits.extend(rebased.edits().iter().cloned());
                OperationBody::Text { edits }
            }

            (OperationBody::Metadata { patch: ours }, OperationBody::Metadata { patch: theirs }) => {
                OperationBody::Metadata {
                    patch: ours.merged_over(theirs),
                }
            }

            (
                OperationBody::Opaque {
                    tag,
                    fields: ours,
                },
                OperationBody::Opaque {
                    tag: other_tag,
                    fields: theirs,
                },
            ) if tag == other_tag => {
                let mut fields = theirs.clone();
                fields.extend(ours.iter().map(|(k, v)| (k.clone(), v.clone())));
                OperationBody::Opaque {
                    tag: tag.clone(),
                    fields,
                }
            }

            // Kinds differ, so there was never anything to merge
            _ => {
                tracing::warn!(
                    "merge requested for {} and {} operations, keeping local",
                    local.kind(),
                    remote.kind()
                );
                local.body.clone()
            }
        };

        Operation::new(
            local.origin_user.clone(),
            local.version.max(remote.version),
            body,
        )
    }
}
