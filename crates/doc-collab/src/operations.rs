/// Document operations
/// These operations represent changes that are synchronized across collaborators
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{CollabError, CollaboratorId, DocumentVersion, Result};

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One atomic text mutation.
///
/// Positions are character offsets into the document as it was *before*
/// any edit of the enclosing operation is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TextEdit {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Retain { position: usize },
}

impl TextEdit {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        TextEdit::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        TextEdit::Delete { position, length }
    }

    pub fn retain(position: usize) -> Self {
        TextEdit::Retain { position }
    }

    pub fn position(&self) -> usize {
        match self {
            TextEdit::Insert { position, .. }
            | TextEdit::Delete { position, .. }
            | TextEdit::Retain { position } => *position,
        }
    }

    pub(crate) fn position_mut(&mut self) -> &mut usize {
        match self {
            TextEdit::Insert { position, .. }
            | TextEdit::Delete { position, .. }
            | TextEdit::Retain { position } => position,
        }
    }

    /// Inserts and deletes change content; retains don't
    pub fn is_mutation(&self) -> bool {
        !matches!(self, TextEdit::Retain { .. })
    }

    /// Number of characters this edit inserts
    pub fn inserted_len(&self) -> usize {
        match self {
            TextEdit::Insert { text, .. } => text.chars().count(),
            _ => 0,
        }
    }
}

/// Partial update of document-level fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_template: Option<bool>,
}

impl MetadataPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.tags.is_none()
            && self.is_template.is_none()
    }

    /// True if both patches set the same field to different values
    pub fn conflicts_with(&self, other: &MetadataPatch) -> bool {
        fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            matches!((a, b), (Some(x), Some(y)) if x != y)
        }

        differs(&self.title, &other.title)
            || differs(&self.description, &other.description)
            || differs(&self.tags, &other.tags)
            || differs(&self.is_template, &other.is_template)
    }

    /// Field-wise merge where `self` wins over `base` on shared fields
    pub fn merged_over(&self, base: &MetadataPatch) -> MetadataPatch {
        MetadataPatch {
            title: self.title.clone().or_else(|| base.title.clone()),
            description: self.description.clone().or_else(|| base.description.clone()),
            tags: self.tags.clone().or_else(|| base.tags.clone()),
            is_template: self.is_template.or(base.is_template),
        }
    }
}

/// Content of an operation, one variant per known kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationBody {
    /// Text edits against the document body
    Text { edits: Vec<TextEdit> },

    /// Document-level field changes
    Metadata { patch: MetadataPatch },

    /// Any other document aspect. Field values are carried as raw bytes.
    Opaque {
        tag: String,
        fields: BTreeMap<String, Vec<u8>>,
    },
}

impl OperationBody {
    pub fn text(edits: Vec<TextEdit>) -> Self {
        OperationBody::Text { edits }
    }

    pub fn metadata(patch: MetadataPatch) -> Self {
        OperationBody::Metadata { patch }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationBody::Text { .. } => OperationKind::Text,
            OperationBody::Metadata { .. } => OperationKind::Metadata,
            OperationBody::Opaque { tag, .. } => OperationKind::Opaque(tag.clone()),
        }
    }
}

/// Discriminator used to decide whether two operations can interact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Text,
    Metadata,
    Opaque(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Text => "text",
            OperationKind::Metadata => "metadata",
            OperationKind::Opaque(tag) => tag,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document operation that can be replicated across collaborators.
///
/// Two operations are equal when their ids are equal, regardless of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    /// What the operation changes
    pub body: OperationBody,

    /// Document version the sender had when creating the operation
    pub version: DocumentVersion,

    /// Collaborator who created this operation
    pub origin_user: CollaboratorId,

    /// Timestamp when operation was created (client time)
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Operation {
    pub fn new(origin_user: CollaboratorId, version: DocumentVersion, body: OperationBody) -> Self {
        Self {
            id: OperationId::new(),
            body,
            version,
            origin_user,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.body.kind()
    }

    /// Text edits of this operation; empty for non-text kinds
    pub fn edits(&self) -> &[TextEdit] {
        match &self.body {
            OperationBody::Text { edits } => edits,
            _ => &[],
        }
    }

    /// Reject operations that decode fine but carry nothing to apply
    pub fn validate(&self) -> Result<()> {
        match &self.body {
            OperationBody::Text { edits } if edits.is_empty() => Err(
                CollabError::InvalidOperation("text operation has no edits".to_string()),
            ),
            OperationBody::Metadata { patch } if patch.is_empty() => Err(
                CollabError::InvalidOperation("metadata operation sets no fields".to_string()),
            ),
            OperationBody::Opaque { tag, .. } if tag.is_empty() => Err(
                CollabError::InvalidOperation("operation kind is empty".to_string()),
            ),
            OperationBody::Opaque { tag, fields } if fields.is_empty() => Err(
                CollabError::InvalidOperation(format!("{} operation has no payload", tag)),
            ),
            _ => Ok(()),
        }
    }

    /// Apply this operation to a text buffer.
    ///
    /// Non-text operations leave the buffer untouched. Bounds are checked
    /// against the original buffer before anything is modified.
    pub fn apply_to(&self, buffer: &mut String) -> Result<()> {
        let edits = match &self.body {
            OperationBody::Text { edits } => edits,
            _ => return Ok(()),
        };

        let mut chars: Vec<char> = buffer.chars().collect();
        let len = chars.len();

        let mut deleted = Vec::new();
        for edit in edits {
            let end = match edit {
                TextEdit::Delete { position, length } => {
                    let end = position.checked_add(*length).ok_or_else(|| {
                        CollabError::InvalidOperation(format!(
                            "delete at {} of length {} overflows",
                            position, length
                        ))
                    })?;
                    deleted.push((*position, end));
                    end
                }
                other => other.position(),
            };
            if end > len {
                return Err(CollabError::InvalidOperation(format!(
                    "edit at {} exceeds document length {}",
                    edit.position(),
                    len
                )));
            }
        }

        // Each character may be deleted at most once
        deleted.sort_unstable();
        if let Some(pair) = deleted.windows(2).find(|pair| pair[1].0 < pair[0].1) {
            return Err(CollabError::InvalidOperation(format!(
                "deletes at {} and {} overlap",
                pair[0].0, pair[1].0
            )));
        }

        // Right to left so earlier positions stay valid
        let mut order: Vec<usize> = (0..edits.len()).collect();
        order.sort_by(|&a, &b| {
            edits[b]
                .position()
                .cmp(&edits[a].position())
                .then(b.cmp(&a))
        });

        for idx in order {
            match &edits[idx] {
                TextEdit::Insert { position, text } => {
                    chars.splice(*position..*position, text.chars());
                }
                TextEdit::Delete { position, length } => {
                    chars.drain(*position..position + length);
                }
                TextEdit::Retain { .. } => {}
            }
        }

        *buffer = chars.into_iter().collect();
        Ok(())
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Append-only log of every operation a session applied or received
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    operations: Vec<Operation>,

    /// Index by operation ID for fast lookup
    operation_index: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation to the log
    pub fn append(&mut self, op: Operation) {
        let id = op.id;
        self.operations.push(op);
        self.operation_index.insert(id, self.operations.len() - 1);
    }

    /// Get operation by ID
    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.operation_index
            .get(id)
            .and_then(|&idx| self.operations.get(idx))
    }

    /// Operations generated against `version` or later, in log order
    pub fn operations_since(&self, version: DocumentVersion) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.version >= version)
            .collect()
    }

    pub fn as_slice(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.operations.clear();
        self.operation_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> CollaboratorId {
        CollaboratorId::new("alice")
    }

    #[test]
    fn test_equality_is_by_id() {
        let op1 = Operation::new(alice(), 0, OperationBody::text(vec![TextEdit::insert(0, "a")]));
        let mut op2 = op1.clone();
        op2.body = OperationBody::text(vec![TextEdit::insert(3, "zzz")]);

        // Same id, different content
        assert_eq!(op1, op2);

        // Same content, different id
        let op3 = Operation::new(alice(), 0, op1.body.clone());
        assert_ne!(op1, op3);
    }

    #[test]
    fn test_apply_uses_pre_operation_coordinates() {
        let mut buffer = "hello world".to_string();
        let op = Operation::new(
            alice(),
            0,
            OperationBody::text(vec![
                TextEdit::insert(0, ">> "),
                TextEdit::delete(5, 6),
                TextEdit::insert(11, "!"),
            ]),
        );

        op.apply_to(&mut buffer).unwrap();
        assert_eq!(buffer, ">> hello!");
    }

    #[test]
    fn test_apply_counts_characters_not_bytes() {
        let mut buffer = "héllo".to_string();
        let op = Operation::new(alice(), 0, OperationBody::text(vec![TextEdit::delete(1, 1)]));

        op.apply_to(&mut buffer).unwrap();
        assert_eq!(buffer, "hllo");
    }

    #[test]
    fn test_apply_out_of_range_leaves_buffer() {
        let mut buffer = "abc".to_string();
        let op = Operation::new(
            alice(),
            0,
            OperationBody::text(vec![TextEdit::insert(0, "x"), TextEdit::delete(2, 5)]),
        );

        let result = op.apply_to(&mut buffer);
        assert!(matches!(result, Err(CollabError::InvalidOperation(_))));
        assert_eq!(buffer, "abc");
    }

    #[test]
    fn test_apply_rejects_overflowing_delete() {
        let mut buffer = "abc".to_string();
        let op = Operation::new(
            alice(),
            0,
            OperationBody::text(vec![TextEdit::delete(2, usize::MAX)]),
        );

        let result = op.apply_to(&mut buffer);
        assert!(matches!(result, Err(CollabError::InvalidOperation(_))));
        assert_eq!(buffer, "abc");
    }

    #[test]
    fn test_apply_rejects_overlapping_deletes() {
        let mut buffer = "abcd".to_string();
        let op = Operation::new(
            alice(),
            0,
            OperationBody::text(vec![TextEdit::delete(0, 3), TextEdit::delete(1, 3)]),
        );

        let result = op.apply_to(&mut buffer);
        assert!(matches!(result, Err(CollabError::InvalidOperation(_))));
        assert_eq!(buffer, "abcd");

        // Adjacent ranges are fine
        let op = Operation::new(
            alice(),
            0,
            OperationBody::text(vec![TextEdit::delete(0, 2), TextEdit::delete(2, 1)]),
        );
        op.apply_to(&mut buffer).unwrap();
        assert_eq!(buffer, "d");
    }

    #[test]
    fn test_validate_rejects_empty_bodies() {
        let empty_text = Operation::new(alice(), 0, OperationBody::text(vec![]));
        assert!(empty_text.validate().is_err());

        let empty_meta = Operation::new(alice(), 0, OperationBody::metadata(MetadataPatch::default()));
        assert!(empty_meta.validate().is_err());

        let titled = Operation::new(alice(), 0, OperationBody::metadata(MetadataPatch::title("Q3")));
        assert!(titled.validate().is_ok());
    }

    #[test]
    fn test_metadata_patch_merge() {
        let local = MetadataPatch {
            title: Some("Local".to_string()),
            tags: Some(vec!["draft".to_string()]),
            ..Default::default()
        };
        let remote = MetadataPatch {
            title: Some("Remote".to_string()),
            description: Some("shared".to_string()),
            ..Default::default()
        };

        assert!(local.conflicts_with(&remote));

        let merged = local.merged_over(&remote);
        assert_eq!(merged.title.as_deref(), Some("Local"));
        assert_eq!(merged.description.as_deref(), Some("shared"));
        assert_eq!(merged.tags, Some(vec!["draft".to_string()]));
    }

    #[test]
    fn test_operation_log_lookup() {
        let mut log = OperationLog::new();
        let op1 = Operation::new(alice(), 0, OperationBody::metadata(MetadataPatch::title("a")));
        let op2 = Operation::new(alice(), 3, OperationBody::metadata(MetadataPatch::title("b")));
        let id2 = op2.id;

        log.append(op1);
        log.append(op2);

        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&id2).map(|op| op.version), Some(3));
        assert_eq!(log.operations_since(1).len(), 1);
    }
}
