/// Messages exchanged with the transport layer
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::{
    CollabError, CollaboratorId, CollaboratorInfo, Cursor, DocumentVersion, MetadataPatch,
    Operation, OperationBody, OperationId, Result, TextEdit,
};

/// Flat wire form of an operation: `{ id, kind, payload, edits, version }`.
///
/// Every field is optional at this level so malformed input surfaces as
/// `InvalidOperation` with a useful reason instead of a generic decode error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<Vec<Value>>,

    #[serde(default)]
    pub version: DocumentVersion,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl WireOperation {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CollabError::InvalidOperation(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Decode into a typed operation attributed to `origin_user`
    pub fn into_operation(self, origin_user: CollaboratorId) -> Result<Operation> {
        let raw_id = self
            .id
            .ok_or_else(|| invalid("operation has no id"))?;
        let id = uuid::Uuid::parse_str(&raw_id)
            .map(OperationId)
            .map_err(|e| invalid(format!("bad operation id '{}': {}", raw_id, e)))?;

        let kind = self
            .kind
            .filter(|k| !k.is_empty())
            .ok_or_else(|| invalid("operation has no kind"))?;

        let body = match kind.as_str() {
            "text" => {
                let edits = self
                    .edits
                    .ok_or_else(|| invalid("text operation has no edits"))?
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| {
                        serde_json::from_value::<TextEdit>(value)
                            .map_err(|e| invalid(format!("edit {}: {}", i, e)))
                    })
                    .collect::<Result<Vec<_>>>()?;
                OperationBody::Text { edits }
            }

            "metadata" => {
                let payload = self
                    .payload
                    .ok_or_else(|| invalid("metadata operation has no payload"))?;
                let patch: MetadataPatch = serde_json::from_value(Value::Object(payload))
                    .map_err(|e| invalid(format!("metadata payload: {}", e)))?;
                OperationBody::Metadata { patch }
            }

            _ => {
                let payload = self
                    .payload
                    .ok_or_else(|| invalid(format!("{} operation has no payload", kind)))?;
                let fields = payload
                    .into_iter()
                    .map(|(key, value)| {
                        serde_json::to_vec(&value)
                            .map(|bytes| (key, bytes))
                            .map_err(|e| invalid(e.to_string()))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                OperationBody::Opaque { tag: kind, fields }
            }
        };

        let operation = Operation {
            id,
            body,
            version: self.version,
            origin_user,
            timestamp: self.timestamp.unwrap_or_else(chrono::Utc::now),
        };
        operation.validate()?;

        Ok(operation)
    }
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        let (payload, edits) = match &op.body {
            OperationBody::Text { edits } => (None, Some(edits.iter().map(edit_to_value).collect())),
            OperationBody::Metadata { patch } => (Some(patch_to_map(patch)), None),
            OperationBody::Opaque { fields, .. } => {
                let map = fields
                    .iter()
                    .map(|(key, bytes)| (key.clone(), bytes_to_value(bytes)))
                    .collect();
                (Some(map), None)
            }
        };

        Self {
            id: Some(op.id.to_string()),
            kind: Some(op.kind().as_str().to_string()),
            payload,
            edits,
            version: op.version,
            timestamp: Some(op.timestamp),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CollabError {
    CollabError::InvalidOperation(reason.into())
}

fn edit_to_value(edit: &TextEdit) -> Value {
    match edit {
        TextEdit::Insert { position, text } => {
            json!({ "action": "insert", "position": position, "text": text })
        }
        TextEdit::Delete { position, length } => {
            json!({ "action": "delete", "position": position, "length": length })
        }
        TextEdit::Retain { position } => json!({ "action": "retain", "position": position }),
    }
}

fn patch_to_map(patch: &MetadataPatch) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(title) = &patch.title {
        map.insert("title".to_string(), json!(title));
    }
    if let Some(description) = &patch.description {
        map.insert("description".to_string(), json!(description));
    }
    if let Some(tags) = &patch.tags {
        map.insert("tags".to_string(), json!(tags));
    }
    if let Some(is_template) = patch.is_template {
        map.insert("is_template".to_string(), json!(is_template));
    }
    map
}

// Opaque field bytes hold the JSON encoding of the wire value; anything
// else is sent as a lossy string.
fn bytes_to_value(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Events the transport delivers to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    CollaboratorJoined {
        collaborator: CollaboratorInfo,
    },

    CollaboratorLeft {
        collaborator_id: CollaboratorId,
    },

    OperationReceived {
        operation: WireOperation,
        from: CollaboratorId,
    },

    CursorUpdated {
        collaborator_id: CollaboratorId,
        cursor: Cursor,
    },

    RosterSnapshot {
        collaborators: Vec<CollaboratorInfo>,
    },
}

impl InboundEvent {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CollabError::Serialization(e.to_string()))
    }
}

/// Messages a session hands to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Operation { operation: WireOperation },
    Cursor { cursor: Cursor },
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> CollaboratorId {
        CollaboratorId::new("bob")
    }

    fn wire(text: &str) -> WireOperation {
        WireOperation::from_json(text).unwrap()
    }

    #[test]
    fn test_decode_text_operation() {
        let op = wire(
            r#"{
                "id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11",
                "kind": "text",
                "edits": [
                    {"action": "insert", "position": 3, "text": "hi"},
                    {"action": "delete", "position": 9, "length": 2}
                ],
                "version": 7
            }"#,
        )
        .into_operation(bob())
        .unwrap();

        assert_eq!(op.version, 7);
        assert_eq!(op.origin_user, bob());
        assert_eq!(
            op.edits(),
            &[TextEdit::insert(3, "hi"), TextEdit::delete(9, 2)]
        );
    }

    #[test]
    fn test_text_without_edits_is_invalid() {
        let result = wire(r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "text", "version": 1}"#)
            .into_operation(bob());

        assert!(matches!(result, Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_insert_without_text_is_invalid() {
        let result = wire(
            r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "text",
                "edits": [{"action": "insert", "position": 3}]}"#,
        )
        .into_operation(bob());

        match result {
            Err(CollabError::InvalidOperation(reason)) => assert!(reason.starts_with("edit 0")),
            other => panic!("expected invalid operation, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_id_or_kind_is_invalid() {
        let no_id = wire(r#"{"kind": "metadata", "payload": {"title": "x"}}"#).into_operation(bob());
        assert!(matches!(no_id, Err(CollabError::InvalidOperation(_))));

        let no_kind = wire(r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "payload": {"a": 1}}"#)
            .into_operation(bob());
        assert!(matches!(no_kind, Err(CollabError::InvalidOperation(_))));

        let bad_id = wire(r#"{"id": "nope", "kind": "metadata", "payload": {"title": "x"}}"#)
            .into_operation(bob());
        assert!(matches!(bad_id, Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_hostile_deletes_decode_but_fail_to_apply() {
        let oversized = wire(
            r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "text",
                "edits": [{"action": "delete", "position": 2, "length": 18446744073709551615}]}"#,
        )
        .into_operation(bob())
        .unwrap();
        let mut buffer = "abc".to_string();
        assert!(matches!(
            oversized.apply_to(&mut buffer),
            Err(CollabError::InvalidOperation(_))
        ));

        let overlapping = wire(
            r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "text",
                "edits": [{"action": "delete", "position": 0, "length": 3},
                          {"action": "delete", "position": 1, "length": 3}]}"#,
        )
        .into_operation(bob())
        .unwrap();
        let mut buffer = "abcd".to_string();
        assert!(matches!(
            overlapping.apply_to(&mut buffer),
            Err(CollabError::InvalidOperation(_))
        ));
        assert_eq!(buffer, "abcd");
    }

    #[test]
    fn test_metadata_rejects_unknown_fields() {
        let result = wire(
            r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "metadata",
                "payload": {"title": "Plan", "colour": "red"}}"#,
        )
        .into_operation(bob());

        assert!(matches!(result, Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_unknown_kind_becomes_opaque() {
        let op = wire(
            r#"{"id": "4f9c1f0e-8d1b-4a57-9a43-2b5f6f0d7c11", "kind": "style",
                "payload": {"font": "serif", "size": 12}}"#,
        )
        .into_operation(bob())
        .unwrap();

        match &op.body {
            OperationBody::Opaque { tag, fields } => {
                assert_eq!(tag, "style");
                assert_eq!(fields["size"], b"12".to_vec());
            }
            other => panic!("unexpected body {:?}", other),
        }

        // Encoding gives back the original JSON values
        let encoded = WireOperation::from(&op);
        let payload = encoded.payload.unwrap();
        assert_eq!(payload["font"], json!("serif"));
        assert_eq!(payload["size"], json!(12));
    }

    #[test]
    fn test_outbound_message_shape() {
        let op = Operation::new(
            CollaboratorId::new("alice"),
            4,
            OperationBody::text(vec![TextEdit::retain(2)]),
        );
        let message = OutboundMessage::Operation {
            operation: WireOperation::from(&op),
        };

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "operation");
        assert_eq!(value["operation"]["kind"], "text");
        assert_eq!(value["operation"]["version"], 4);
        assert_eq!(value["operation"]["id"], op.id.to_string());
        assert_eq!(value["operation"]["edits"][0]["action"], "retain");
    }

    #[test]
    fn test_inbound_event_accepts_server_field_names() {
        let event = InboundEvent::from_json(
            r#"{"type": "collaborator_joined",
                "collaborator": {"user_id": "u7", "username": "dana", "avatar": "a.png"}}"#,
        )
        .unwrap();

        match event {
            InboundEvent::CollaboratorJoined { collaborator } => {
                assert_eq!(collaborator.id, CollaboratorId::new("u7"));
                assert_eq!(collaborator.display_name, "dana");
                assert_eq!(collaborator.avatar_url.as_deref(), Some("a.png"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
