/// Position-only operational transform for text operations
use crate::{Operation, OperationBody, TextEdit};

/// Rewrite `op` so it applies to a document that already reflects `against`.
///
/// Only text operations are rewritten. Overlapping spans are not merged here;
/// that is left to conflict detection and resolution.
pub fn transform(op: &Operation, against: &Operation) -> Operation {
    let mut transformed = op.clone();

    if let (OperationBody::Text { edits }, OperationBody::Text { edits: applied }) =
        (&mut transformed.body, &against.body)
    {
        for edit in edits.iter_mut() {
            transform_edit(edit, applied);
        }
    }

    transformed
}

/// Shift a single edit past every edit of an already applied operation,
/// walking `applied` in its own order.
pub fn transform_edit(edit: &mut TextEdit, applied: &[TextEdit]) {
    let position = edit.position_mut();

    for other in applied {
        match other {
            TextEdit::Insert { position: p, .. } if *p <= *position => {
                *position = position.saturating_add(other.inserted_len());
            }
            TextEdit::Delete {
                position: p,
                length,
            } if *p < *position => {
                let overlap = (*length).min(*position - *p);
                *position -= overlap;
            }
            _ => {}
        }
    }
}
