//! oplive core types: documents, field paths, change entries and query descriptors.

#![forbid(unsafe_code)]

pub mod delta;
pub mod doc;
pub mod entry;
pub mod query;

pub use delta::{FieldDelta, NormalizeError};
pub use doc::{doc_id, DeltaError, DocId, Document, FieldPath, PathError, ID_FIELD};
pub use entry::{ChangeEntry, Command, EntryOp, Namespace, UpdatePayload};
pub use query::{QueryDescriptor, SortKey, SortOrder};

/// JSON value alias used across the workspace.
pub type Json = serde_json::Value;

/// Top-level field changes sent with a `changed` notification.
/// `None` means the field was cleared.
pub type ChangedFields = std::collections::BTreeMap<String, Option<Json>>;

pub mod prelude {
    pub use super::{
        ChangeEntry, ChangedFields, Command, DocId, Document, EntryOp, FieldDelta, FieldPath, Json,
        Namespace, QueryDescriptor, SortKey, SortOrder, UpdatePayload,
    };
}

/// Top-level diff between two versions of a document, skipping `_id`.
pub fn changed_fields(new_doc: &Document, old_doc: &Document) -> ChangedFields {
    let mut out = ChangedFields::new();
    for (k, v) in new_doc.iter() {
        if k == ID_FIELD { continue; }
        if old_doc.get(k) != Some(v) {
            out.insert(k.clone(), Some(v.clone()));
        }
    }
    for k in old_doc.keys() {
        if k == ID_FIELD { continue; }
        if !new_doc.contains_key(k) {
            out.insert(k.clone(), None);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Json) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn changed_fields_reports_sets_and_clears() {
        let old = obj(json!({"_id": "x", "a": 1, "b": 2, "c": {"d": 1}}));
        let new = obj(json!({"_id": "x", "a": 1, "b": 3, "e": true, "c": {"d": 1}}));
        let diff = changed_fields(&new, &old);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff["b"], Some(json!(3)));
        assert_eq!(diff["e"], Some(json!(true)));

        let back = changed_fields(&old, &new);
        assert_eq!(back["e"], None);
        assert_eq!(back["b"], Some(json!(2)));
    }
}
