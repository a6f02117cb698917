//! Change-log entries as delivered by the tailer.

use serde::{Deserialize, Serialize};

use crate::doc::{doc_id, DocId, Document};
use crate::Json;

/// Database + collection a change entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { db: db.into(), collection: collection.into() }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Commit position; strictly increasing in tailer order.
    pub ts: u64,
    pub ns: Namespace,
    #[serde(flatten)]
    pub op: EntryOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntryOp {
    Insert { doc: Document },
    Update { id: DocId, payload: UpdatePayload },
    Delete { id: DocId },
    Command { command: Command },
    /// Anything the engine does not know how to interpret.
    Other { kind: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePayload {
    /// Full replacement document (the `_id` may be omitted).
    Replace(Document),
    /// `{$set, $unset}` or `{"$v": 2, "diff": ...}` modifier.
    Modifier(Json),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    DropCollection { name: String },
    DropDatabase,
}

impl EntryOp {
    /// Document id the entry refers to; `None` for commands and malformed inserts.
    pub fn id(&self) -> Option<&str> {
        match self {
            EntryOp::Insert { doc } => doc_id(doc),
            EntryOp::Update { id, .. } | EntryOp::Delete { id } => Some(id.as_str()),
            EntryOp::Command { .. } | EntryOp::Other { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            EntryOp::Insert { .. } => "insert",
            EntryOp::Update { .. } => "update",
            EntryOp::Delete { .. } => "delete",
            EntryOp::Command { .. } => "command",
            EntryOp::Other { kind } => kind.as_str(),
        }
    }
}

impl ChangeEntry {
    /// Whether a command entry invalidates everything known about `ns`.
    pub fn drops(&self, ns: &Namespace) -> bool {
        match &self.op {
            EntryOp::Command { command: Command::DropDatabase } => self.ns.db == ns.db,
            EntryOp::Command { command: Command::DropCollection { name } } => self.ns.db == ns.db && name == &ns.collection,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_serde_shape() {
        let e: ChangeEntry = serde_json::from_value(json!({
            "ts": 7,
            "ns": {"db": "app", "collection": "items"},
            "op": "update",
            "id": "x1",
            "payload": {"modifier": {"$set": {"a": 1}}}
        }))
        .unwrap();
        assert_eq!(e.op.id(), Some("x1"));
        assert_eq!(e.op.kind(), "update");
        assert!(matches!(e.op, EntryOp::Update { payload: UpdatePayload::Modifier(_), .. }));
    }

    #[test]
    fn drop_commands_match_namespace() {
        let ns = Namespace::new("app", "items");
        let drop_db = ChangeEntry { ts: 1, ns: Namespace::new("app", "$cmd"), op: EntryOp::Command { command: Command::DropDatabase } };
        let drop_other = ChangeEntry {
            ts: 2,
            ns: Namespace::new("app", "$cmd"),
            op: EntryOp::Command { command: Command::DropCollection { name: "users".into() } },
        };
        let drop_ours = ChangeEntry {
            ts: 3,
            ns: Namespace::new("app", "$cmd"),
            op: EntryOp::Command { command: Command::DropCollection { name: "items".into() } },
        };
        assert!(drop_db.drops(&ns));
        assert!(!drop_other.drops(&ns));
        assert!(drop_ours.drops(&ns));
    }
}
