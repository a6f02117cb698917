//! Query descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub path: String,
    pub order: SortOrder,
}

/// Immutable description of a live query. Two observers with equal
/// descriptors share one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection: String,
    #[serde(default = "empty_selector")]
    pub selector: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Json>>,
}

fn empty_selector() -> Json {
    Json::Object(Map::new())
}

impl QueryDescriptor {
    pub fn new(collection: impl Into<String>, selector: Json) -> Self {
        Self { collection: collection.into(), selector, sort: None, limit: None, skip: 0, fields: None }
    }

    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.get_or_insert_with(Vec::new).push(SortKey { path: path.into(), order });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn fields(mut self, fields: Map<String, Json>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// The limit as the engine applies it: a limit of 0 means no limit.
    pub fn effective_limit(&self) -> Option<usize> {
        self.limit.filter(|n| *n > 0)
    }

    /// Canonical string form used to share engines between identical observers.
    /// Object keys serialize sorted, so equal descriptors give equal keys.
    pub fn dedup_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
