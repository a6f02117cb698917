//! Replay scenarios: a seeded collection, one live query and a list of steps.

use oplive_core::{Document, Json, QueryDescriptor};
use oplive_store::UpdateEncoding;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub encoding: Encoding,
    pub query: QueryDescriptor,
    #[serde(default)]
    pub seed: Vec<Document>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_database() -> String { "app".to_string() }

/// How the store encodes field updates in the change stream.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Classic,
    #[default]
    Diff,
}

impl From<Encoding> for UpdateEncoding {
    fn from(e: Encoding) -> Self {
        match e {
            Encoding::Classic => UpdateEncoding::Classic,
            Encoding::Diff => UpdateEncoding::Diff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    Insert { doc: Document },
    Update { id: String, modifier: Json },
    Replace { id: String, doc: Document },
    Remove { id: String },
    /// Drop a collection; defaults to the observed one.
    Drop {
        #[serde(default)]
        collection: Option<String>,
    },
    Gap,
    Failover,
    Fence,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Insert { .. } => "insert",
            Step::Update { .. } => "update",
            Step::Replace { .. } => "replace",
            Step::Remove { .. } => "remove",
            Step::Drop { .. } => "drop",
            Step::Gap => "gap",
            Step::Failover => "failover",
            Step::Fence => "fence",
        }
    }

    /// Short human label, e.g. `update a`.
    pub fn label(&self) -> String {
        match self {
            Step::Insert { doc } => format!("insert {}", oplive_core::doc_id(doc).unwrap_or("?")),
            Step::Update { id, .. } | Step::Replace { id, .. } | Step::Remove { id } => format!("{} {}", self.name(), id),
            Step::Drop { collection: Some(c) } => format!("drop {}", c),
            other => other.name().to_string(),
        }
    }
}

pub fn parse(text: &str) -> Result<Scenario, serde_yaml::Error> {
    serde_yaml::from_str(text)
}
