use std::cmp::Ordering;

use oplive_core::{doc_id, Document, FieldDelta, FieldPath, Json, SortKey, SortOrder};

use crate::value::{compare_values, lookup_branches};
use crate::SelectorError;

/// Sort comparator. Documents with equal sort keys are ordered by `_id`, so
/// the order is total and the same everywhere it is used.
#[derive(Debug, Clone, Default)]
pub struct Sorter {
    keys: Vec<(FieldPath, SortOrder)>,
}

impl Sorter {
    pub fn compile(sort: Option<&[SortKey]>) -> Result<Self, SelectorError> {
        let mut keys = Vec::new();
        for k in sort.unwrap_or(&[]) {
            keys.push((FieldPath::parse(&k.path)?, k.order));
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.keys.iter().map(|(p, _)| p)
    }

    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (path, order) in self.keys.iter() {
            let va = sort_value(a, path, *order);
            let vb = sort_value(b, path, *order);
            let o = compare_values(&va, &vb);
            let o = match order {
                SortOrder::Asc => o,
                SortOrder::Desc => o.reverse(),
            };
            if o != Ordering::Equal {
                return o;
            }
        }
        doc_id(a).cmp(&doc_id(b))
    }

    /// Whether `delta` may change a document's position.
    pub fn affected_by_delta(&self, delta: &FieldDelta) -> bool {
        delta.paths().any(|p| {
            let p = p.without_indexes();
            self.paths().any(|q| q.overlaps(&p))
        })
    }
}

// Arrays sort by their smallest element ascending and largest descending.
fn sort_value(doc: &Document, path: &FieldPath, order: SortOrder) -> Json {
    let mut candidates: Vec<&Json> = Vec::new();
    for branch in lookup_branches(doc, path) {
        match branch {
            Json::Array(items) if !items.is_empty() => candidates.extend(items.iter()),
            other => candidates.push(other),
        }
    }
    let pick = match order {
        SortOrder::Asc => candidates.into_iter().min_by(|a, b| compare_values(a, b)),
        SortOrder::Desc => candidates.into_iter().max_by(|a, b| compare_values(a, b)),
    };
    pick.cloned().unwrap_or(Json::Null)
}
