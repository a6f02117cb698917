//! Documents, ids and dotted field paths.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

pub type DocId = String;

/// A stored document. Always a JSON object carrying a string `_id`.
pub type Document = Map<String, Json>;

pub const ID_FIELD: &str = "_id";

/// Extract the `_id` of a document, if it is a string.
pub fn doc_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(|v| v.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty field path")]
    Empty,
    #[error("empty segment in field path {0:?}")]
    EmptySegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("cannot modify immutable field _id")]
    ImmutableId,
    #[error("cannot create field under non-container value at {path}")]
    NotTraversable { path: String },
    #[error("segment {segment:?} of {path} is not an array index")]
    BadIndex { path: String, segment: String },
    #[error("index {index} of {path} pads an array of length {len} past the limit")]
    IndexTooFar { path: String, index: usize, len: usize },
}

/// How far past its end an array may be padded with nulls by a single set.
pub const MAX_ARRAY_PADDING: usize = 1024;

/// Dotted field path (`a.b.0.c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segs: SmallVec<[String; 4]>,
}

impl FieldPath {
    pub fn parse(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let mut segs = SmallVec::new();
        for seg in s.split('.') {
            if seg.is_empty() {
                return Err(PathError::EmptySegment(s.to_string()));
            }
            segs.push(seg.to_string());
        }
        Ok(Self { segs })
    }

    pub fn segments(&self) -> &[String] { &self.segs }

    pub fn first(&self) -> &str { &self.segs[0] }

    pub fn len(&self) -> usize { self.segs.len() }

    pub fn is_empty(&self) -> bool { self.segs.is_empty() }

    /// Path extended by one more segment.
    pub fn child(&self, seg: &str) -> Self {
        let mut segs = self.segs.clone();
        segs.push(seg.to_string());
        Self { segs }
    }

    /// Single-segment path. The caller guarantees `seg` is non-empty and dot-free.
    pub fn single(seg: &str) -> Self {
        let mut segs = SmallVec::new();
        segs.push(seg.to_string());
        Self { segs }
    }

    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.segs.len() <= other.segs.len() && self.segs.iter().zip(other.segs.iter()).all(|(a, b)| a == b)
    }

    /// Two paths overlap when one is a prefix of the other; a write to one may change the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Path with numeric (array index) segments removed, as used to compare
    /// against selector and sort paths that traverse arrays implicitly.
    pub fn without_indexes(&self) -> FieldPath {
        let segs: SmallVec<[String; 4]> = self.segs.iter().filter(|s| s.parse::<usize>().is_err()).cloned().collect();
        if segs.is_empty() { return self.clone(); }
        Self { segs }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segs.join("."))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PathError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::parse(&s) }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> String { p.to_string() }
}

/// Look up a path without array fan-out; numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &FieldPath) -> Option<&'a Json> {
    let (head, rest) = path.segments().split_first()?;
    let mut cur = doc.get(head)?;
    for seg in rest {
        cur = match cur {
            Json::Object(m) => m.get(seg)?,
            Json::Array(a) => a.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Set `value` at `path`, creating intermediate objects and padding arrays with nulls.
pub fn set_path(doc: &mut Document, path: &FieldPath, value: Json) -> Result<(), DeltaError> {
    if path.first() == ID_FIELD {
        return Err(DeltaError::ImmutableId);
    }
    let segs = path.segments();
    if segs.len() == 1 {
        doc.insert(segs[0].clone(), value);
        return Ok(());
    }
    let child = doc.entry(segs[0].clone()).or_insert_with(|| Json::Object(Map::new()));
    set_in(child, &segs[1..], value, path)
}

fn set_in(target: &mut Json, segs: &[String], value: Json, path: &FieldPath) -> Result<(), DeltaError> {
    let (seg, rest) = match segs.split_first() {
        Some(s) => s,
        None => return Ok(()),
    };
    match target {
        Json::Object(map) => {
            if rest.is_empty() {
                map.insert(seg.clone(), value);
                return Ok(());
            }
            let child = map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new()));
            set_in(child, rest, value, path)
        }
        Json::Array(arr) => {
            let idx = seg.parse::<usize>().map_err(|_| DeltaError::BadIndex { path: path.to_string(), segment: seg.clone() })?;
            if idx >= arr.len() {
                let new_len = idx
                    .checked_add(1)
                    .filter(|n| *n - arr.len() <= MAX_ARRAY_PADDING)
                    .ok_or_else(|| DeltaError::IndexTooFar { path: path.to_string(), index: idx, len: arr.len() })?;
                arr.resize(new_len, Json::Null);
            }
            if rest.is_empty() {
                arr[idx] = value;
                return Ok(());
            }
            if arr[idx].is_null() {
                arr[idx] = Json::Object(Map::new());
            }
            set_in(&mut arr[idx], rest, value, path)
        }
        _ => Err(DeltaError::NotTraversable { path: path.to_string() }),
    }
}

/// Remove the value at `path`. Missing paths are a no-op; array slots are nulled, not removed.
pub fn unset_path(doc: &mut Document, path: &FieldPath) -> Result<(), DeltaError> {
    if path.first() == ID_FIELD {
        return Err(DeltaError::ImmutableId);
    }
    let segs = path.segments();
    if segs.len() == 1 {
        doc.remove(&segs[0]);
        return Ok(());
    }
    match doc.get_mut(&segs[0]) {
        Some(child) => {
            unset_in(child, &segs[1..]);
            Ok(())
        }
        None => Ok(()),
    }
}

fn unset_in(target: &mut Json, segs: &[String]) {
    let Some((seg, rest)) = segs.split_first() else { return; };
    match target {
        Json::Object(map) => {
            if rest.is_empty() {
                map.remove(seg);
            } else if let Some(child) = map.get_mut(seg) {
                unset_in(child, rest);
            }
        }
        Json::Array(arr) => {
            let Ok(idx) = seg.parse::<usize>() else { return; };
            if idx >= arr.len() { return; }
            if rest.is_empty() {
                arr[idx] = Json::Null;
            } else {
                unset_in(&mut arr[idx], rest);
            }
        }
        _ => {}
    }
}
