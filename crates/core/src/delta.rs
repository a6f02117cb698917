//! Normalized update deltas.
//!
//! Change entries carry update modifiers in one of two encodings: the classic
//! `{$set, $unset}` form and the compact `{"$v": 2, "diff": {...}}` form. Both
//! are converted into a [`FieldDelta`], a flat list of path assignments and
//! removals that can be inspected by the selector engine or applied to a
//! cached document.

use serde_json::{Map, Value as Json};

use crate::doc::{set_path, unset_path, DeltaError, Document, FieldPath, PathError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("modifier is not an object")]
    NotAnObject,
    #[error("unsupported modifier operator {0}")]
    UnsupportedOperator(String),
    #[error("unsupported diff shape: {0}")]
    UnsupportedShape(String),
    #[error("bad field path: {0}")]
    BadPath(#[from] PathError),
}

/// Additive/subtractive field delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDelta {
    pub set: Vec<(FieldPath, Json)>,
    pub unset: Vec<FieldPath>,
}

impl FieldDelta {
    pub fn is_empty(&self) -> bool { self.set.is_empty() && self.unset.is_empty() }

    /// Every path touched by the delta.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.set.iter().map(|(p, _)| p).chain(self.unset.iter())
    }

    /// Normalize a modifier in either encoding.
    pub fn from_modifier(modifier: &Json) -> Result<Self, NormalizeError> {
        let obj = modifier.as_object().ok_or(NormalizeError::NotAnObject)?;
        match obj.get("$v").and_then(|v| v.as_u64()) {
            Some(2) => {
                let diff = obj
                    .get("diff")
                    .and_then(|d| d.as_object())
                    .ok_or_else(|| NormalizeError::UnsupportedShape("$v:2 without diff object".into()))?;
                let mut out = FieldDelta::default();
                convert_object_diff(None, diff, &mut out)?;
                Ok(out)
            }
            Some(1) | None => Self::from_v1(obj),
            Some(other) => Err(NormalizeError::UnsupportedShape(format!("$v:{}", other))),
        }
    }

    fn from_v1(obj: &Map<String, Json>) -> Result<Self, NormalizeError> {
        let mut out = FieldDelta::default();
        for (op, fields) in obj.iter() {
            match op.as_str() {
                "$v" => continue,
                "$set" => {
                    let fields = fields.as_object().ok_or_else(|| NormalizeError::UnsupportedShape("$set is not an object".into()))?;
                    for (k, v) in fields.iter() {
                        out.set.push((FieldPath::parse(k)?, v.clone()));
                    }
                }
                "$unset" => {
                    let fields = fields.as_object().ok_or_else(|| NormalizeError::UnsupportedShape("$unset is not an object".into()))?;
                    for k in fields.keys() {
                        out.unset.push(FieldPath::parse(k)?);
                    }
                }
                other => return Err(NormalizeError::UnsupportedOperator(other.to_string())),
            }
        }
        Ok(out)
    }

    /// True when any touched field or assigned value is custom-encoded and
    /// cannot be interpreted without an authoritative copy.
    pub fn touches_opaque(&self) -> bool {
        self.paths().any(|p| p.segments().iter().any(|s| is_opaque_key(s)))
            || self.set.iter().any(|(_, v)| is_opaque_value(v))
    }

    /// Apply to a document in place. Assignments first, then removals.
    pub fn apply_to(&self, doc: &mut Document) -> Result<(), DeltaError> {
        for (path, value) in self.set.iter() {
            set_path(doc, path, value.clone())?;
        }
        for path in self.unset.iter() {
            unset_path(doc, path)?;
        }
        Ok(())
    }
}

fn is_opaque_key(k: &str) -> bool {
    k.starts_with('$') || k.starts_with("EJSON$")
}

fn is_opaque_value(v: &Json) -> bool {
    match v {
        Json::Object(m) => m.keys().any(|k| is_opaque_key(k)) || m.values().any(is_opaque_value),
        Json::Array(a) => a.iter().any(is_opaque_value),
        _ => false,
    }
}

fn join(prefix: Option<&FieldPath>, seg: &str) -> Result<FieldPath, NormalizeError> {
    match prefix {
        Some(p) => {
            if seg.is_empty() {
                return Err(PathError::EmptySegment(p.to_string()).into());
            }
            Ok(p.child(seg))
        }
        None => Ok(FieldPath::parse(seg)?),
    }
}

fn sub_diff<'a>(key: &str, v: &'a Json) -> Result<&'a Map<String, Json>, NormalizeError> {
    v.as_object().ok_or_else(|| NormalizeError::UnsupportedShape(format!("sub-diff {} is not an object", key)))
}

fn is_array_diff(m: &Map<String, Json>) -> bool {
    m.get("a") == Some(&Json::Bool(true))
}

fn convert_object_diff(prefix: Option<&FieldPath>, diff: &Map<String, Json>, out: &mut FieldDelta) -> Result<(), NormalizeError> {
    for (key, val) in diff.iter() {
        match key.as_str() {
            "i" | "u" => {
                let fields = sub_diff(key, val)?;
                for (f, v) in fields.iter() {
                    out.set.push((join(prefix, f)?, v.clone()));
                }
            }
            "d" => {
                let fields = sub_diff(key, val)?;
                for f in fields.keys() {
                    out.unset.push(join(prefix, f)?);
                }
            }
            k if k.len() > 1 && k.starts_with('s') => {
                let path = join(prefix, &k[1..])?;
                let sub = sub_diff(key, val)?;
                if is_array_diff(sub) {
                    convert_array_diff(&path, sub, out)?;
                } else {
                    convert_object_diff(Some(&path), sub, out)?;
                }
            }
            other => return Err(NormalizeError::UnsupportedShape(format!("unknown diff key {:?}", other))),
        }
    }
    Ok(())
}

fn convert_array_diff(path: &FieldPath, diff: &Map<String, Json>, out: &mut FieldDelta) -> Result<(), NormalizeError> {
    for (key, val) in diff.iter() {
        if key == "a" { continue; }
        if key == "l" {
            return Err(NormalizeError::UnsupportedShape(format!("array resize at {}", path)));
        }
        let (kind, idx) = match (key.get(..1), key.get(1..)) {
            (Some(k), Some(i)) => (k, i),
            _ => return Err(NormalizeError::UnsupportedShape(format!("bad array diff key {:?} at {}", key, path))),
        };
        if idx.parse::<usize>().is_err() {
            return Err(NormalizeError::UnsupportedShape(format!("bad array diff key {:?} at {}", key, path)));
        }
        let elem = path.child(idx);
        match kind {
            "u" => out.set.push((elem, val.clone())),
            "s" => {
                let sub = sub_diff(key, val)?;
                if is_array_diff(sub) {
                    convert_array_diff(&elem, sub, out)?;
                } else {
                    convert_object_diff(Some(&elem), sub, out)?;
                }
            }
            _ => return Err(NormalizeError::UnsupportedShape(format!("bad array diff key {:?} at {}", key, path))),
        }
    }
    Ok(())
}
