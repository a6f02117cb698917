//! Field projection (`fields` option).

use std::collections::BTreeMap;

use oplive_core::{Document, FieldPath, Json, ID_FIELD};
use serde_json::Map;

use crate::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Include,
    Exclude,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PathTree(BTreeMap<String, PathNode>);

#[derive(Debug, Clone, PartialEq)]
enum PathNode {
    Leaf,
    Branch(PathTree),
}

impl PathTree {
    fn insert(&mut self, segs: &[String]) {
        let Some((head, rest)) = segs.split_first() else { return; };
        if rest.is_empty() {
            self.0.insert(head.clone(), PathNode::Leaf);
            return;
        }
        let node = self.0.entry(head.clone()).or_insert_with(|| PathNode::Branch(PathTree::default()));
        if let PathNode::Branch(sub) = node {
            sub.insert(rest);
        }
    }

    fn paths(&self, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
        for (k, node) in self.0.iter() {
            prefix.push(k.clone());
            match node {
                PathNode::Leaf => {
                    if let Ok(p) = FieldPath::parse(&prefix.join(".")) {
                        out.push(p);
                    }
                }
                PathNode::Branch(sub) => sub.paths(prefix, out),
            }
            prefix.pop();
        }
    }
}

/// Compiled projection. Supports plain inclusion or exclusion lists; `_id`
/// may be excluded from an inclusion list.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mode: Mode,
    tree: PathTree,
    include_id: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Self { mode: Mode::All, tree: PathTree::default(), include_id: true }
    }
}

impl Projection {
    pub fn compile(fields: Option<&Map<String, Json>>) -> Result<Self, SelectorError> {
        let Some(fields) = fields else { return Ok(Self::default()); };
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut include_id = true;
        for (key, val) in fields.iter() {
            if key.contains('$') {
                return Err(SelectorError::UnsupportedProjection(format!("positional or operator key {:?}", key)));
            }
            let on = match val {
                Json::Bool(b) => *b,
                Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Json::Object(_) => return Err(SelectorError::UnsupportedProjection(format!("operator on {:?}", key))),
                other => return Err(SelectorError::UnsupportedProjection(format!("value {} for {:?}", other, key))),
            };
            if key == ID_FIELD {
                include_id = on;
                continue;
            }
            let path = FieldPath::parse(key)?;
            if on { include.push(path) } else { exclude.push(path) }
        }
        if !include.is_empty() && !exclude.is_empty() {
            return Err(SelectorError::UnsupportedProjection("mixed inclusion and exclusion".into()));
        }
        let mut tree = PathTree::default();
        if !include.is_empty() {
            include.iter().for_each(|p| tree.insert(p.segments()));
            return Ok(Self { mode: Mode::Include, tree, include_id });
        }
        exclude.iter().for_each(|p| tree.insert(p.segments()));
        if !include_id {
            tree.insert(&[ID_FIELD.to_string()]);
        }
        if tree.0.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self { mode: Mode::Exclude, tree, include_id })
    }

    /// Projection that additionally keeps `required` paths and `_id`; used
    /// for cached copies so the engine can re-evaluate selector and sort.
    pub fn with_required<'a>(&self, required: impl IntoIterator<Item = &'a FieldPath>) -> Projection {
        let required: Vec<&FieldPath> = required.into_iter().collect();
        match self.mode {
            Mode::All => Projection::default(),
            Mode::Include => {
                let mut tree = self.tree.clone();
                for p in required {
                    tree.insert(p.segments());
                }
                Projection { mode: Mode::Include, tree, include_id: true }
            }
            Mode::Exclude => {
                let mut kept = Vec::new();
                self.tree.paths(&mut Vec::new(), &mut kept);
                let mut tree = PathTree::default();
                for p in kept.iter().filter(|p| p.first() != ID_FIELD && !required.iter().any(|r| r.overlaps(p))) {
                    tree.insert(p.segments());
                }
                if tree.0.is_empty() {
                    return Projection::default();
                }
                Projection { mode: Mode::Exclude, tree, include_id: true }
            }
        }
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self.mode {
            Mode::All => doc.clone(),
            Mode::Include => {
                let mut out = filter_include(doc, &self.tree);
                if self.include_id {
                    if let Some(id) = doc.get(ID_FIELD) {
                        out.insert(ID_FIELD.to_string(), id.clone());
                    }
                }
                out
            }
            Mode::Exclude => {
                let mut out = doc.clone();
                strip_exclude(&mut out, &self.tree);
                out
            }
        }
    }
}

fn filter_include(src: &Map<String, Json>, tree: &PathTree) -> Map<String, Json> {
    let mut out = Map::new();
    for (seg, node) in tree.0.iter() {
        let Some(v) = src.get(seg) else { continue; };
        match (node, v) {
            (PathNode::Leaf, v) => {
                out.insert(seg.clone(), v.clone());
            }
            (PathNode::Branch(sub), Json::Object(m)) => {
                out.insert(seg.clone(), Json::Object(filter_include(m, sub)));
            }
            (PathNode::Branch(sub), Json::Array(items)) => {
                let kept = items.iter().filter_map(|e| e.as_object().map(|m| Json::Object(filter_include(m, sub)))).collect();
                out.insert(seg.clone(), Json::Array(kept));
            }
            _ => {}
        }
    }
    out
}

fn strip_exclude(target: &mut Map<String, Json>, tree: &PathTree) {
    for (seg, node) in tree.0.iter() {
        match node {
            PathNode::Leaf => {
                target.remove(seg);
            }
            PathNode::Branch(sub) => match target.get_mut(seg) {
                Some(Json::Object(m)) => strip_exclude(m, sub),
                Some(Json::Array(items)) => {
                    for e in items.iter_mut() {
                        if let Json::Object(m) = e {
                            strip_exclude(m, sub);
                        }
                    }
                }
                _ => {}
            },
        }
    }
}
