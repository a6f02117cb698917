//! Selector compiler.
//!
//! Supports field equality (with array containment), `$eq $ne $gt $gte $lt
//! $lte $in $nin $exists $regex $options $size $not`, and the logical
//! `$and $or $nor`. `$where`, `$text` and geo operators compile but flag the
//! matcher as unusable for change-stream driven observation.

use std::cmp::Ordering;

use oplive_core::{Document, FieldDelta, FieldPath, Json, ID_FIELD};
use regex::{Regex, RegexBuilder};
use serde_json::Map;
use tracing::debug;

use crate::value::{compare_values, lookup_branches, same_type_class};
use crate::SelectorError;

const GEO_OPERATORS: &[&str] = &["$near", "$nearSphere", "$geoWithin", "$geoIntersects", "$within"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance for geo-near queries; always `None` for supported selectors.
    pub distance: Option<f64>,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Nor(Vec<Node>),
    Field { path: FieldPath, test: FieldTest },
    /// `$where` / `$text`: never evaluated.
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum FieldTest {
    Eq(Json),
    Ne(Json),
    Cmp(CmpOp, Json),
    In(Vec<Json>),
    Nin(Vec<Json>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    Not(Box<FieldTest>),
    All(Vec<FieldTest>),
    Geo,
}

/// Compiled selector.
#[derive(Debug, Clone)]
pub struct Matcher {
    root: Node,
    paths: Vec<FieldPath>,
    has_where: bool,
    has_text: bool,
    has_geo: bool,
}

#[derive(Default)]
struct Flags {
    paths: Vec<FieldPath>,
    has_where: bool,
    has_text: bool,
    has_geo: bool,
}

impl Matcher {
    /// Compile a selector. A bare string selects by `_id`; `null` and `{}` match everything.
    pub fn compile(selector: &Json) -> Result<Self, SelectorError> {
        let mut flags = Flags::default();
        let root = match selector {
            Json::Null => Node::And(Vec::new()),
            Json::String(id) => {
                let path = FieldPath::single(ID_FIELD);
                flags.paths.push(path.clone());
                Node::Field { path, test: FieldTest::Eq(Json::String(id.clone())) }
            }
            Json::Object(m) => compile_doc(m, &mut flags)?,
            other => return Err(SelectorError::NotAnObject(other.to_string())),
        };
        flags.paths.sort();
        flags.paths.dedup();
        if flags.has_where || flags.has_text || flags.has_geo {
            debug!(
                has_where = flags.has_where,
                has_text = flags.has_text,
                has_geo = flags.has_geo,
                "selector needs server-side evaluation"
            );
        }
        Ok(Self { root, paths: flags.paths, has_where: flags.has_where, has_text: flags.has_text, has_geo: flags.has_geo })
    }

    pub fn matches(&self, doc: &Document) -> MatchResult {
        MatchResult { matched: eval(&self.root, doc), distance: None }
    }

    pub fn has_where(&self) -> bool { self.has_where }
    pub fn has_text(&self) -> bool { self.has_text }
    pub fn has_geo_query(&self) -> bool { self.has_geo }

    /// Free-text, JS-predicate or geo constructs: the oplog engine cannot evaluate these locally.
    pub fn uses_unsupported_constructs(&self) -> bool {
        self.has_where || self.has_text || self.has_geo
    }

    /// Field paths the selector reads.
    pub fn paths(&self) -> &[FieldPath] { &self.paths }

    /// Whether applying `delta` could change the match status of some document.
    pub fn affected_by_delta(&self, delta: &FieldDelta) -> bool {
        if self.has_where {
            return true;
        }
        delta.paths().any(|p| {
            let p = p.without_indexes();
            self.paths.iter().any(|q| q.overlaps(&p))
        })
    }

    /// Whether a document that does not match now could match after `delta`.
    ///
    /// Conservative: `false` only when some top-level conjunct is certainly
    /// violated by a value the delta writes or a path it removes.
    pub fn can_become_match_by_delta(&self, delta: &FieldDelta) -> bool {
        if !self.affected_by_delta(delta) {
            return false;
        }
        let mut conjuncts = Vec::new();
        collect_conjuncts(&self.root, &mut conjuncts);
        for (path, test) in conjuncts {
            for (p, v) in delta.set.iter() {
                if p == path && !test.matches_values(&[v]) {
                    return false;
                }
            }
            for u in delta.unset.iter() {
                if u.is_prefix_of(path) && !test.matches_values(&[]) {
                    return false;
                }
            }
        }
        true
    }
}

fn collect_conjuncts<'a>(node: &'a Node, out: &mut Vec<(&'a FieldPath, &'a FieldTest)>) {
    match node {
        Node::And(children) => children.iter().for_each(|c| collect_conjuncts(c, out)),
        Node::Field { path, test } => out.push((path, test)),
        _ => {}
    }
}

fn compile_doc(m: &Map<String, Json>, flags: &mut Flags) -> Result<Node, SelectorError> {
    let mut parts = Vec::with_capacity(m.len());
    for (key, val) in m.iter() {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let arr = val.as_array().filter(|a| !a.is_empty()).ok_or_else(|| SelectorError::BadOperand {
                    op: key.clone(),
                    reason: "expected a non-empty array".into(),
                })?;
                let mut children = Vec::with_capacity(arr.len());
                for sub in arr.iter() {
                    let sub = sub.as_object().ok_or_else(|| SelectorError::NotAnObject(sub.to_string()))?;
                    children.push(compile_doc(sub, flags)?);
                }
                parts.push(match key.as_str() {
                    "$and" => Node::And(children),
                    "$or" => Node::Or(children),
                    _ => Node::Nor(children),
                });
            }
            "$where" => {
                flags.has_where = true;
                parts.push(Node::Opaque);
            }
            "$text" => {
                flags.has_text = true;
                parts.push(Node::Opaque);
            }
            "$comment" => {}
            k if k.starts_with('$') => return Err(SelectorError::UnknownOperator(k.to_string())),
            k => {
                let path = FieldPath::parse(k)?;
                let test = compile_value(val, flags)?;
                flags.paths.push(path.clone());
                parts.push(Node::Field { path, test });
            }
        }
    }
    if parts.len() == 1 {
        if let Some(only) = parts.pop() {
            return Ok(only);
        }
    }
    Ok(Node::And(parts))
}

fn is_operator_object(m: &Map<String, Json>) -> Result<bool, SelectorError> {
    let ops = m.keys().filter(|k| k.starts_with('$')).count();
    if ops == 0 {
        return Ok(false);
    }
    if ops != m.len() {
        return Err(SelectorError::BadOperand { op: "(field)".into(), reason: "cannot mix operators and literal fields".into() });
    }
    Ok(true)
}

fn compile_value(val: &Json, flags: &mut Flags) -> Result<FieldTest, SelectorError> {
    if let Json::Object(m) = val {
        if is_operator_object(m)? {
            return compile_operators(m, flags);
        }
    }
    Ok(FieldTest::Eq(val.clone()))
}

fn compile_operators(m: &Map<String, Json>, flags: &mut Flags) -> Result<FieldTest, SelectorError> {
    let mut tests = Vec::with_capacity(m.len());
    for (op, arg) in m.iter() {
        let bad = |reason: &str| SelectorError::BadOperand { op: op.clone(), reason: reason.to_string() };
        let test = match op.as_str() {
            "$eq" => FieldTest::Eq(arg.clone()),
            "$ne" => FieldTest::Ne(arg.clone()),
            "$gt" => FieldTest::Cmp(CmpOp::Gt, arg.clone()),
            "$gte" => FieldTest::Cmp(CmpOp::Gte, arg.clone()),
            "$lt" => FieldTest::Cmp(CmpOp::Lt, arg.clone()),
            "$lte" => FieldTest::Cmp(CmpOp::Lte, arg.clone()),
            "$in" => FieldTest::In(arg.as_array().ok_or_else(|| bad("expected an array"))?.clone()),
            "$nin" => FieldTest::Nin(arg.as_array().ok_or_else(|| bad("expected an array"))?.clone()),
            "$exists" => FieldTest::Exists(arg.as_bool().unwrap_or_else(|| !arg.is_null() && arg != &Json::from(0))),
            "$size" => FieldTest::Size(arg.as_u64().ok_or_else(|| bad("expected a non-negative integer"))? as usize),
            "$regex" => {
                let pattern = arg.as_str().ok_or_else(|| bad("expected a string"))?;
                let options = m.get("$options").and_then(|o| o.as_str()).unwrap_or("");
                FieldTest::Regex(build_regex(pattern, options)?)
            }
            "$options" => {
                if !m.contains_key("$regex") {
                    return Err(bad("$options without $regex"));
                }
                continue;
            }
            "$not" => match arg {
                Json::Object(sub) if !sub.is_empty() && sub.keys().all(|k| k.starts_with('$')) => {
                    FieldTest::Not(Box::new(compile_operators(sub, flags)?))
                }
                Json::String(pattern) => FieldTest::Not(Box::new(FieldTest::Regex(build_regex(pattern, "")?))),
                _ => return Err(bad("expected an operator object")),
            },
            g if GEO_OPERATORS.contains(&g) => {
                flags.has_geo = true;
                FieldTest::Geo
            }
            other => return Err(SelectorError::UnknownOperator(other.to_string())),
        };
        tests.push(test);
    }
    if tests.len() == 1 {
        if let Some(only) = tests.pop() {
            return Ok(only);
        }
    }
    Ok(FieldTest::All(tests))
}

fn build_regex(pattern: &str, options: &str) -> Result<Regex, SelectorError> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| SelectorError::BadRegex(e.to_string()))
}

fn eval(node: &Node, doc: &Document) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| eval(c, doc)),
        Node::Or(children) => children.iter().any(|c| eval(c, doc)),
        Node::Nor(children) => !children.iter().any(|c| eval(c, doc)),
        Node::Field { path, test } => test.matches_values(&lookup_branches(doc, path)),
        Node::Opaque => false,
    }
}

fn values_equal(a: &Json, b: &Json) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Equality with array containment: `[1, 2]` equals `2` and `[1, 2]`.
fn branch_equals(branch: &Json, want: &Json) -> bool {
    if values_equal(branch, want) {
        return true;
    }
    match branch {
        Json::Array(items) => items.iter().any(|e| values_equal(e, want)),
        _ => false,
    }
}

fn elements(branch: &Json) -> Vec<&Json> {
    match branch {
        Json::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

impl FieldTest {
    fn matches_values(&self, branches: &[&Json]) -> bool {
        match self {
            FieldTest::Eq(want) => {
                if branches.is_empty() {
                    return want.is_null();
                }
                branches.iter().any(|b| branch_equals(b, want))
            }
            FieldTest::Ne(want) => !FieldTest::Eq(want.clone()).matches_values(branches),
            FieldTest::Cmp(op, bound) => branches.iter().flat_map(|b| elements(b)).any(|v| {
                if !same_type_class(v, bound) {
                    return false;
                }
                let o = compare_values(v, bound);
                match op {
                    CmpOp::Gt => o == Ordering::Greater,
                    CmpOp::Gte => o != Ordering::Less,
                    CmpOp::Lt => o == Ordering::Less,
                    CmpOp::Lte => o != Ordering::Greater,
                }
            }),
            FieldTest::In(options) => options.iter().any(|want| FieldTest::Eq(want.clone()).matches_values(branches)),
            FieldTest::Nin(options) => !FieldTest::In(options.clone()).matches_values(branches),
            FieldTest::Exists(want) => !branches.is_empty() == *want,
            FieldTest::Regex(re) => branches.iter().flat_map(|b| elements(b)).any(|v| v.as_str().is_some_and(|s| re.is_match(s))),
            FieldTest::Size(n) => branches.iter().any(|b| b.as_array().is_some_and(|a| a.len() == *n)),
            FieldTest::Not(inner) => !inner.matches_values(branches),
            FieldTest::All(tests) => tests.iter().all(|t| t.matches_values(branches)),
            FieldTest::Geo => false,
        }
    }
}
