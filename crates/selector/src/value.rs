use std::cmp::Ordering;

use oplive_core::{Document, FieldPath, Json};

// Cross-type order: null < numbers < strings < objects < arrays < booleans.
fn type_rank(v: &Json) -> u8 {
    match v {
        Json::Null => 0,
        Json::Number(_) => 1,
        Json::String(_) => 2,
        Json::Object(_) => 3,
        Json::Array(_) => 4,
        Json::Bool(_) => 5,
    }
}

pub(crate) fn same_type_class(a: &Json, b: &Json) -> bool {
    type_rank(a) == type_rank(b)
}

/// Total order over JSON values, consistent across the matcher, the sorter and the store.
pub fn compare_values(a: &Json, b: &Json) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let o = compare_values(ex, ey);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Json::Object(x), Json::Object(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let o = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Values reachable at `path`, fanning out over arrays met on the way
/// (`a.b` over `{a: [{b: 1}, {b: 2}]}` yields `1` and `2`). Numeric segments
/// index arrays directly. Missing paths yield nothing.
pub fn lookup_branches<'a>(doc: &'a Document, path: &FieldPath) -> Vec<&'a Json> {
    let segs = path.segments();
    let mut out = Vec::new();
    if let Some(v) = doc.get(&segs[0]) {
        walk(v, &segs[1..], &mut out);
    }
    out
}

fn walk<'a>(v: &'a Json, rest: &[String], out: &mut Vec<&'a Json>) {
    let Some((seg, tail)) = rest.split_first() else {
        out.push(v);
        return;
    };
    match v {
        Json::Object(m) => {
            if let Some(child) = m.get(seg) {
                walk(child, tail, out);
            }
        }
        Json::Array(arr) => {
            if let Ok(idx) = seg.parse::<usize>() {
                if let Some(child) = arr.get(idx) {
                    walk(child, tail, out);
                }
            } else {
                for elem in arr.iter() {
                    if let Json::Object(m) = elem {
                        if let Some(child) = m.get(seg) {
                            walk(child, tail, out);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}
