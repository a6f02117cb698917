//! oplive selector engine: compiles query selectors into document predicates,
//! sort specifications into comparators, and field specs into projections.
//! Everything here is pure; no state survives between calls.

#![forbid(unsafe_code)]

mod matcher;
mod projection;
mod sort;
mod value;

pub use matcher::{MatchResult, Matcher};
pub use projection::Projection;
pub use sort::Sorter;
pub use value::{compare_values, lookup_branches};

use oplive_core::PathError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector must be an object, got {0}")]
    NotAnObject(String),
    #[error("unknown operator {0}")]
    UnknownOperator(String),
    #[error("bad operand for {op}: {reason}")]
    BadOperand { op: String, reason: String },
    #[error("bad regex: {0}")]
    BadRegex(String),
    #[error("bad field path: {0}")]
    BadPath(#[from] PathError),
    #[error("unsupported projection: {0}")]
    UnsupportedProjection(String),
}
