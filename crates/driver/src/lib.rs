//! oplive driver: live queries kept current from the change stream.
//!
//! Each distinct query runs one [`OplogDriver`]: a task owning a
//! [`DriverState`] that holds the published window (what observers see) and,
//! for limited queries, a lookahead buffer of the next-best matches. Change
//! entries are applied in place when that is provably correct, trigger
//! per-document fetches when it is not, and fall back to a full re-query when
//! the stream itself cannot be trusted. [`LiveQueries`] shares drivers between
//! identical queries and ties writes to [`WriteFence`]s.

#![forbid(unsafe_code)]

mod config;
mod driver;
mod fence;
mod fetcher;
mod heap;
mod multiplexer;
mod registry;
mod state;
mod stats;

pub use config::DriverConfig;
pub use driver::{DriverContext, OplogDriver};
pub use fence::{FenceError, WriteFence, WriteToken};
pub use fetcher::DocFetcher;
pub use heap::{Comparator, IdHeap, MinMaxHeap};
pub use multiplexer::{Multiplexer, ObserverEvent, ResultSink};
pub use registry::{LiveQueries, ObserveHandle};
pub use state::{DriverState, Effect, Phase, QueryPlan, RequeryReason, Step, SwitchedToQuery, WindowSnapshot};
pub use stats::{DriverStats, StatsSnapshot};

use oplive_selector::SelectorError;
use oplive_store::StoreError;

/// Fatal driver errors; each one stops the driver and reaches observers as
/// an error event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DriverError {
    #[error("unknown change operation {0:?}")]
    UnknownOperation(String),
    #[error("malformed change entry: {0}")]
    MalformedEntry(String),
    #[error("initial query failed: {0}")]
    InitialQuery(StoreError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiveQueryError {
    #[error("query cannot be observed through the change stream: {0}")]
    Unsupported(String),
    #[error("selector: {0}")]
    Selector(#[from] SelectorError),
}
