use std::time::Duration;

/// Driver tuning. `from_env` reads `OPLIVE_*` variables; `Default` is what
/// tests use.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Fixed delay between attempts of a failed re-query.
    pub requery_retry_delay: Duration,
    /// Panic on an internal invariant breach instead of re-querying.
    pub strict_invariants: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { requery_retry_delay: Duration::from_millis(100), strict_invariants: false }
    }
}

impl DriverConfig {
    pub fn from_env() -> Self {
        let retry_ms = std::env::var("OPLIVE_REQUERY_RETRY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(100);
        let strict_invariants = std::env::var("OPLIVE_STRICT_INVARIANTS")
            .ok()
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self { requery_retry_delay: Duration::from_millis(retry_ms), strict_invariants }
    }
}
