//! Configuration for observed handles.

use std::time::Duration;

/// Default number of statements kept in a transaction's summary log.
pub const DEFAULT_MAX_LOGGED_QUERIES: usize = 7;

/// Configuration options for an [`ObservedConnection`](crate::ObservedConnection).
///
/// # Example
///
/// ```rust
/// use sea_orm_observe::ObserveConfig;
/// use std::time::Duration;
///
/// let config = ObserveConfig::default()
///     .with_slow_query_threshold(Duration::from_millis(250))
///     .with_max_logged_queries(10);
/// ```
#[derive(Debug, Clone)]
pub struct ObserveConfig {
    /// Calls taking at least this long are logged at WARN level.
    /// Default: 2s
    pub slow_query_threshold: Duration,

    /// How many statements a transaction keeps for its completion log.
    /// The total statement count is always reported regardless of this cap.
    /// Default: 7
    pub max_logged_queries: usize,

    /// Whether to run the background pool statistics poller.
    /// Default: `true`
    pub monitor_pool: bool,

    /// How often the pool poller samples statistics.
    /// Default: 60s
    pub pool_monitor_interval: Duration,

    /// Database name recorded on spans as `db.name`.
    /// Default: `None`
    pub database_name: Option<String>,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_secs(2),
            max_logged_queries: DEFAULT_MAX_LOGGED_QUERIES,
            monitor_pool: true,
            pool_monitor_interval: Duration::from_secs(60),
            database_name: None,
        }
    }
}

impl ObserveConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the threshold for slow query warnings.
    ///
    /// The comparison is inclusive, so a zero threshold flags every call.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Set how many statements a transaction keeps for its summary.
    pub fn with_max_logged_queries(mut self, max: usize) -> Self {
        self.max_logged_queries = max;
        self
    }

    /// Enable or disable the background pool poller.
    pub fn with_pool_monitor(mut self, enabled: bool) -> Self {
        self.monitor_pool = enabled;
        self
    }

    /// Set the pool sampling interval.
    pub fn with_pool_monitor_interval(mut self, interval: Duration) -> Self {
        self.pool_monitor_interval = interval;
        self
    }

    /// Set a database name to include in spans.
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// A configuration that flags anything slower than 100ms and samples the
    /// pool every 10 seconds.
    pub fn development() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(100),
            pool_monitor_interval: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// A configuration for production traffic.
    pub fn production() -> Self {
        Self::default()
    }
}
