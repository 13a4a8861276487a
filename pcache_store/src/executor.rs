//! The seam through which workers execute fragment queries against the
//! user's database.
//!
//! The worker only ever needs one operation: "run this SELECT, give me its
//! distinct values, stop early past a cap". Keeping the seam this narrow
//! lets tests substitute canned results and artificial delays.

use async_trait::async_trait;
use data_types::{Datatype, Value};
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::time::Duration;

/// Errors from fragment execution.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ExecError {
    #[snafu(display("statement timed out after {timeout:?}"))]
    Timeout { timeout: Duration },

    #[snafu(display("fragment execution failed: {message}"))]
    Execution { message: String },
}

/// Convenience result alias for this module.
pub type Result<T, E = ExecError> = std::result::Result<T, E>;

/// Result of fetching a fragment's value set.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The complete distinct value set.
    Values(Vec<Value>),
    /// More than `limit` distinct values were produced; the fetch stopped
    /// early and no values are returned.
    LimitExceeded {
        /// The configured cap that was hit.
        limit: usize,
    },
}

/// Executes fragment queries against the database that owns the fact table.
#[async_trait]
pub trait FragmentExecutor: Debug + Send + Sync {
    /// Run `sql` under `timeout` and collect its distinct values of
    /// `datatype`, stopping early once `limit` distinct values are reached.
    async fn fetch_values(
        &self,
        sql: &str,
        datatype: Datatype,
        limit: Option<usize>,
        timeout: Duration,
    ) -> Result<FetchOutcome>;
}

/// Canned-response executor for tests.
///
/// Responses are keyed on the exact fragment SQL; unknown statements fall
/// back to the configured default or fail. An artificial delay at or above
/// the statement timeout turns into a [`ExecError::Timeout`].
#[derive(Debug, Default)]
pub struct MockExecutor {
    responses: Mutex<HashMap<String, Vec<Value>>>,
    default: Mutex<Option<Vec<Value>>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    /// Create an executor with no canned responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to exactly `sql` with `values`.
    pub fn with_response(self, sql: impl Into<String>, values: Vec<Value>) -> Self {
        self.responses.lock().insert(sql.into(), values);
        self
    }

    /// Respond to any unmatched statement with `values`.
    pub fn with_default(self, values: Vec<Value>) -> Self {
        *self.default.lock() = Some(values);
        self
    }

    /// Delay every execution by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Statements executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FragmentExecutor for MockExecutor {
    async fn fetch_values(
        &self,
        sql: &str,
        _datatype: Datatype,
        limit: Option<usize>,
        timeout: Duration,
    ) -> Result<FetchOutcome> {
        self.calls.lock().push(sql.to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return TimeoutSnafu { timeout }.fail();
            }
            tokio::time::sleep(delay).await;
        }

        let values = {
            let responses = self.responses.lock();
            match responses.get(sql) {
                Some(values) => values.clone(),
                None => match self.default.lock().clone() {
                    Some(values) => values,
                    None => {
                        return ExecutionSnafu {
                            message: format!("no canned response for: {sql}"),
                        }
                        .fail()
                    }
                },
            }
        };

        let distinct: BTreeSet<Value> = values.into_iter().collect();
        if let Some(limit) = limit {
            if distinct.len() >= limit {
                return Ok(FetchOutcome::LimitExceeded { limit });
            }
        }
        Ok(FetchOutcome::Values(distinct.into_iter().collect()))
    }
}
