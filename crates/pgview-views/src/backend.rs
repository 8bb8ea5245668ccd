//! Backend seam for plan and preview execution
//!
//! A backend hands out sessions from a bounded pool. Every statement runs in
//! a read-only transaction that is rolled back afterwards, never committed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use pgview_common::error::{Error, Result};
use pgview_common::types::{ParamValue, PreviewColumn};

/// Rows returned by a preview query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<PreviewColumn>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
}

/// Source of sessions against one target connection
#[async_trait]
pub trait ViewBackend: Send + Sync {
    /// Check a session out of the pool, waiting at most the acquire timeout
    async fn session(&self) -> Result<Box<dyn BackendSession>>;
}

/// One checked-out connection
#[async_trait]
pub trait BackendSession: Send {
    /// Open a read-only transaction whose statements the server aborts after
    /// `statement_timeout`
    async fn begin_read_only(&mut self, statement_timeout: Duration) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// JSON plan for `sql` without executing it
    async fn explain(&mut self, sql: &str, params: &[ParamValue]) -> Result<JsonValue>;

    async fn query(&mut self, sql: &str, params: &[ParamValue]) -> Result<QueryRows>;

    /// Handle able to abort the statement currently running on this session
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;

    /// Close the connection instead of returning it to the pool
    fn discard(&mut self);
}

#[async_trait]
pub trait CancelHandle: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}

/// Statement run by [`run_read_only`]
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    Explain { sql: &'a str, params: &'a [ParamValue] },
    Query { sql: &'a str, params: &'a [ParamValue] },
}

#[derive(Debug)]
pub enum StatementOutput {
    Plan(JsonValue),
    Rows(QueryRows),
}

/// Why a guarded run produced no output
#[derive(Debug)]
pub enum RunFailure {
    /// The deadline passed; the remote statement was cancelled
    TimedOut,
    Failed(Error),
}

/// Run one statement inside a rolled-back read-only transaction.
///
/// On timeout the in-flight statement is cancelled on the server and the
/// connection is discarded rather than reused.
pub async fn run_read_only(
    backend: &dyn ViewBackend,
    statement: Statement<'_>,
    timeout: Duration,
) -> std::result::Result<StatementOutput, RunFailure> {
    let mut session = backend.session().await.map_err(RunFailure::Failed)?;
    let cancel = session.cancel_handle();

    let work = async {
        session.begin_read_only(timeout).await?;
        match statement {
            Statement::Explain { sql, params } => {
                session.explain(sql, params).await.map(StatementOutput::Plan)
            }
            Statement::Query { sql, params } => {
                session.query(sql, params).await.map(StatementOutput::Rows)
            }
        }
    };
    let outcome = tokio::time::timeout(timeout, work).await;

    match outcome {
        Ok(result) => {
            if let Err(e) = session.rollback().await {
                warn!(error = %e, "Rollback failed, discarding connection");
                session.discard();
            }
            result.map_err(RunFailure::Failed)
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "Statement timed out, cancelling");
            if let Err(e) = cancel.cancel().await {
                warn!(error = %e, "Cancel request failed");
            }
            session.discard();
            Err(RunFailure::TimedOut)
        }
    }
}
