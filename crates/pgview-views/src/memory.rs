//! Scripted in-memory backend
//!
//! Answers plans and queries from canned data and records every statement it
//! receives. Used for development without a database and throughout tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use pgview_common::error::{Error, Result};
use pgview_common::types::ParamValue;

use crate::backend::{BackendSession, CancelHandle, QueryRows, ViewBackend};

#[derive(Debug, Default)]
struct Script {
    plan: JsonValue,
    rows: QueryRows,
    delay: Duration,
    failure: Option<String>,
}

/// Backend answering from canned data
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    log: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicUsize>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                plan: Self::plan(0.0, 0),
                ..Default::default()
            })),
            log: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// EXPLAIN (FORMAT JSON) shaped plan with the given estimates
    pub fn plan(total_cost: f64, plan_rows: u64) -> JsonValue {
        json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Startup Cost": 0.0,
                "Total Cost": total_cost,
                "Plan Rows": plan_rows,
                "Plan Width": 8
            },
            "Planning Time": 0.05
        }])
    }

    #[must_use]
    pub fn with_plan(self, plan: JsonValue) -> Self {
        self.script.lock().plan = plan;
        self
    }

    #[must_use]
    pub fn with_rows(self, rows: QueryRows) -> Self {
        self.script.lock().rows = rows;
        self
    }

    /// Every statement sleeps this long before answering
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = delay;
        self
    }

    /// Every statement fails with `message`
    pub fn fail_with(&self, message: impl Into<String>) {
        self.script.lock().failure = Some(message.into());
    }

    pub fn clear_failure(&self) {
        self.script.lock().failure = None;
    }

    /// Statements received so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    fn record(&self, statement: impl Into<String>) {
        self.log.lock().push(statement.into());
    }
}

#[async_trait]
impl ViewBackend for ScriptedBackend {
    async fn session(&self) -> Result<Box<dyn BackendSession>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            backend: self.clone(),
            discarded: false,
        }))
    }
}

struct ScriptedSession {
    backend: ScriptedBackend,
    discarded: bool,
}

impl ScriptedSession {
    async fn answer(&self) -> Result<()> {
        if self.discarded {
            return Err(Error::Execution("session was discarded".to_string()));
        }
        let (delay, failure) = {
            let script = self.backend.script.lock();
            (script.delay, script.failure.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(Error::Execution(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendSession for ScriptedSession {
    async fn begin_read_only(&mut self, statement_timeout: Duration) -> Result<()> {
        self.backend.record("BEGIN READ ONLY");
        self.backend.record(format!(
            "SET LOCAL statement_timeout = {}",
            statement_timeout.as_millis()
        ));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.backend.record("ROLLBACK");
        Ok(())
    }

    async fn explain(&mut self, sql: &str, _params: &[ParamValue]) -> Result<JsonValue> {
        self.backend.record(format!("EXPLAIN (FORMAT JSON) {sql}"));
        self.answer().await?;
        Ok(self.backend.script.lock().plan.clone())
    }

    async fn query(&mut self, sql: &str, _params: &[ParamValue]) -> Result<QueryRows> {
        self.backend.record(sql);
        self.answer().await?;

        let mut rows = self.backend.script.lock().rows.clone();
        if let Some(limit) = trailing_limit(sql) {
            rows.rows.truncate(limit);
        }
        Ok(rows)
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(ScriptedCancel {
            backend: self.backend.clone(),
        })
    }

    fn discard(&mut self) {
        self.discarded = true;
        self.backend.record("DISCARD");
    }
}

struct ScriptedCancel {
    backend: ScriptedBackend,
}

#[async_trait]
impl CancelHandle for ScriptedCancel {
    async fn cancel(&self) -> Result<()> {
        self.backend.record("CANCEL");
        Ok(())
    }
}

fn trailing_limit(sql: &str) -> Option<usize> {
    let (_, tail) = sql.rsplit_once(" LIMIT ")?;
    tail.trim().parse().ok()
}
