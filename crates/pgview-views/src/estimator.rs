//! Plan-only performance estimation

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use pgview_common::config::EstimatorConfig;
use pgview_common::error::{Error, Result};
use pgview_common::types::PerformanceMetrics;
use pgview_query::CompiledQuery;

use crate::backend::{run_read_only, RunFailure, Statement, StatementOutput, ViewBackend};

/// Asks the planner for cost and row estimates without running the query
pub struct PerformanceEstimator {
    backend: Arc<dyn ViewBackend>,
    timeout: Duration,
}

impl PerformanceEstimator {
    pub fn new(backend: Arc<dyn ViewBackend>, config: &EstimatorConfig) -> Self {
        Self {
            backend,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Estimate with the configured timeout.
    ///
    /// # Errors
    /// Returns `Error::Estimation` on timeout, connection failure, or an
    /// unreadable plan.
    pub async fn estimate(&self, compiled: &CompiledQuery) -> Result<PerformanceMetrics> {
        self.estimate_within(compiled, self.timeout).await
    }

    /// Estimate, aborting the plan request after `timeout`.
    ///
    /// # Errors
    /// Returns `Error::Estimation` on timeout, connection failure, or an
    /// unreadable plan.
    pub async fn estimate_within(
        &self,
        compiled: &CompiledQuery,
        timeout: Duration,
    ) -> Result<PerformanceMetrics> {
        debug!(sql = %compiled.sql, "Requesting query plan");
        let started = Instant::now();
        let statement = Statement::Explain {
            sql: &compiled.sql,
            params: &compiled.params,
        };

        let plan = match run_read_only(self.backend.as_ref(), statement, timeout).await {
            Ok(StatementOutput::Plan(plan)) => plan,
            Ok(StatementOutput::Rows(_)) => {
                return Err(Error::Estimation("backend returned rows for a plan request".to_string()))
            }
            Err(RunFailure::TimedOut) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Plan request timed out");
                return Err(Error::Estimation(format!(
                    "plan request timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            Err(RunFailure::Failed(e)) => {
                warn!(error = %e, "Plan request failed");
                return Err(Error::Estimation(e.to_string()));
            }
        };
        let planning_time = started.elapsed().as_secs_f64() * 1000.0;

        let (cost, row_count) = parse_plan(&plan)?;
        Ok(PerformanceMetrics {
            execution_time: None,
            planning_time,
            row_count,
            cost,
            last_analyzed: Utc::now(),
        })
    }
}

/// Total cost and row estimate of the root plan node
fn parse_plan(plan: &JsonValue) -> Result<(f64, u64)> {
    let root = plan
        .get(0)
        .and_then(|p| p.get("Plan"))
        .ok_or_else(|| Error::Estimation("plan has no root node".to_string()))?;
    let cost = root
        .get("Total Cost")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| Error::Estimation("plan has no total cost".to_string()))?;
    let rows = root
        .get("Plan Rows")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| Error::Estimation("plan has no row estimate".to_string()))?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rows = rows.max(0.0).round() as u64;
    Ok((cost, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedBackend;

    fn estimator(backend: &ScriptedBackend) -> PerformanceEstimator {
        PerformanceEstimator::new(Arc::new(backend.clone()), &EstimatorConfig::default())
    }

    #[tokio::test]
    async fn test_estimate_reads_plan() {
        let backend = ScriptedBackend::new().with_plan(ScriptedBackend::plan(1234.5, 870));
        let compiled = CompiledQuery::raw(r#"SELECT * FROM "public"."orders""#);

        let metrics = estimator(&backend).estimate(&compiled).await.unwrap();
        assert!((metrics.cost - 1234.5).abs() < f64::EPSILON);
        assert_eq!(metrics.row_count, 870);
        assert!(metrics.planning_time >= 0.0);
        assert!(metrics.execution_time.is_none());

        let statements = backend.statements();
        assert_eq!(statements[0], "BEGIN READ ONLY");
        assert!(statements.iter().any(|s| s.starts_with("EXPLAIN (FORMAT JSON) SELECT")));
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_estimation_error() {
        let backend = ScriptedBackend::new();
        backend.fail_with("connection refused");
        let err = estimator(&backend)
            .estimate(&CompiledQuery::raw("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Estimation(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_remote_statement() {
        let backend = ScriptedBackend::new().with_delay(Duration::from_secs(30));
        let err = estimator(&backend)
            .estimate_within(&CompiledQuery::raw("SELECT 1"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Estimation(_)));
        let statements = backend.statements();
        assert!(statements.contains(&"CANCEL".to_string()));
        assert!(statements.contains(&"DISCARD".to_string()));
    }

    #[test]
    fn test_parse_plan_rejects_malformed() {
        assert!(parse_plan(&serde_json::json!([{"Plan": {"Plan Rows": 1}}])).is_err());
        assert!(parse_plan(&serde_json::json!({})).is_err());
    }
}
