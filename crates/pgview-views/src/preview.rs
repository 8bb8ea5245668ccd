//! Bounded preview execution

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlparser::ast::{Statement as SqlStatement, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use pgview_common::config::PreviewConfig;
use pgview_common::error::{Error, Result};
use pgview_common::types::{ViewPreviewRequest, ViewPreviewResult};
use pgview_query::CompiledQuery;

use crate::backend::{run_read_only, RunFailure, Statement, StatementOutput, ViewBackend};

/// Rejects statements nested inside a query that would write
struct WriteGuard;

impl Visitor for WriteGuard {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &SqlStatement) -> ControlFlow<()> {
        if matches!(statement, SqlStatement::Query(_)) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}

/// Check that `sql` is exactly one query with no data-modifying parts and
/// return the parsed query rendered back to SQL. The rendering carries no
/// comments or semicolons, so it can be embedded as a subquery.
///
/// # Errors
/// Returns `Error::Validation` on field `sqlDefinition` otherwise.
pub fn validate_read_only_sql(sql: &str) -> Result<String> {
    let trimmed = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(Error::validation("sqlDefinition", "SQL definition is empty"));
    }

    let statements = Parser::parse_sql(&PostgreSqlDialect {}, trimmed)
        .map_err(|e| Error::validation("sqlDefinition", format!("invalid SQL: {e}")))?;
    match statements.as_slice() {
        [statement @ SqlStatement::Query(_)] => {
            if statement.visit(&mut WriteGuard).is_break() {
                return Err(Error::validation(
                    "sqlDefinition",
                    "data-modifying statements are not allowed in a view",
                ));
            }
            Ok(statement.to_string())
        }
        [_] => Err(Error::validation(
            "sqlDefinition",
            "only SELECT queries can define a view",
        )),
        _ => Err(Error::validation(
            "sqlDefinition",
            "exactly one statement is required",
        )),
    }
}

/// Runs compiled or hand-written queries with a row and time bound
pub struct PreviewExecutor {
    backend: Arc<dyn ViewBackend>,
    config: PreviewConfig,
}

impl PreviewExecutor {
    pub fn new(backend: Arc<dyn ViewBackend>, config: &PreviewConfig) -> Self {
        Self {
            backend,
            config: config.clone(),
        }
    }

    /// Row limit actually applied: non-positive or missing requests get the
    /// default, everything else is capped at the ceiling.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<i64>) -> u32 {
        let ceiling = self.config.ceiling();
        match requested {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX).min(ceiling),
            _ => self.config.default_limit.clamp(1, ceiling),
        }
    }

    /// Preview compiled SQL with the configured timeout.
    ///
    /// # Errors
    /// `Error::ExecutionTimeout` when the deadline passes, `Error::Execution`
    /// when the database rejects the query, `Error::Pool` when no connection
    /// is available.
    pub async fn preview(
        &self,
        compiled: &CompiledQuery,
        limit: Option<i64>,
    ) -> Result<ViewPreviewResult> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        self.preview_within(compiled, limit, timeout).await
    }

    /// Preview compiled SQL, aborting after `timeout`.
    ///
    /// # Errors
    /// See [`PreviewExecutor::preview`].
    pub async fn preview_within(
        &self,
        compiled: &CompiledQuery,
        limit: Option<i64>,
        timeout: Duration,
    ) -> Result<ViewPreviewResult> {
        let limit = self.effective_limit(limit);
        let sql = format!("{} LIMIT {limit}", compiled.sql);
        self.execute(&sql, compiled, timeout).await
    }

    /// Preview hand-written SQL. The query is wrapped as a subquery so its
    /// own clauses stay untouched.
    ///
    /// # Errors
    /// `Error::Validation` when the SQL is not a single read-only query, plus
    /// everything [`PreviewExecutor::preview`] returns.
    pub async fn preview_sql(&self, request: &ViewPreviewRequest) -> Result<ViewPreviewResult> {
        let sql = validate_read_only_sql(&request.sql_definition)?;
        let limit = self.effective_limit(request.limit);
        let wrapped = format!("SELECT * FROM ({sql}) AS \"preview\" LIMIT {limit}");
        let timeout = Duration::from_millis(self.config.timeout_ms);
        self.execute(&wrapped, &CompiledQuery::raw(sql), timeout).await
    }

    async fn execute(
        &self,
        sql: &str,
        compiled: &CompiledQuery,
        timeout: Duration,
    ) -> Result<ViewPreviewResult> {
        debug!(sql = %sql, params = compiled.params.len(), "Running preview");
        let started = Instant::now();
        let statement = Statement::Query {
            sql,
            params: &compiled.params,
        };

        let rows = match run_read_only(self.backend.as_ref(), statement, timeout).await {
            Ok(StatementOutput::Rows(rows)) => rows,
            Ok(StatementOutput::Plan(_)) => {
                return Err(Error::Internal("backend returned a plan for a query".to_string()))
            }
            Err(RunFailure::TimedOut) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "Preview timed out");
                return Err(Error::ExecutionTimeout { timeout_ms });
            }
            Err(RunFailure::Failed(e)) => {
                warn!(error = %e, "Preview failed");
                return Err(e);
            }
        };

        Ok(ViewPreviewResult {
            row_count: rows.rows.len(),
            columns: rows.columns,
            rows: rows.rows,
            execution_time: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}
