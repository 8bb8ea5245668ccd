//! View service
//!
//! Orchestrates compilation, dependency analysis, versioning, persistence,
//! estimation and preview for managed views. Every save validates everything
//! before the first write, so a rejected request leaves no trace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pgview_common::config::PlatformConfig;
use pgview_common::error::{Error, Result};
use pgview_common::types::{
    DependencyType, PerformanceMetrics, ViewDependency, ViewPreviewRequest, ViewPreviewResult,
    ViewVersion,
};
use pgview_query::{
    compile, AnalysisInput, CompiledQuery, DependencyAnalyzer, DependencyReport, Dialect,
    PostgresDialect, QualifiedName, QueryBuilderConfig, RelationKind, SchemaCatalog,
};

use crate::backend::ViewBackend;
use crate::estimator::PerformanceEstimator;
use crate::events::{NoopEventSink, ViewEvent, ViewEventSink};
use crate::model::{
    CreateViewRequest, DatabaseView, DriftReport, RequestContext, SavedView, UpdateViewRequest,
    ViewDefinitionRequest,
};
use crate::preview::{validate_read_only_sql, PreviewExecutor};
use crate::repository::{InMemoryViewRepository, ViewRepository};
use crate::versions::{InMemoryVersionStore, VersionManager, VersionStore};

/// Catalog that also knows the views this service manages
struct ManagedCatalog<'a> {
    inner: &'a dyn SchemaCatalog,
    views: HashSet<QualifiedName>,
}

impl SchemaCatalog for ManagedCatalog<'_> {
    fn relation_kind(&self, schema: &str, name: &str) -> Option<RelationKind> {
        if self.views.contains(&QualifiedName::new(schema, name)) {
            return Some(RelationKind::View);
        }
        self.inner.relation_kind(schema, name)
    }

    fn has_column(&self, schema: &str, table: &str, column: &str) -> Option<bool> {
        self.inner.has_column(schema, table, column)
    }
}

/// A validated definition ready to be written
struct PreparedDefinition {
    sql: String,
    config: Option<QueryBuilderConfig>,
    report: DependencyReport,
}

pub struct ViewService {
    config: PlatformConfig,
    dialect: Arc<dyn Dialect>,
    catalog: Arc<dyn SchemaCatalog>,
    views: Arc<dyn ViewRepository>,
    versions: VersionManager,
    estimator: PerformanceEstimator,
    previews: PreviewExecutor,
    events: Arc<dyn ViewEventSink>,
}

impl ViewService {
    /// Service with in-memory view and version storage and no event sink
    pub fn new(
        config: PlatformConfig,
        backend: Arc<dyn ViewBackend>,
        catalog: Arc<dyn SchemaCatalog>,
    ) -> Self {
        Self {
            estimator: PerformanceEstimator::new(Arc::clone(&backend), &config.estimator),
            previews: PreviewExecutor::new(backend, &config.preview),
            dialect: Arc::new(PostgresDialect),
            catalog,
            views: Arc::new(InMemoryViewRepository::new()),
            versions: VersionManager::new(Arc::new(InMemoryVersionStore::new())),
            events: Arc::new(NoopEventSink),
            config,
        }
    }

    #[must_use]
    pub fn with_view_repository(mut self, views: Arc<dyn ViewRepository>) -> Self {
        self.views = views;
        self
    }

    #[must_use]
    pub fn with_version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.versions = VersionManager::new(store);
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn ViewEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Compile `config` for the service's dialect.
    ///
    /// # Errors
    /// Returns `Error::Compilation` naming the offending field.
    pub fn compile(&self, config: &QueryBuilderConfig) -> Result<CompiledQuery> {
        compile(config, self.dialect.as_ref())
    }

    /// Dependencies of a config or raw SQL against the schema catalog only
    pub fn analyze(&self, input: AnalysisInput<'_>) -> DependencyReport {
        DependencyAnalyzer::new(self.catalog.as_ref(), &self.config.compiler.default_schema)
            .analyze(input)
    }

    /// Create a view and record its first version.
    ///
    /// # Errors
    /// `Error::Validation` for a malformed request or a self-referencing
    /// view, `Error::Compilation` for an invalid config,
    /// `Error::ViewAlreadyExists` when the name is taken.
    pub async fn create_view(
        &self,
        ctx: &RequestContext,
        request: CreateViewRequest,
    ) -> Result<SavedView> {
        if self
            .views
            .find_by_name(ctx.connection_id, &request.schema, &request.name)
            .await?
            .is_some()
        {
            return Err(Error::ViewAlreadyExists(format!(
                "{}.{}",
                request.schema, request.name
            )));
        }

        let view_id = Uuid::new_v4();
        let prepared = self.prepare(ctx, &request).await?;

        let version = self
            .versions
            .record_version_after(
                view_id,
                None,
                prepared.sql.clone(),
                request.change_notes.clone(),
                ctx.actor.clone(),
            )
            .await?;

        let now = Utc::now();
        let view = DatabaseView {
            id: view_id,
            connection_id: ctx.connection_id,
            name: request.name,
            schema: request.schema,
            description: request.description,
            sql_definition: prepared.sql,
            query_builder_config: prepared.config,
            dependencies: prepared.report.names(),
            performance_metrics: None,
            created_by: ctx.actor.clone(),
            created_at: now,
            updated_at: now,
            current_version: version.version,
        };
        let dependencies = prepared.report.to_view_dependencies(view_id);
        self.views.insert(view.clone(), dependencies.clone()).await?;

        info!(view_id = %view_id, view = %view.qualified_name(), actor = %ctx.actor, "Created view");
        self.events.publish(ViewEvent::Created { view: view.clone() }).await;
        self.events
            .publish(ViewEvent::VersionRecorded { version: version.clone() })
            .await;

        Ok(SavedView {
            view,
            version,
            dependencies,
            warnings: prepared.report.warnings(),
        })
    }

    /// Replace a view's definition and record a new version.
    ///
    /// # Errors
    /// As [`ViewService::create_view`], plus `Error::ViewNotFound` and
    /// `Error::VersionConflict` when a concurrent save won.
    pub async fn update_view(
        &self,
        ctx: &RequestContext,
        view_id: Uuid,
        request: UpdateViewRequest,
    ) -> Result<SavedView> {
        let existing = self.get_view_for(ctx, view_id).await?;
        let prepared = self.prepare(ctx, &request).await?;

        let version = self
            .versions
            .record_version_after(
                view_id,
                Some(existing.current_version),
                prepared.sql.clone(),
                request.change_notes.clone(),
                ctx.actor.clone(),
            )
            .await?;

        let view = DatabaseView {
            name: request.name,
            schema: request.schema,
            description: request.description,
            sql_definition: prepared.sql,
            query_builder_config: prepared.config,
            dependencies: prepared.report.names(),
            updated_at: Utc::now(),
            current_version: version.version,
            ..existing.clone()
        };
        let dependencies = prepared.report.to_view_dependencies(view_id);
        self.views
            .replace_if_version(view.clone(), dependencies.clone(), existing.current_version)
            .await?;

        info!(
            view_id = %view_id,
            version = %version.version,
            actor = %ctx.actor,
            "Updated view"
        );
        self.events.publish(ViewEvent::Updated { view: view.clone() }).await;
        self.events
            .publish(ViewEvent::VersionRecorded { version: version.clone() })
            .await;

        Ok(SavedView {
            view,
            version,
            dependencies,
            warnings: prepared.report.warnings(),
        })
    }

    /// # Errors
    /// Returns `Error::ViewNotFound` for an unknown id.
    pub async fn get_view(&self, view_id: Uuid) -> Result<DatabaseView> {
        self.views
            .get(view_id)
            .await?
            .ok_or(Error::ViewNotFound(view_id))
    }

    /// Views of the caller's connection
    ///
    /// # Errors
    /// Propagates repository failures.
    pub async fn list_views(&self, ctx: &RequestContext) -> Result<Vec<DatabaseView>> {
        self.views.list(ctx.connection_id).await
    }

    /// Version history, newest first
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_versions(&self, view_id: Uuid) -> Result<Vec<ViewVersion>> {
        self.versions.list_versions(view_id).await
    }

    /// # Errors
    /// Returns `Error::ViewNotFound` for an unknown id.
    pub async fn view_dependencies(&self, view_id: Uuid) -> Result<Vec<ViewDependency>> {
        self.views.dependencies(view_id).await
    }

    /// Preview a stored view. Config views are recompiled so their bound
    /// values travel with the SQL.
    ///
    /// # Errors
    /// `Error::ViewNotFound`, `Error::Compilation` if the stored config no
    /// longer compiles, and the preview errors of [`PreviewExecutor`].
    pub async fn preview_view(
        &self,
        view_id: Uuid,
        limit: Option<i64>,
    ) -> Result<ViewPreviewResult> {
        let view = self.get_view(view_id).await?;
        let result = match &view.query_builder_config {
            Some(config) => {
                let compiled = self.compile(config)?;
                self.previews.preview(&compiled, limit).await?
            }
            None => {
                self.previews
                    .preview_sql(&ViewPreviewRequest {
                        sql_definition: view.sql_definition.clone(),
                        limit,
                    })
                    .await?
            }
        };

        if let Some(mut metrics) = view.performance_metrics {
            metrics.execution_time = Some(result.execution_time);
            self.views.set_metrics(view_id, metrics).await?;
        }
        Ok(result)
    }

    /// Preview ad-hoc SQL.
    ///
    /// # Errors
    /// See [`PreviewExecutor::preview_sql`].
    pub async fn preview_sql(&self, request: &ViewPreviewRequest) -> Result<ViewPreviewResult> {
        self.previews.preview_sql(request).await
    }

    /// Preview a query the caller just compiled.
    ///
    /// # Errors
    /// See [`PreviewExecutor::preview`].
    pub async fn preview_compiled(
        &self,
        compiled: &CompiledQuery,
        limit: Option<i64>,
    ) -> Result<ViewPreviewResult> {
        self.previews.preview(compiled, limit).await
    }

    /// Plan estimate for a compiled query, without touching any view.
    ///
    /// # Errors
    /// Returns `Error::Estimation` on any backend failure.
    pub async fn estimate(&self, compiled: &CompiledQuery) -> Result<PerformanceMetrics> {
        self.estimator.estimate(compiled).await
    }

    /// Re-estimate a view and store the result. On failure the stored
    /// metrics are left as they were.
    ///
    /// # Errors
    /// `Error::ViewNotFound`, or `Error::Estimation` when the plan request
    /// failed.
    pub async fn refresh_metrics(&self, view_id: Uuid) -> Result<PerformanceMetrics> {
        let view = self.get_view(view_id).await?;
        let compiled = match &view.query_builder_config {
            Some(config) => self.compile(config)?,
            None => CompiledQuery::raw(view.sql_definition.clone()),
        };

        let mut metrics = match self.estimator.estimate(&compiled).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(view_id = %view_id, error = %e, "Metrics refresh failed, keeping stored metrics");
                return Err(e);
            }
        };
        metrics.execution_time = view
            .performance_metrics
            .as_ref()
            .and_then(|m| m.execution_time);

        self.views.set_metrics(view_id, metrics.clone()).await?;
        debug!(view_id = %view_id, cost = metrics.cost, rows = metrics.row_count, "Refreshed metrics");
        Ok(metrics)
    }

    /// Recompile a stored config and compare with the stored SQL.
    ///
    /// # Errors
    /// `Error::ViewNotFound`, or `Error::Compilation` when the stored config
    /// no longer compiles.
    pub async fn check_drift(&self, view_id: Uuid) -> Result<DriftReport> {
        let view = self.get_view(view_id).await?;
        let compiled_sql = match &view.query_builder_config {
            Some(config) => Some(self.compile(config)?.sql),
            None => None,
        };
        let drifted = compiled_sql
            .as_deref()
            .is_some_and(|sql| sql != view.sql_definition);
        if drifted {
            warn!(view_id = %view_id, "Stored SQL differs from compiled config");
        }

        Ok(DriftReport {
            view_id,
            drifted,
            stored_sql: view.sql_definition,
            compiled_sql,
        })
    }

    async fn get_view_for(&self, ctx: &RequestContext, view_id: Uuid) -> Result<DatabaseView> {
        match self.views.get(view_id).await? {
            Some(view) if view.connection_id == ctx.connection_id => Ok(view),
            _ => Err(Error::ViewNotFound(view_id)),
        }
    }

    async fn prepare(
        &self,
        ctx: &RequestContext,
        request: &ViewDefinitionRequest,
    ) -> Result<PreparedDefinition> {
        self.validate_name("name", &request.name)?;
        self.validate_name("schema", &request.schema)?;

        let (sql, field) = match &request.query_builder_config {
            Some(config) => (self.compile(config)?.sql, "queryBuilderConfig"),
            None => (
                validate_read_only_sql(&request.sql_definition)?,
                "sqlDefinition",
            ),
        };

        let managed = self.views.list(ctx.connection_id).await?;
        let catalog = ManagedCatalog {
            inner: self.catalog.as_ref(),
            views: managed
                .iter()
                .map(|v| QualifiedName::new(&v.schema, &v.name))
                .collect(),
        };
        let analyzer = DependencyAnalyzer::new(&catalog, &self.config.compiler.default_schema);
        let report = match &request.query_builder_config {
            Some(config) => analyzer.analyze(AnalysisInput::Structured(config)),
            None => analyzer.analyze(AnalysisInput::RawSql(&sql)),
        };

        let own = format!("{}.{}", request.schema, request.name);
        self.check_view_references(&own, &report, &managed, field)
            .await?;

        Ok(PreparedDefinition {
            sql,
            config: request.query_builder_config.clone(),
            report,
        })
    }

    fn validate_name(&self, field: &str, value: &str) -> Result<()> {
        self.dialect
            .quote_identifier(value)
            .map(|_| ())
            .map_err(|e| Error::validation(field, e.to_string()))
    }

    /// Reject a view that reads from itself, directly or through other
    /// managed views
    async fn check_view_references(
        &self,
        own: &str,
        report: &DependencyReport,
        managed: &[DatabaseView],
        field: &str,
    ) -> Result<()> {
        let by_name: HashMap<String, Uuid> =
            managed.iter().map(|v| (v.qualified_name(), v.id)).collect();

        let mut pending: Vec<String> = report
            .dependencies
            .iter()
            .filter(|d| d.dependency_type == DependencyType::View)
            .map(|d| d.name.to_string())
            .collect();
        let mut seen = HashSet::new();

        while let Some(name) = pending.pop() {
            if name == own {
                return Err(Error::validation(
                    field,
                    format!("view {own} cannot depend on itself"),
                ));
            }
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(id) = by_name.get(&name) {
                pending.extend(
                    self.views
                        .dependencies(*id)
                        .await?
                        .iter()
                        .filter(|d| d.dependency_type == DependencyType::View)
                        .map(|d| d.target().to_string()),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::memory::ScriptedBackend;
    use pgview_common::types::{DependsOn, ParamValue, VersionLabel};
    use pgview_query::{
        FilterCondition, FilterOperator, InMemoryCatalog, RelationInfo, SelectedColumn,
        SelectedTable,
    };

    struct Fixture {
        service: ViewService,
        backend: ScriptedBackend,
        events: Arc<RecordingEventSink>,
        ctx: RequestContext,
    }

    fn fixture() -> Fixture {
        let backend = ScriptedBackend::new().with_plan(ScriptedBackend::plan(42.0, 7));
        let catalog = InMemoryCatalog::with_relations(vec![
            RelationInfo::table("public", "orders"),
            RelationInfo::table("public", "customers"),
        ]);
        let events = Arc::new(RecordingEventSink::new());
        let service = ViewService::new(
            PlatformConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(catalog),
        )
        .with_event_sink(events.clone());
        Fixture {
            service,
            backend,
            events,
            ctx: RequestContext::new("alice", Uuid::new_v4()),
        }
    }

    fn paid_orders() -> QueryBuilderConfig {
        QueryBuilderConfig {
            tables: vec![SelectedTable::new("public", "orders")],
            columns: vec![SelectedColumn::new("orders", "id")],
            filters: vec![FilterCondition::scalar(
                "status",
                FilterOperator::Eq,
                ParamValue::Text("paid".to_string()),
            )],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_overrides_caller_sql() {
        let f = fixture();
        let mut request = CreateViewRequest::structured("reporting", "paid_orders", paid_orders());
        request.sql_definition = "SELECT 'stale'".to_string();

        let saved = f.service.create_view(&f.ctx, request).await.unwrap();
        assert_eq!(
            saved.view.sql_definition,
            r#"SELECT "orders"."id" FROM "public"."orders" WHERE "orders"."status" = $1"#
        );
        assert_eq!(saved.version.version, VersionLabel::INITIAL);
        assert_eq!(saved.view.dependencies, vec!["public.orders"]);
        assert!(saved.warnings.is_empty());
        assert_eq!(
            f.events.event_names(),
            vec!["view.created", "view.version_recorded"]
        );
    }

    #[tokio::test]
    async fn test_compile_failure_writes_nothing() {
        let f = fixture();
        let mut config = paid_orders();
        config.columns.push(SelectedColumn::new("shipments", "id"));
        let request = CreateViewRequest::structured("reporting", "broken", config);

        let err = f.service.create_view(&f.ctx, request).await.unwrap_err();
        assert_eq!(err.error_code(), "compilation_error");
        assert!(f.service.list_views(&f.ctx).await.unwrap().is_empty());
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let f = fixture();
        let err = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "", "SELECT 1"))
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("name"));

        let err = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "v", "DROP TABLE orders"))
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("sqlDefinition"));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_update_records_next_version() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::structured("reporting", "paid", paid_orders()))
            .await
            .unwrap();

        let mut config = paid_orders();
        config.filters[0].value = Some(pgview_query::FilterValue::Scalar(ParamValue::Text(
            "shipped".to_string(),
        )));
        let updated = f
            .service
            .update_view(
                &f.ctx,
                saved.view.id,
                UpdateViewRequest::structured("reporting", "paid", config).with_change_notes("shipped"),
            )
            .await
            .unwrap();

        assert_eq!(updated.version.version.to_string(), "1.1");
        assert_eq!(updated.view.created_at, saved.view.created_at);
        let history = f.service.list_versions(saved.view.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_notes.as_deref(), Some("shipped"));
    }

    #[tokio::test]
    async fn test_update_from_other_connection_is_not_found() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "v", "SELECT 1"))
            .await
            .unwrap();
        let stranger = RequestContext::new("mallory", Uuid::new_v4());
        let err = f
            .service
            .update_view(&stranger, saved.view.id, UpdateViewRequest::raw_sql("public", "v", "SELECT 2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ViewNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let f = fixture();
        let request = CreateViewRequest::raw_sql("public", "v", "SELECT 1");
        f.service.create_view(&f.ctx, request.clone()).await.unwrap();
        let err = f.service.create_view(&f.ctx, request).await.unwrap_err();
        assert!(matches!(err, Error::ViewAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_view_on_view_dependency_and_cycle() {
        let f = fixture();
        let base = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "paid", "SELECT * FROM orders"))
            .await
            .unwrap();

        let top = f
            .service
            .create_view(
                &f.ctx,
                CreateViewRequest::raw_sql("public", "top_paid", "SELECT * FROM paid LIMIT 10"),
            )
            .await
            .unwrap();
        assert_eq!(
            top.dependencies[0].depends_on,
            DependsOn::DependsOnView("public.paid".to_string())
        );

        let err = f
            .service
            .update_view(
                &f.ctx,
                base.view.id,
                UpdateViewRequest::raw_sql("public", "paid", "SELECT * FROM top_paid"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("sqlDefinition"));
        assert_eq!(f.service.list_versions(base.view.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_relation_is_warning() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "v", "SELECT * FROM ghosts"))
            .await
            .unwrap();
        assert_eq!(saved.warnings.len(), 1);
        assert_eq!(saved.warnings[0].identifier, "public.ghosts");
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_metrics() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::structured("reporting", "paid", paid_orders()))
            .await
            .unwrap();

        let metrics = f.service.refresh_metrics(saved.view.id).await.unwrap();
        assert_eq!(metrics.row_count, 7);

        f.backend.fail_with("connection reset");
        let err = f.service.refresh_metrics(saved.view.id).await.unwrap_err();
        assert!(matches!(err, Error::Estimation(_)));

        let stored = f.service.get_view(saved.view.id).await.unwrap();
        assert_eq!(stored.performance_metrics, Some(metrics));
    }

    #[tokio::test]
    async fn test_preview_view_records_execution_time() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::structured("reporting", "paid", paid_orders()))
            .await
            .unwrap();
        f.service.refresh_metrics(saved.view.id).await.unwrap();

        f.service.preview_view(saved.view.id, Some(5)).await.unwrap();
        let stored = f.service.get_view(saved.view.id).await.unwrap();
        assert!(stored.performance_metrics.unwrap().execution_time.is_some());
        assert!(f
            .backend
            .statements()
            .iter()
            .any(|s| s.ends_with("\"orders\".\"status\" = $1 LIMIT 5")));
    }

    #[tokio::test]
    async fn test_check_drift() {
        let f = fixture();
        let saved = f
            .service
            .create_view(&f.ctx, CreateViewRequest::structured("reporting", "paid", paid_orders()))
            .await
            .unwrap();
        let report = f.service.check_drift(saved.view.id).await.unwrap();
        assert!(!report.drifted);
        assert_eq!(report.compiled_sql.as_deref(), Some(report.stored_sql.as_str()));

        let raw = f
            .service
            .create_view(&f.ctx, CreateViewRequest::raw_sql("public", "raw", "SELECT 1"))
            .await
            .unwrap();
        let report = f.service.check_drift(raw.view.id).await.unwrap();
        assert!(!report.drifted);
        assert!(report.compiled_sql.is_none());
    }
}
