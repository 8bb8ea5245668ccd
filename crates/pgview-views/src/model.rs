//! Persisted view records and the create/update request shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pgview_common::types::{
    DependencyWarning, PerformanceMetrics, VersionLabel, ViewDependency, ViewVersion,
};
use pgview_query::QueryBuilderConfig;

/// Caller identity and target connection, passed explicitly per call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub actor: String,
    pub connection_id: Uuid,
}

impl RequestContext {
    pub fn new(actor: impl Into<String>, connection_id: Uuid) -> Self {
        Self {
            actor: actor.into(),
            connection_id,
        }
    }
}

/// Body of a create or update request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinitionRequest {
    pub name: String,
    pub schema: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Ignored and recomputed when `query_builder_config` is present
    #[serde(default)]
    pub sql_definition: String,
    #[serde(default)]
    pub query_builder_config: Option<QueryBuilderConfig>,
    #[serde(default)]
    pub change_notes: Option<String>,
}

pub type CreateViewRequest = ViewDefinitionRequest;
pub type UpdateViewRequest = ViewDefinitionRequest;

impl ViewDefinitionRequest {
    /// Request for a view authored through the query builder
    pub fn structured(
        schema: impl Into<String>,
        name: impl Into<String>,
        config: QueryBuilderConfig,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            query_builder_config: Some(config),
            ..Default::default()
        }
    }

    /// Request for a view authored as raw SQL
    pub fn raw_sql(
        schema: impl Into<String>,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            sql_definition: sql.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_change_notes(mut self, notes: impl Into<String>) -> Self {
        self.change_notes = Some(notes.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A managed view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseView {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    pub schema: String,
    pub description: Option<String>,
    /// Last successfully compiled SQL
    pub sql_definition: String,
    /// `None` when the view was authored as raw SQL
    pub query_builder_config: Option<QueryBuilderConfig>,
    /// Qualified names of everything the view reads from
    pub dependencies: Vec<String>,
    pub performance_metrics: Option<PerformanceMetrics>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_version: VersionLabel,
}

impl DatabaseView {
    /// `schema.name`
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Outcome of a successful create or update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedView {
    pub view: DatabaseView,
    pub version: ViewVersion,
    pub dependencies: Vec<ViewDependency>,
    /// Relations the catalog did not recognize
    pub warnings: Vec<DependencyWarning>,
}

/// Whether a stored definition still matches its config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub view_id: Uuid,
    pub drifted: bool,
    pub stored_sql: String,
    /// `None` for raw SQL views, which cannot drift
    pub compiled_sql: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_camel_case_json() {
        let body = serde_json::json!({
            "name": "paid_orders",
            "schema": "reporting",
            "sqlDefinition": "SELECT 1",
            "queryBuilderConfig": {
                "tables": [{"schema": "public", "name": "orders"}],
                "filters": [{"column": "status", "operator": "eq", "value": "paid", "logicalOperator": "and"}]
            },
            "changeNotes": "first cut"
        });
        let request: CreateViewRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.name, "paid_orders");
        assert_eq!(request.change_notes.as_deref(), Some("first cut"));
        let config = request.query_builder_config.unwrap();
        assert_eq!(config.tables[0].name, "orders");
        assert_eq!(config.filters.len(), 1);
    }

    #[test]
    fn test_sql_definition_defaults_to_empty() {
        let request: UpdateViewRequest =
            serde_json::from_value(serde_json::json!({"name": "v", "schema": "public"})).unwrap();
        assert!(request.sql_definition.is_empty());
        assert!(request.query_builder_config.is_none());
    }
}
