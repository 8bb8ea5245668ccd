//! Common types for pgview

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Parameter Types
// ============================================================================

/// A scalar bound as a positional query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Type tag recorded alongside the parameter
    #[must_use]
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::Bool(_) => ParamType::Bool,
            Self::Int(_) => ParamType::Int8,
            Self::Float(_) => ParamType::Float8,
            Self::Text(_) => ParamType::Text,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Type tag of a bound parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Text,
    Int8,
    Float8,
    Bool,
}

impl ParamType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int8 => "int8",
            Self::Float8 => "float8",
            Self::Bool => "bool",
        }
    }
}

// ============================================================================
// Version Types
// ============================================================================

/// `MAJOR.MINOR` version label of a view definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionLabel {
    pub major: u32,
    pub minor: u32,
}

impl VersionLabel {
    /// Label of the first version of any view.
    pub const INITIAL: Self = Self { major: 1, minor: 0 };

    /// Label following `self`: the minor component is incremented.
    #[must_use]
    pub fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid version label: {s}"))?;
        Ok(Self {
            major: major
                .parse()
                .map_err(|_| format!("invalid major version: {s}"))?,
            minor: minor
                .parse()
                .map_err(|_| format!("invalid minor version: {s}"))?,
        })
    }
}

impl TryFrom<String> for VersionLabel {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionLabel> for String {
    fn from(label: VersionLabel) -> Self {
        label.to_string()
    }
}

/// Immutable history record of a view definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewVersion {
    pub id: Uuid,
    pub view_id: Uuid,
    pub version: VersionLabel,
    pub sql_definition: String,
    pub change_notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Dependency Types
// ============================================================================

/// Kind of relation a view reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Table,
    View,
    Function,
}

/// Target of a dependency; exactly one side is ever set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependsOn {
    DependsOnTable(String),
    DependsOnView(String),
}

/// A relation a view depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDependency {
    pub view_id: Uuid,
    #[serde(flatten)]
    pub depends_on: DependsOn,
    pub dependency_type: DependencyType,
}

impl ViewDependency {
    /// Qualified name of the dependency target
    #[must_use]
    pub fn target(&self) -> &str {
        match &self.depends_on {
            DependsOn::DependsOnTable(name) | DependsOn::DependsOnView(name) => name,
        }
    }
}

/// Non-fatal notice that the catalog did not recognize an identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyWarning {
    pub identifier: String,
    pub message: String,
}

impl DependencyWarning {
    pub fn unresolved(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            message: format!("relation {identifier} is not in the schema catalog"),
            identifier,
        }
    }
}

// ============================================================================
// Performance Types
// ============================================================================

/// Plan-derived runtime metrics attached to a view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Last observed preview execution time, if any preview ran
    pub execution_time: Option<f64>,
    /// Wall-clock duration of the plan request in milliseconds
    pub planning_time: f64,
    /// Planner's estimated row count
    pub row_count: u64,
    /// Planner's estimated total cost
    pub cost: f64,
    pub last_analyzed: DateTime<Utc>,
}

// ============================================================================
// Preview Types
// ============================================================================

/// Preview of ad-hoc SQL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPreviewRequest {
    pub sql_definition: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Column descriptor of a preview result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Result of a bounded preview run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPreviewResult {
    pub columns: Vec<PreviewColumn>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Milliseconds spent executing
    pub execution_time: f64,
    pub row_count: usize,
}

// ============================================================================
// Response Types
// ============================================================================

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_label_ordering() {
        let first = VersionLabel::INITIAL;
        let second = first.next_minor();
        assert_eq!(first.to_string(), "1.0");
        assert_eq!(second.to_string(), "1.1");
        assert!(second > first);
        assert!("1.10".parse::<VersionLabel>().unwrap() > "1.9".parse().unwrap());
    }

    #[test]
    fn test_version_label_rejects_garbage() {
        assert!("1".parse::<VersionLabel>().is_err());
        assert!("a.b".parse::<VersionLabel>().is_err());
    }

    #[test]
    fn test_param_value_untagged() {
        let values: Vec<ParamValue> = serde_json::from_str(r#"[true, 3, 2.5, "paid"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                ParamValue::Bool(true),
                ParamValue::Int(3),
                ParamValue::Float(2.5),
                ParamValue::Text("paid".to_string()),
            ]
        );
        assert_eq!(values[1].param_type(), ParamType::Int8);
    }

    #[test]
    fn test_dependency_serializes_one_side() {
        let dep = ViewDependency {
            view_id: Uuid::nil(),
            depends_on: DependsOn::DependsOnView("public.active_orders".to_string()),
            dependency_type: DependencyType::View,
        };
        let json = serde_json::to_value(&dep).unwrap();
        assert_eq!(json["dependsOnView"], "public.active_orders");
        assert!(json.get("dependsOnTable").is_none());
        assert_eq!(json["dependencyType"], "view");
    }

    #[test]
    fn test_api_error() {
        let error = ApiError::new("validation_error", "Missing name").with_hint("Include 'name'");
        assert_eq!(error.code, "validation_error");
        assert!(error.hint.is_some());
    }
}
