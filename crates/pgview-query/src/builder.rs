//! Structured query definition edited by the query builder UI

use std::fmt;

use serde::{Deserialize, Serialize};

use pgview_common::types::ParamValue;

/// Defines a string-backed enum that keeps unrecognized values around so the
/// compiler can reject them with a field path instead of failing in serde.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// A value outside the supported set
            Unsupported(String),
        }

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Unsupported(raw) => raw,
                }
            }

            #[must_use]
            pub fn is_supported(&self) -> bool {
                !matches!(self, Self::Unsupported(_))
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                match raw.to_ascii_lowercase().as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::Unsupported(raw),
                }
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::from(raw.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Join kinds
    pub enum JoinType {
        Inner => "inner",
        Left => "left",
        Right => "right",
        Full => "full",
    }
}

string_enum! {
    /// Aggregate functions applicable to a selected column
    pub enum Aggregation {
        Sum => "sum",
        Count => "count",
        Avg => "avg",
        Min => "min",
        Max => "max",
    }
}

string_enum! {
    /// Filter comparison operators
    pub enum FilterOperator {
        Eq => "eq",
        Ne => "ne",
        Gt => "gt",
        Gte => "gte",
        Lt => "lt",
        Lte => "lte",
        Like => "like",
        In => "in",
        NotIn => "not_in",
        IsNull => "is_null",
        IsNotNull => "is_not_null",
    }
}

string_enum! {
    /// Connective binding a condition to the expression accumulated before it
    pub enum LogicalOperator {
        And => "and",
        Or => "or",
    }
}

string_enum! {
    /// Sort direction
    pub enum SortDirection {
        Asc => "asc",
        Desc => "desc",
    }
}

impl Default for LogicalOperator {
    fn default() -> Self {
        Self::And
    }
}

impl Default for SortDirection {
    fn default() -> Self {
        Self::Asc
    }
}

/// Value compared by a filter; its shape must fit the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    List(Vec<ParamValue>),
    Scalar(ParamValue),
}

/// Structured query definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBuilderConfig {
    pub tables: Vec<SelectedTable>,
    #[serde(default)]
    pub joins: Vec<JoinDefinition>,
    #[serde(default)]
    pub columns: Vec<SelectedColumn>,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default)]
    pub grouping: Option<GroupingConfig>,
    #[serde(default)]
    pub ordering: Option<OrderingConfig>,
}

/// Table participating in the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTable {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl SelectedTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            alias: None,
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name other clauses use to refer to this table
    #[must_use]
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Equi-join between a table in scope and a declared table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDefinition {
    #[serde(rename = "type")]
    pub join_type: JoinType,
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

/// Output column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedColumn {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    /// Computed expression rendered in place of `table.column`
    #[serde(default)]
    pub expression: Option<String>,
}

impl SelectedColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            alias: None,
            aggregation: None,
            expression: None,
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    #[must_use]
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}

/// One step of a WHERE or HAVING fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<FilterValue>,
    /// Ignored on the first condition of a fold
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: Option<FilterValue>) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            logical_operator: LogicalOperator::And,
        }
    }

    /// Condition comparing `column` with a single value
    pub fn scalar(column: impl Into<String>, operator: FilterOperator, value: ParamValue) -> Self {
        Self::new(column, operator, Some(FilterValue::Scalar(value)))
    }

    #[must_use]
    pub fn or(mut self) -> Self {
        self.logical_operator = LogicalOperator::Or;
        self
    }
}

/// GROUP BY columns and HAVING conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    pub columns: Vec<String>,
    #[serde(default)]
    pub having: Vec<FilterCondition>,
}

/// ORDER BY columns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingConfig {
    pub columns: Vec<OrderColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderColumn {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}
