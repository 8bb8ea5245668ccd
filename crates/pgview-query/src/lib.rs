//! pgview Query Compilation Engine
//!
//! Turns a structured, UI-editable query definition into parameterized
//! PostgreSQL and tracks what the resulting view reads from:
//! - Query builder configuration types
//! - Deterministic SQL compilation with positional parameters
//! - Dependency analysis against a schema catalog

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod catalog;
pub mod compiler;
pub mod dependencies;
pub mod dialect;

pub use builder::{
    Aggregation, FilterCondition, FilterOperator, FilterValue, GroupingConfig, JoinDefinition,
    JoinType, LogicalOperator, OrderColumn, OrderingConfig, QueryBuilderConfig, SelectedColumn,
    SelectedTable, SortDirection,
};
pub use catalog::{ColumnInfo, InMemoryCatalog, QualifiedName, RelationInfo, RelationKind, SchemaCatalog};
pub use compiler::{compile, CompiledQuery, COMPILER_VERSION};
pub use dependencies::{AnalysisInput, DependencyAnalyzer, DependencyReport, ResolvedDependency};
pub use dialect::{Dialect, PostgresDialect};
