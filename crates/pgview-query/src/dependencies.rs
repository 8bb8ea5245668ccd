//! Dependency analysis
//!
//! Structured configurations are read directly; that path is authoritative.
//! Raw SQL is walked with the sqlparser visitor, and falls back to a
//! FROM/JOIN keyword scan when the text does not parse.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{Expr, Ident, ObjectName, Query, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;
use uuid::Uuid;

use pgview_common::types::{DependencyType, DependencyWarning, DependsOn, ViewDependency};

use crate::builder::QueryBuilderConfig;
use crate::catalog::{QualifiedName, SchemaCatalog};

static FROM_JOIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:from|join)\s+("(?:[^"]|"")+"|[a-z_][a-z0-9_$]*)(?:\s*\.\s*("(?:[^"]|"")+"|[a-z_][a-z0-9_$]*))?"#,
    )
    .expect("FROM/JOIN pattern is valid")
});

/// A relation the analyzed query reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub name: QualifiedName,
    pub dependency_type: DependencyType,
    /// Set when the catalog did not recognize the relation
    pub unresolved: bool,
}

/// Outcome of one analysis
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Ordered by qualified name, without duplicates
    pub dependencies: Vec<ResolvedDependency>,
    /// Selected columns the catalog says do not exist
    pub column_warnings: Vec<DependencyWarning>,
}

impl DependencyReport {
    /// Non-fatal notices for the caller
    pub fn warnings(&self) -> Vec<DependencyWarning> {
        self.dependencies
            .iter()
            .filter(|d| d.unresolved)
            .map(|d| DependencyWarning::unresolved(d.name.to_string()))
            .chain(self.column_warnings.iter().cloned())
            .collect()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.dependencies.iter().all(|d| !d.unresolved)
    }

    /// Qualified names in report order
    pub fn names(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.name.to_string()).collect()
    }

    /// Persisted dependency rows for `view_id`
    pub fn to_view_dependencies(&self, view_id: Uuid) -> Vec<ViewDependency> {
        self.dependencies
            .iter()
            .map(|d| {
                let target = d.name.to_string();
                let depends_on = match d.dependency_type {
                    DependencyType::View => DependsOn::DependsOnView(target),
                    DependencyType::Table | DependencyType::Function => {
                        DependsOn::DependsOnTable(target)
                    }
                };
                ViewDependency {
                    view_id,
                    depends_on,
                    dependency_type: d.dependency_type,
                }
            })
            .collect()
    }
}

/// What to analyze
#[derive(Debug, Clone, Copy)]
pub enum AnalysisInput<'a> {
    Structured(&'a QueryBuilderConfig),
    RawSql(&'a str),
}

/// Classifies the relations a query touches against a schema catalog
pub struct DependencyAnalyzer<'c> {
    catalog: &'c dyn SchemaCatalog,
    default_schema: String,
}

impl<'c> DependencyAnalyzer<'c> {
    pub fn new(catalog: &'c dyn SchemaCatalog, default_schema: impl Into<String>) -> Self {
        Self {
            catalog,
            default_schema: default_schema.into(),
        }
    }

    pub fn analyze(&self, input: AnalysisInput<'_>) -> DependencyReport {
        match input {
            AnalysisInput::Structured(config) => self.analyze_config(config),
            AnalysisInput::RawSql(sql) => self.analyze_sql(sql),
        }
    }

    /// Read tables and computed-expression functions straight from the config
    pub fn analyze_config(&self, config: &QueryBuilderConfig) -> DependencyReport {
        let mut found = BTreeMap::new();
        for table in &config.tables {
            self.add_relation(&mut found, QualifiedName::new(&table.schema, &table.name));
        }

        let mut column_warnings = BTreeSet::new();
        for column in &config.columns {
            if let Some(expression) = &column.expression {
                let mut collector = RelationCollector::default();
                if let Ok(expr) = Parser::new(&PostgreSqlDialect {})
                    .try_with_sql(expression)
                    .and_then(|mut p| p.parse_expr())
                {
                    let _ = expr.visit(&mut collector);
                }
                for name in &collector.functions {
                    self.add_function(&mut found, self.qualify(name));
                }
                continue;
            }

            let Some(table) = config
                .tables
                .iter()
                .find(|t| t.reference_name() == column.table)
            else {
                continue;
            };
            if self.catalog.has_column(&table.schema, &table.name, &column.column) == Some(false) {
                let identifier = format!("{}.{}.{}", table.schema, table.name, column.column);
                column_warnings.insert(DependencyWarning {
                    message: format!("column {identifier} is not in the schema catalog"),
                    identifier,
                });
            }
        }

        DependencyReport {
            dependencies: found.into_values().collect(),
            column_warnings: column_warnings.into_iter().collect(),
        }
    }

    /// Best-effort extraction from hand-written SQL
    pub fn analyze_sql(&self, sql: &str) -> DependencyReport {
        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => {
                debug!(error = %e, "SQL did not parse, scanning FROM/JOIN identifiers");
                return self.scan_sql(sql);
            }
        };

        let mut collector = RelationCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut collector);
        }

        let mut found = BTreeMap::new();
        for relation in &collector.relations {
            if relation.0.len() == 1 && collector.ctes.contains(&normalize_ident(&relation.0[0])) {
                continue;
            }
            self.add_relation(&mut found, self.qualify(relation));
        }
        for name in collector.table_functions.iter().chain(&collector.functions) {
            self.add_function(&mut found, self.qualify(name));
        }

        DependencyReport {
            dependencies: found.into_values().collect(),
            column_warnings: Vec::new(),
        }
    }

    fn scan_sql(&self, sql: &str) -> DependencyReport {
        let mut found = BTreeMap::new();
        for caps in FROM_JOIN.captures_iter(sql) {
            let first = caps.get(1).map(|m| normalize_raw(m.as_str()));
            let second = caps.get(2).map(|m| normalize_raw(m.as_str()));
            let name = match (first, second) {
                (Some(schema), Some(name)) => QualifiedName::new(schema, name),
                (Some(name), None) => QualifiedName::new(&self.default_schema, name),
                _ => continue,
            };
            self.add_relation(&mut found, name);
        }
        DependencyReport {
            dependencies: found.into_values().collect(),
            column_warnings: Vec::new(),
        }
    }

    fn qualify(&self, name: &ObjectName) -> QualifiedName {
        let parts: Vec<String> = name.0.iter().map(normalize_ident).collect();
        match parts.as_slice() {
            [.., schema, relation] => QualifiedName::new(schema, relation),
            [relation] => QualifiedName::new(&self.default_schema, relation),
            [] => QualifiedName::new(&self.default_schema, ""),
        }
    }

    /// Unknown relations are kept as unresolved tables
    fn add_relation(&self, found: &mut BTreeMap<QualifiedName, ResolvedDependency>, name: QualifiedName) {
        if found.contains_key(&name) {
            return;
        }
        let kind = self.catalog.relation_kind(&name.schema, &name.name);
        found.insert(
            name.clone(),
            ResolvedDependency {
                name,
                dependency_type: kind.map_or(DependencyType::Table, DependencyType::from),
                unresolved: kind.is_none(),
            },
        );
    }

    /// Function calls count only when the catalog knows them as functions
    fn add_function(&self, found: &mut BTreeMap<QualifiedName, ResolvedDependency>, name: QualifiedName) {
        if found.contains_key(&name) {
            return;
        }
        if self.catalog.relation_kind(&name.schema, &name.name)
            == Some(crate::catalog::RelationKind::Function)
        {
            found.insert(
                name.clone(),
                ResolvedDependency {
                    name,
                    dependency_type: DependencyType::Function,
                    unresolved: false,
                },
            );
        }
    }
}

/// Unquoted identifiers fold to lower case, quoted ones are kept verbatim
fn normalize_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn normalize_raw(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => raw.to_lowercase(),
    }
}

#[derive(Debug, Default)]
struct RelationCollector {
    ctes: BTreeSet<String>,
    relations: Vec<ObjectName>,
    table_functions: Vec<ObjectName>,
    functions: Vec<ObjectName>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(normalize_ident(&cte.alias.name));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, args, .. } = table_factor {
            if args.is_some() {
                self.table_functions.push(name.clone());
            } else {
                self.relations.push(name.clone());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(function) = expr {
            self.functions.push(function.name.clone());
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{JoinDefinition, JoinType, SelectedColumn, SelectedTable};
    use crate::catalog::{ColumnInfo, InMemoryCatalog, RelationInfo};

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::with_relations([
            RelationInfo::table("public", "orders")
                .with_columns(vec![ColumnInfo::new("id", "int8"), ColumnInfo::new("status", "text")]),
            RelationInfo::table("sales", "customers"),
            RelationInfo::view("reporting", "daily_sales"),
            RelationInfo::function("public", "calc_tax"),
            RelationInfo::table("Sales", "Big Orders"),
        ])
    }

    fn summary(report: &DependencyReport) -> Vec<(String, DependencyType, bool)> {
        report
            .dependencies
            .iter()
            .map(|d| (d.name.to_string(), d.dependency_type, d.unresolved))
            .collect()
    }

    #[test]
    fn test_structured_config_is_classified() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let config = QueryBuilderConfig {
            tables: vec![
                SelectedTable::new("public", "orders").with_alias("o"),
                SelectedTable::new("reporting", "daily_sales").with_alias("d"),
                SelectedTable::new("public", "shipments"),
            ],
            joins: vec![
                JoinDefinition {
                    join_type: JoinType::Inner,
                    left_table: "o".to_string(),
                    left_column: "id".to_string(),
                    right_table: "d".to_string(),
                    right_column: "order_id".to_string(),
                },
            ],
            columns: vec![
                SelectedColumn::new("o", "status"),
                SelectedColumn::new("o", "total"),
                SelectedColumn::new("o", "amount").with_expression("public.calc_tax(o.amount)"),
            ],
            ..Default::default()
        };

        let report = analyzer.analyze(AnalysisInput::Structured(&config));
        assert_eq!(
            summary(&report),
            vec![
                ("public.calc_tax".to_string(), DependencyType::Function, false),
                ("public.orders".to_string(), DependencyType::Table, false),
                ("public.shipments".to_string(), DependencyType::Table, true),
                ("reporting.daily_sales".to_string(), DependencyType::View, false),
            ]
        );
        assert!(!report.is_fully_resolved());

        let warnings = report.warnings();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].identifier, "public.shipments");
        assert_eq!(warnings[1].identifier, "public.orders.total");
    }

    #[test]
    fn test_raw_sql_skips_ctes_and_qualifies() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let sql = "WITH recent AS (SELECT * FROM Orders WHERE created_at > now()) \
                   SELECT r.id, count(*) FROM recent r \
                   JOIN sales.customers c ON c.id = r.customer_id \
                   LEFT JOIN reporting.daily_sales d ON d.sale_date = r.created_at \
                   GROUP BY r.id";

        let report = analyzer.analyze(AnalysisInput::RawSql(sql));
        assert_eq!(
            report.names(),
            vec!["public.orders", "reporting.daily_sales", "sales.customers"]
        );
        assert!(report.is_fully_resolved());
    }

    #[test]
    fn test_raw_sql_keeps_quoted_case() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let report = analyzer.analyze_sql(r#"SELECT * FROM "Sales"."Big Orders""#);
        assert_eq!(report.names(), vec!["Sales.Big Orders"]);
        assert!(report.is_fully_resolved());
    }

    #[test]
    fn test_known_functions_only() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let report = analyzer.analyze_sql("SELECT calc_tax(amount), sum(amount) FROM orders");
        assert_eq!(
            summary(&report),
            vec![
                ("public.calc_tax".to_string(), DependencyType::Function, false),
                ("public.orders".to_string(), DependencyType::Table, false),
            ]
        );
    }

    #[test]
    fn test_unparseable_sql_falls_back_to_scan() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let report = analyzer.analyze_sql("SELEKT * FROM orders JOIN Reporting.daily_sales ON ???");
        assert_eq!(report.names(), vec!["public.orders", "reporting.daily_sales"]);
    }

    #[test]
    fn test_fallback_pattern_matches_quoted_names() {
        let caps = FROM_JOIN
            .captures(r#"select * from "Sales"."Q1 ""Final""" where"#)
            .unwrap();
        assert_eq!(caps.get(1).unwrap().as_str(), r#""Sales""#);
        assert_eq!(caps.get(2).unwrap().as_str(), r#""Q1 ""Final""""#);
    }

    #[test]
    fn test_duplicates_collapse() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let report = analyzer.analyze_sql(
            "SELECT * FROM orders a JOIN public.orders b ON a.id = b.parent_id JOIN missing m ON m.id = a.id",
        );
        assert_eq!(report.names(), vec!["public.missing", "public.orders"]);
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn test_view_dependencies_set_one_side() {
        let catalog = catalog();
        let analyzer = DependencyAnalyzer::new(&catalog, "public");
        let report = analyzer.analyze_sql("SELECT * FROM reporting.daily_sales JOIN orders ON true");
        let view_id = Uuid::new_v4();
        let rows = report.to_view_dependencies(view_id);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].depends_on, DependsOn::DependsOnTable("public.orders".to_string()));
        assert_eq!(
            rows[1].depends_on,
            DependsOn::DependsOnView("reporting.daily_sales".to_string())
        );
        assert!(rows.iter().all(|r| r.view_id == view_id));
    }
}
