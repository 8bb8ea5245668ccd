//! Query builder compilation to parameterized SQL
//!
//! Clause order is fixed: SELECT, FROM, JOIN, WHERE, GROUP BY, HAVING,
//! ORDER BY. User-supplied lists are rendered in the order given and never
//! reordered. Compilation is pure: the same configuration always produces
//! byte-identical output for a given dialect and compiler version. The
//! compiler never emits LIMIT; bounding rows is the preview executor's job.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlparser::ast::{Expr, Query, Value, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use tracing::debug;

use pgview_common::error::{Error, Result};
use pgview_common::types::{ParamType, ParamValue};

use crate::builder::{
    Aggregation, FilterCondition, FilterOperator, FilterValue, QueryBuilderConfig, SelectedTable,
    SortDirection,
};
use crate::dialect::Dialect;

/// Version stamped on every compiled query
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// SQL text plus its ordered bound parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<ParamValue>,
    pub param_types: Vec<ParamType>,
    pub compiler_version: String,
}

impl CompiledQuery {
    /// Wrap hand-written SQL that binds no parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            param_types: Vec::new(),
            compiler_version: COMPILER_VERSION.to_string(),
        }
    }

    /// Stable hex digest over the SQL text and typed parameters
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        for (value, ty) in self.params.iter().zip(&self.param_types) {
            hasher.update([0u8]);
            hasher.update(ty.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Compile a query builder configuration for `dialect`.
///
/// # Errors
/// Returns `Error::Compilation` naming the offending field for unknown enum
/// values, undeclared or out-of-scope table references, alias collisions,
/// operator/value mismatches, and unparseable computed expressions.
pub fn compile(config: &QueryBuilderConfig, dialect: &dyn Dialect) -> Result<CompiledQuery> {
    let compiled = Compiler::new(config, dialect).run()?;
    debug!(
        dialect = dialect.name(),
        params = compiled.params.len(),
        "Compiled query builder config"
    );
    Ok(compiled)
}

struct Compiler<'a> {
    config: &'a QueryBuilderConfig,
    dialect: &'a dyn Dialect,
    /// Declared tables in declaration order
    declared: Vec<&'a SelectedTable>,
    /// Reference names introduced by FROM and preceding joins
    in_scope: Vec<&'a str>,
    /// Output aliases of selected columns
    output_aliases: Vec<&'a str>,
    params: Vec<ParamValue>,
    param_types: Vec<ParamType>,
}

impl<'a> Compiler<'a> {
    fn new(config: &'a QueryBuilderConfig, dialect: &'a dyn Dialect) -> Self {
        Self {
            config,
            dialect,
            declared: Vec::with_capacity(config.tables.len()),
            in_scope: Vec::with_capacity(config.tables.len()),
            output_aliases: Vec::new(),
            params: Vec::new(),
            param_types: Vec::new(),
        }
    }

    fn run(mut self) -> Result<CompiledQuery> {
        let config = self.config;

        self.declare_tables()?;
        let from = self.render_from()?;
        let joins = self.render_joins()?;
        self.check_all_joined()?;
        let select = self.render_select()?;

        let mut sql = format!("SELECT {select} FROM {from}");
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }

        if let Some(condition) = self.fold_conditions(&config.filters, "filters")? {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }

        if let Some(grouping) = &config.grouping {
            if grouping.columns.is_empty() {
                if !grouping.having.is_empty() {
                    return Err(Error::compilation(
                        "grouping.having",
                        "HAVING requires at least one grouping column",
                    ));
                }
            } else {
                let columns = grouping
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        self.column_ref(column, &format!("grouping.columns[{i}]"), true)
                    })
                    .collect::<Result<Vec<_>>>()?;
                sql.push_str(" GROUP BY ");
                sql.push_str(&columns.join(", "));

                if let Some(condition) = self.fold_conditions(&grouping.having, "grouping.having")? {
                    sql.push_str(" HAVING ");
                    sql.push_str(&condition);
                }
            }
        }

        if let Some(ordering) = &config.ordering {
            if !ordering.columns.is_empty() {
                let mut terms = Vec::with_capacity(ordering.columns.len());
                for (i, order) in ordering.columns.iter().enumerate() {
                    let field = format!("ordering.columns[{i}]");
                    let direction = match &order.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                        SortDirection::Unsupported(raw) => {
                            return Err(Error::compilation(
                                format!("{field}.direction"),
                                format!("unsupported sort direction \"{raw}\""),
                            ))
                        }
                    };
                    let column = self.column_ref(&order.column, &format!("{field}.column"), true)?;
                    terms.push(format!("{column} {direction}"));
                }
                sql.push_str(" ORDER BY ");
                sql.push_str(&terms.join(", "));
            }
        }

        Ok(CompiledQuery {
            sql,
            params: self.params,
            param_types: self.param_types,
            compiler_version: COMPILER_VERSION.to_string(),
        })
    }

    fn ident(&self, name: &str, field: &str) -> Result<String> {
        self.dialect
            .quote_identifier(name)
            .map_err(|e| Error::compilation(field, e.to_string()))
    }

    fn declare_tables(&mut self) -> Result<()> {
        let config = self.config;
        if config.tables.is_empty() {
            return Err(Error::compilation("tables", "at least one table is required"));
        }

        for (i, table) in config.tables.iter().enumerate() {
            let field = format!("tables[{i}]");
            self.ident(&table.schema, &format!("{field}.schema"))?;
            self.ident(&table.name, &format!("{field}.name"))?;
            if let Some(alias) = &table.alias {
                self.ident(alias, &format!("{field}.alias"))?;
            }

            let reference = table.reference_name();
            if self.declared.iter().any(|t| t.reference_name() == reference) {
                let (sub_field, what) = if table.alias.is_some() {
                    ("alias", "alias")
                } else {
                    ("name", "table reference")
                };
                return Err(Error::compilation(
                    format!("{field}.{sub_field}"),
                    format!("duplicate {what} \"{reference}\""),
                ));
            }
            self.declared.push(table);
        }
        Ok(())
    }

    /// Find a declared table by reference name
    fn resolve_declared(&self, name: &str, field: &str) -> Result<&'a SelectedTable> {
        if let Some(table) = self
            .declared
            .iter()
            .copied()
            .find(|t| t.reference_name() == name)
        {
            return Ok(table);
        }
        if let Some(aliased) = self.declared.iter().find(|t| t.name == name) {
            return Err(Error::compilation(
                field,
                format!(
                    "table \"{name}\" is aliased as \"{}\"; refer to it by its alias",
                    aliased.reference_name()
                ),
            ));
        }
        Err(Error::compilation(
            field,
            format!("undefined table reference \"{name}\""),
        ))
    }

    /// Find a declared table that FROM or a preceding join already introduced
    fn resolve_in_scope(&self, name: &str, field: &str) -> Result<&'a SelectedTable> {
        let table = self.resolve_declared(name, field)?;
        if !self.in_scope.contains(&table.reference_name()) {
            return Err(Error::compilation(
                field,
                format!("table \"{name}\" is referenced before it is joined"),
            ));
        }
        Ok(table)
    }

    fn table_sql(&self, table: &SelectedTable, field: &str) -> Result<String> {
        let mut sql = format!(
            "{}.{}",
            self.ident(&table.schema, &format!("{field}.schema"))?,
            self.ident(&table.name, &format!("{field}.name"))?
        );
        if let Some(alias) = &table.alias {
            sql.push_str(" AS ");
            sql.push_str(&self.ident(alias, &format!("{field}.alias"))?);
        }
        Ok(sql)
    }

    fn render_from(&mut self) -> Result<String> {
        let first = self.declared[0];
        let sql = self.table_sql(first, "tables[0]")?;
        self.in_scope.push(first.reference_name());
        Ok(sql)
    }

    fn render_joins(&mut self) -> Result<Vec<String>> {
        let config = self.config;
        let mut rendered = Vec::with_capacity(config.joins.len());

        for (i, join) in config.joins.iter().enumerate() {
            let field = format!("joins[{i}]");
            if !join.join_type.is_supported() {
                return Err(Error::compilation(
                    format!("{field}.type"),
                    format!("unsupported join type \"{}\"", join.join_type),
                ));
            }

            let left = self.resolve_in_scope(&join.left_table, &format!("{field}.leftTable"))?;
            let right = self.resolve_declared(&join.right_table, &format!("{field}.rightTable"))?;
            let right_ref = right.reference_name();
            if self.in_scope.contains(&right_ref) {
                return Err(Error::compilation(
                    format!("{field}.rightTable"),
                    format!(
                        "table \"{right_ref}\" is already joined; declare it again under another alias"
                    ),
                ));
            }

            let left_column = format!(
                "{}.{}",
                self.ident(left.reference_name(), &format!("{field}.leftTable"))?,
                self.ident(&join.left_column, &format!("{field}.leftColumn"))?
            );
            let right_column = format!(
                "{}.{}",
                self.ident(right_ref, &format!("{field}.rightTable"))?,
                self.ident(&join.right_column, &format!("{field}.rightColumn"))?
            );
            let table = self.table_sql(right, &format!("{field}.rightTable"))?;

            self.in_scope.push(right_ref);
            rendered.push(format!(
                "{} {table} ON {left_column} = {right_column}",
                self.dialect.join_keyword(&join.join_type)
            ));
        }

        Ok(rendered)
    }

    fn check_all_joined(&self) -> Result<()> {
        for (i, table) in self.declared.iter().enumerate() {
            if !self.in_scope.contains(&table.reference_name()) {
                return Err(Error::compilation(
                    format!("tables[{i}]"),
                    format!(
                        "table \"{}\" is declared but never joined",
                        table.reference_name()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn render_select(&mut self) -> Result<String> {
        let config = self.config;
        if config.columns.is_empty() {
            return Ok("*".to_string());
        }

        let mut rendered = Vec::with_capacity(config.columns.len());
        for (i, column) in config.columns.iter().enumerate() {
            let field = format!("columns[{i}]");
            let table = self.resolve_in_scope(&column.table, &format!("{field}.table"))?;

            let base = match &column.expression {
                Some(expression) => render_expression(expression, &format!("{field}.expression"))?,
                None => format!(
                    "{}.{}",
                    self.ident(table.reference_name(), &format!("{field}.table"))?,
                    self.ident(&column.column, &format!("{field}.column"))?
                ),
            };

            let mut sql = match &column.aggregation {
                None => base,
                Some(aggregation) => {
                    let Some(function) = aggregate_function(aggregation) else {
                        return Err(Error::compilation(
                            format!("{field}.aggregation"),
                            format!("unsupported aggregation \"{aggregation}\""),
                        ));
                    };
                    format!("{function}({base})")
                }
            };

            if let Some(alias) = &column.alias {
                if self.output_aliases.contains(&alias.as_str()) {
                    return Err(Error::compilation(
                        format!("{field}.alias"),
                        format!("duplicate column alias \"{alias}\""),
                    ));
                }
                sql.push_str(" AS ");
                sql.push_str(&self.ident(alias, &format!("{field}.alias"))?);
                self.output_aliases.push(alias.as_str());
            }

            rendered.push(sql);
        }

        Ok(rendered.join(", "))
    }

    /// Render a column reference used by filters, grouping, or ordering.
    ///
    /// `table.column` resolves against tables in scope; a bare name matching
    /// an output alias renders as that alias when `allow_output_alias` is set;
    /// any other bare name is qualified with the FROM table.
    fn column_ref(&self, column: &str, field: &str, allow_output_alias: bool) -> Result<String> {
        if let Some((table, name)) = column.split_once('.') {
            let table = self.resolve_in_scope(table, field)?;
            return Ok(format!(
                "{}.{}",
                self.ident(table.reference_name(), field)?,
                self.ident(name, field)?
            ));
        }
        if allow_output_alias && self.output_aliases.contains(&column) {
            return self.ident(column, field);
        }
        let from = self.declared[0].reference_name();
        Ok(format!(
            "{}.{}",
            self.ident(from, field)?,
            self.ident(column, field)?
        ))
    }

    fn bind(&mut self, value: &ParamValue) -> String {
        self.params.push(value.clone());
        self.param_types.push(value.param_type());
        self.dialect.placeholder(self.params.len())
    }

    /// Left-associative fold: each condition binds to everything before it
    /// through its own logical operator, with explicit grouping per step.
    fn fold_conditions(&mut self, conditions: &[FilterCondition], field: &str) -> Result<Option<String>> {
        let mut folded: Option<String> = None;

        for (i, condition) in conditions.iter().enumerate() {
            let condition_field = format!("{field}[{i}]");
            let keyword = match condition.logical_operator.as_str() {
                "and" => "AND",
                "or" => "OR",
                raw => {
                    return Err(Error::compilation(
                        format!("{condition_field}.logicalOperator"),
                        format!("unsupported logical operator \"{raw}\""),
                    ))
                }
            };
            let rendered = self.render_condition(condition, &condition_field)?;
            folded = Some(match folded {
                None => rendered,
                Some(previous) => format!("({previous}) {keyword} ({rendered})"),
            });
        }

        Ok(folded)
    }

    fn render_condition(&mut self, condition: &FilterCondition, field: &str) -> Result<String> {
        let column = self.column_ref(&condition.column, &format!("{field}.column"), false)?;
        let value_field = format!("{field}.value");

        match (&condition.operator, &condition.value) {
            (FilterOperator::Unsupported(raw), _) => Err(Error::compilation(
                format!("{field}.operator"),
                format!("unsupported operator \"{raw}\""),
            )),
            (FilterOperator::IsNull, None) => Ok(format!("{column} IS NULL")),
            (FilterOperator::IsNotNull, None) => Ok(format!("{column} IS NOT NULL")),
            (op @ (FilterOperator::IsNull | FilterOperator::IsNotNull), Some(_)) => Err(
                Error::compilation(value_field, format!("operator \"{op}\" takes no value")),
            ),
            (op @ (FilterOperator::In | FilterOperator::NotIn), Some(FilterValue::List(items)))
                if !items.is_empty() =>
            {
                let placeholders: Vec<String> = items.iter().map(|v| self.bind(v)).collect();
                let keyword = if *op == FilterOperator::In { "IN" } else { "NOT IN" };
                Ok(format!("{column} {keyword} ({})", placeholders.join(", ")))
            }
            (op @ (FilterOperator::In | FilterOperator::NotIn), _) => Err(Error::compilation(
                value_field,
                format!("operator \"{op}\" requires a non-empty list of values"),
            )),
            (
                op @ (FilterOperator::Eq
                | FilterOperator::Ne
                | FilterOperator::Gt
                | FilterOperator::Gte
                | FilterOperator::Lt
                | FilterOperator::Lte
                | FilterOperator::Like),
                Some(FilterValue::Scalar(value)),
            ) => {
                let symbol = match op {
                    FilterOperator::Eq => "=",
                    FilterOperator::Ne => "<>",
                    FilterOperator::Gt => ">",
                    FilterOperator::Gte => ">=",
                    FilterOperator::Lt => "<",
                    FilterOperator::Lte => "<=",
                    _ => "LIKE",
                };
                let placeholder = self.bind(value);
                Ok(format!("{column} {symbol} {placeholder}"))
            }
            (op, Some(FilterValue::List(_))) => Err(Error::compilation(
                value_field,
                format!("operator \"{op}\" takes a single value, not a list"),
            )),
            (op, None) => Err(Error::compilation(
                value_field,
                format!("operator \"{op}\" requires a value"),
            )),
        }
    }
}

fn aggregate_function(aggregation: &Aggregation) -> Option<&'static str> {
    match aggregation {
        Aggregation::Sum => Some("SUM"),
        Aggregation::Count => Some("COUNT"),
        Aggregation::Avg => Some("AVG"),
        Aggregation::Min => Some("MIN"),
        Aggregation::Max => Some("MAX"),
        Aggregation::Unsupported(_) => None,
    }
}

/// Rejects nested queries and parameter placeholders inside a computed
/// expression. Placeholder ordinals belong to the compiler alone.
struct ExpressionGuard;

impl Visitor for ExpressionGuard {
    type Break = &'static str;

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        ControlFlow::Break("subqueries are not allowed in computed expressions")
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Value(Value::Placeholder(_)) = expr {
            return ControlFlow::Break("parameter placeholders are not allowed in computed expressions");
        }
        ControlFlow::Continue(())
    }
}

/// Parse a computed expression and emit its normalized rendering
fn render_expression(expression: &str, field: &str) -> Result<String> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(expression)
        .map_err(|e| Error::compilation(field, format!("invalid expression: {e}")))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| Error::compilation(field, format!("invalid expression: {e}")))?;

    if parser.peek_token().token != Token::EOF {
        return Err(Error::compilation(
            field,
            "expression must be a single SQL expression",
        ));
    }
    if let ControlFlow::Break(reason) = expr.visit(&mut ExpressionGuard) {
        return Err(Error::compilation(field, reason));
    }

    Ok(expr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{
        GroupingConfig, JoinDefinition, JoinType, OrderColumn, OrderingConfig, SelectedColumn,
    };
    use crate::dialect::PostgresDialect;

    fn text(v: &str) -> ParamValue {
        ParamValue::Text(v.to_string())
    }

    fn orders() -> QueryBuilderConfig {
        QueryBuilderConfig {
            tables: vec![SelectedTable::new("public", "orders")],
            columns: vec![SelectedColumn::new("orders", "id")],
            ..Default::default()
        }
    }

    fn join(join_type: JoinType, left: &str, lcol: &str, right: &str, rcol: &str) -> JoinDefinition {
        JoinDefinition {
            join_type,
            left_table: left.to_string(),
            left_column: lcol.to_string(),
            right_table: right.to_string(),
            right_column: rcol.to_string(),
        }
    }

    fn field_of(err: &Error) -> String {
        err.field().unwrap_or_default().to_string()
    }

    #[test]
    fn test_single_filter_example() {
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar("status", FilterOperator::Eq, text("paid"))];

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "orders"."id" FROM "public"."orders" WHERE "orders"."status" = $1"#
        );
        assert_eq!(compiled.params, vec![text("paid")]);
        assert_eq!(compiled.param_types, vec![ParamType::Text]);
    }

    #[test]
    fn test_left_associative_fold() {
        let mut config = orders();
        config.filters = vec![
            FilterCondition::scalar("a", FilterOperator::Eq, ParamValue::Int(1)),
            FilterCondition::scalar("b", FilterOperator::Eq, ParamValue::Int(2)).or(),
            FilterCondition::scalar("c", FilterOperator::Eq, ParamValue::Int(3)),
        ];

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert!(compiled.sql.ends_with(
            r#"WHERE (("orders"."a" = $1) OR ("orders"."b" = $2)) AND ("orders"."c" = $3)"#
        ));
        assert_eq!(
            compiled.params,
            vec![ParamValue::Int(1), ParamValue::Int(2), ParamValue::Int(3)]
        );
    }

    #[test]
    fn test_first_logical_operator_is_ignored() {
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar("a", FilterOperator::Gt, ParamValue::Int(1)).or()];
        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert!(compiled.sql.ends_with(r#"WHERE "orders"."a" > $1"#));
    }

    #[test]
    fn test_join_aliases_and_clause_order() {
        let config = QueryBuilderConfig {
            tables: vec![
                SelectedTable::new("public", "orders").with_alias("o"),
                SelectedTable::new("sales", "customers").with_alias("c"),
            ],
            joins: vec![join(JoinType::Left, "o", "customer_id", "c", "id")],
            columns: vec![
                SelectedColumn::new("c", "region"),
                SelectedColumn::new("o", "amount")
                    .with_aggregation(Aggregation::Sum)
                    .with_alias("total"),
            ],
            filters: vec![FilterCondition::scalar("o.status", FilterOperator::Ne, text("void"))],
            grouping: Some(GroupingConfig {
                columns: vec!["c.region".to_string()],
                having: vec![FilterCondition::scalar(
                    "o.amount",
                    FilterOperator::Gte,
                    ParamValue::Int(100),
                )],
            }),
            ordering: Some(OrderingConfig {
                columns: vec![OrderColumn {
                    column: "total".to_string(),
                    direction: SortDirection::Desc,
                }],
            }),
        };

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "c"."region", SUM("o"."amount") AS "total" "#,
                r#"FROM "public"."orders" AS "o" "#,
                r#"LEFT JOIN "sales"."customers" AS "c" ON "o"."customer_id" = "c"."id" "#,
                r#"WHERE "o"."status" <> $1 "#,
                r#"GROUP BY "c"."region" HAVING "o"."amount" >= $2 "#,
                r#"ORDER BY "total" DESC"#
            )
        );
        assert_eq!(compiled.params, vec![text("void"), ParamValue::Int(100)]);
    }

    #[test]
    fn test_in_and_null_operators() {
        let mut config = orders();
        config.filters = vec![
            FilterCondition::new(
                "status",
                FilterOperator::NotIn,
                Some(FilterValue::List(vec![text("void"), text("draft")])),
            ),
            FilterCondition::new("shipped_at", FilterOperator::IsNotNull, None),
        ];

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert!(compiled.sql.ends_with(
            r#"WHERE ("orders"."status" NOT IN ($1, $2)) AND ("orders"."shipped_at" IS NOT NULL)"#
        ));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_values_never_inlined() {
        let hostile = "x'; DROP TABLE orders; --";
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar("note", FilterOperator::Like, text(hostile))];

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert!(!compiled.sql.contains(hostile));
        assert!(!compiled.sql.contains("DROP"));
        assert_eq!(compiled.params, vec![text(hostile)]);
    }

    #[test]
    fn test_undeclared_join_table_fails() {
        let mut config = orders();
        config.joins = vec![join(JoinType::Inner, "orders", "id", "shipments", "order_id")];

        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert!(matches!(err, Error::Compilation { .. }));
        assert_eq!(field_of(&err), "joins[0].rightTable");
        assert!(err.to_string().contains("\"shipments\""));
    }

    #[test]
    fn test_join_left_side_must_be_in_scope() {
        let config = QueryBuilderConfig {
            tables: vec![
                SelectedTable::new("public", "orders"),
                SelectedTable::new("public", "shipments"),
                SelectedTable::new("public", "carriers"),
            ],
            joins: vec![
                join(JoinType::Inner, "shipments", "carrier_id", "carriers", "id"),
                join(JoinType::Inner, "orders", "id", "shipments", "order_id"),
            ],
            ..Default::default()
        };

        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "joins[0].leftTable");
        assert!(err.to_string().contains("before it is joined"));
    }

    #[test]
    fn test_declared_table_must_be_joined() {
        let mut config = orders();
        config.tables.push(SelectedTable::new("public", "customers"));

        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "tables[1]");
    }

    #[test]
    fn test_duplicate_alias() {
        let config = QueryBuilderConfig {
            tables: vec![
                SelectedTable::new("public", "orders").with_alias("t"),
                SelectedTable::new("public", "customers").with_alias("t"),
            ],
            ..Default::default()
        };
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "tables[1].alias");
    }

    #[test]
    fn test_aliased_table_must_use_alias() {
        let config = QueryBuilderConfig {
            tables: vec![SelectedTable::new("public", "orders").with_alias("o")],
            columns: vec![SelectedColumn::new("orders", "id")],
            ..Default::default()
        };
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "columns[0].table");
        assert!(err.to_string().contains("aliased as \"o\""));
    }

    #[test]
    fn test_unknown_enum_values_name_field() {
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar(
            "a",
            FilterOperator::from("between"),
            ParamValue::Int(1),
        )];
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "filters[0].operator");
        assert!(err.to_string().contains("between"));

        let mut config = orders();
        config.columns[0].aggregation = Some(Aggregation::from("median"));
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "columns[0].aggregation");

        let mut config = orders();
        config.ordering = Some(OrderingConfig {
            columns: vec![OrderColumn {
                column: "id".to_string(),
                direction: SortDirection::from("sideways"),
            }],
        });
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "ordering.columns[0].direction");

        let mut config = orders();
        config.tables.push(SelectedTable::new("public", "items"));
        config.joins = vec![join(JoinType::from("cross"), "orders", "id", "items", "order_id")];
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "joins[0].type");
    }

    #[test]
    fn test_operator_value_shape_mismatch() {
        let mut config = orders();
        config.filters = vec![FilterCondition::new(
            "a",
            FilterOperator::IsNull,
            Some(FilterValue::Scalar(ParamValue::Int(1))),
        )];
        assert_eq!(
            field_of(&compile(&config, &PostgresDialect).unwrap_err()),
            "filters[0].value"
        );

        config.filters = vec![FilterCondition::new("a", FilterOperator::In, Some(FilterValue::List(vec![])))];
        assert!(compile(&config, &PostgresDialect).is_err());

        config.filters = vec![FilterCondition::new("a", FilterOperator::Eq, None)];
        assert!(compile(&config, &PostgresDialect).is_err());
    }

    #[test]
    fn test_empty_tables() {
        let err = compile(&QueryBuilderConfig::default(), &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "tables");
    }

    #[test]
    fn test_expression_overrides_column() {
        let mut config = orders();
        config.columns = vec![SelectedColumn::new("orders", "amount")
            .with_expression("orders.amount * (1 + orders.tax_rate)")
            .with_aggregation(Aggregation::Sum)
            .with_alias("gross")];

        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT SUM(orders.amount * (1 + orders.tax_rate)) AS "gross" FROM "public"."orders""#
        );
    }

    #[test]
    fn test_expression_rejects_injection_and_subqueries() {
        let mut config = orders();
        config.columns[0].expression = Some("1; DELETE FROM orders".to_string());
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "columns[0].expression");

        config.columns[0].expression = Some("(SELECT max(id) FROM users)".to_string());
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert!(err.to_string().contains("subqueries"));
    }

    #[test]
    fn test_expression_rejects_placeholders() {
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar("status", FilterOperator::Eq, text("paid"))];

        for expression in ["$1 || $7", "coalesce(orders.note, $2)"] {
            config.columns[0].expression = Some(expression.to_string());
            let err = compile(&config, &PostgresDialect).unwrap_err();
            assert_eq!(err.error_code(), "compilation_error");
            assert_eq!(field_of(&err), "columns[0].expression");
            assert!(err.to_string().contains("placeholders"));
        }

        config.columns[0].expression = Some("'$1' || orders.note".to_string());
        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(compiled.params.len(), 1);
    }

    #[test]
    fn test_no_columns_selects_star_and_never_limits() {
        let config = QueryBuilderConfig {
            tables: vec![SelectedTable::new("public", "orders")],
            ..Default::default()
        };
        let compiled = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(compiled.sql, r#"SELECT * FROM "public"."orders""#);
        assert!(!compiled.sql.contains("LIMIT"));
    }

    #[test]
    fn test_having_without_grouping_columns_fails() {
        let mut config = orders();
        config.grouping = Some(GroupingConfig {
            columns: vec![],
            having: vec![FilterCondition::scalar("a", FilterOperator::Eq, ParamValue::Int(1))],
        });
        let err = compile(&config, &PostgresDialect).unwrap_err();
        assert_eq!(field_of(&err), "grouping.having");
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let mut config = orders();
        config.filters = vec![
            FilterCondition::scalar("a", FilterOperator::Eq, ParamValue::Float(1.5)),
            FilterCondition::scalar("b", FilterOperator::Lt, ParamValue::Bool(true)).or(),
        ];
        let first = compile(&config, &PostgresDialect).unwrap();
        let second = compile(&config.clone(), &PostgresDialect).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_params() {
        let mut config = orders();
        config.filters = vec![FilterCondition::scalar("a", FilterOperator::Eq, ParamValue::Int(1))];
        let one = compile(&config, &PostgresDialect).unwrap();
        config.filters[0].value = Some(FilterValue::Scalar(ParamValue::Int(2)));
        let two = compile(&config, &PostgresDialect).unwrap();
        assert_eq!(one.sql, two.sql);
        assert_ne!(one.fingerprint(), two.fingerprint());
    }
}
