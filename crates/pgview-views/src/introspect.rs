//! Catalog introspection from a live PostgreSQL database

use std::collections::BTreeMap;

use tokio_postgres::Row;
use tracing::info;

use pgview_common::error::{Error, Result};
use pgview_query::{ColumnInfo, InMemoryCatalog, QualifiedName, RelationInfo, RelationKind};

use crate::postgres::PgBackend;

const RELATIONS_SQL: &str = "
    SELECT table_schema::text, table_name::text, table_type::text
    FROM information_schema.tables
    WHERE table_schema::text = ANY($1::text[])
    UNION ALL
    SELECT schemaname::text, matviewname::text, 'MATERIALIZED VIEW'
    FROM pg_catalog.pg_matviews
    WHERE schemaname::text = ANY($1::text[])";

const COLUMNS_SQL: &str = "
    SELECT table_schema::text, table_name::text, column_name::text, data_type::text,
        is_nullable::text
    FROM information_schema.columns
    WHERE table_schema::text = ANY($1::text[])
    ORDER BY table_schema, table_name, ordinal_position";

const FUNCTIONS_SQL: &str = "
    SELECT DISTINCT n.nspname::text, p.proname::text
    FROM pg_catalog.pg_proc p
    JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname::text = ANY($1::text[])";

/// Schemas never exposed through the catalog
const SYSTEM_SCHEMAS: [&str; 2] = ["pg_catalog", "information_schema"];

fn relation_kind(table_type: &str) -> Option<RelationKind> {
    match table_type {
        "BASE TABLE" | "FOREIGN" | "FOREIGN TABLE" => Some(RelationKind::Table),
        "VIEW" | "MATERIALIZED VIEW" => Some(RelationKind::View),
        _ => None,
    }
}

/// Raw catalog rows before assembly
#[derive(Debug, Default)]
struct CatalogRows {
    relations: Vec<(String, String, String)>,
    columns: Vec<(String, String, ColumnInfo)>,
    functions: Vec<(String, String)>,
}

fn assemble(rows: CatalogRows) -> Vec<RelationInfo> {
    let mut relations: BTreeMap<QualifiedName, RelationInfo> = BTreeMap::new();

    for (schema, name, table_type) in rows.relations {
        if let Some(kind) = relation_kind(&table_type) {
            let info = match kind {
                RelationKind::Table => RelationInfo::table(&schema, &name),
                RelationKind::View | RelationKind::Function => RelationInfo::view(&schema, &name),
            };
            relations.insert(info.qualified_name(), info);
        }
    }

    for (schema, table, column) in rows.columns {
        if let Some(relation) = relations.get_mut(&QualifiedName::new(schema, table)) {
            relation.columns.push(column);
        }
    }

    // A relation wins over a function of the same name
    for (schema, name) in rows.functions {
        relations
            .entry(QualifiedName::new(&schema, &name))
            .or_insert_with(|| RelationInfo::function(schema, name));
    }

    relations.into_values().collect()
}

fn text(row: &Row, idx: usize) -> Result<String> {
    row.try_get::<_, String>(idx)
        .map_err(|e| Error::Execution(format!("unexpected catalog row: {e}")))
}

/// Read tables, views, materialized views, columns and functions of
/// `schemas` from the database.
///
/// # Errors
/// `Error::Pool` when no connection is available, `Error::Execution` when a
/// catalog query fails.
pub async fn load_catalog(backend: &PgBackend, schemas: &[String]) -> Result<Vec<RelationInfo>> {
    let schemas: Vec<&str> = schemas
        .iter()
        .map(String::as_str)
        .filter(|s| !SYSTEM_SCHEMAS.contains(s))
        .collect();
    let client = backend.client().await?;
    let query_err = |e: tokio_postgres::Error| Error::Execution(format!("catalog query failed: {e}"));

    let mut rows = CatalogRows::default();
    for row in client.query(RELATIONS_SQL, &[&schemas]).await.map_err(query_err)? {
        rows.relations
            .push((text(&row, 0)?, text(&row, 1)?, text(&row, 2)?));
    }
    for row in client.query(COLUMNS_SQL, &[&schemas]).await.map_err(query_err)? {
        let column = ColumnInfo {
            name: text(&row, 2)?,
            data_type: text(&row, 3)?,
            is_nullable: text(&row, 4)? == "YES",
        };
        rows.columns.push((text(&row, 0)?, text(&row, 1)?, column));
    }
    for row in client.query(FUNCTIONS_SQL, &[&schemas]).await.map_err(query_err)? {
        rows.functions.push((text(&row, 0)?, text(&row, 1)?));
    }

    Ok(assemble(rows))
}

/// Reload `catalog` wholesale from the database
///
/// # Errors
/// See [`load_catalog`]. The catalog keeps its previous contents on failure.
pub async fn refresh_catalog(
    backend: &PgBackend,
    catalog: &InMemoryCatalog,
    schemas: &[String],
) -> Result<usize> {
    let relations = load_catalog(backend, schemas).await?;
    let count = relations.len();
    catalog.replace_all(relations);
    info!(relations = count, schemas = ?schemas, "Refreshed schema catalog");
    Ok(count)
}
