//! Schema catalog consulted by dependency analysis

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use pgview_common::types::DependencyType;

/// Kind of catalog relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Table,
    View,
    Function,
}

impl From<RelationKind> for DependencyType {
    fn from(kind: RelationKind) -> Self {
        match kind {
            RelationKind::Table => Self::Table,
            RelationKind::View => Self::View,
            RelationKind::Function => Self::Function,
        }
    }
}

/// Schema-qualified relation name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Lookup of known relations
pub trait SchemaCatalog: Send + Sync {
    /// Kind of `schema.name`, or `None` when the catalog does not know it
    fn relation_kind(&self, schema: &str, name: &str) -> Option<RelationKind>;

    /// Whether `schema.table` has `column`; `None` when the catalog holds no
    /// column list for the relation
    fn has_column(&self, schema: &str, table: &str, column: &str) -> Option<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
        }
    }
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub schema: String,
    pub name: String,
    pub kind: RelationKind,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn table(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(schema, name, RelationKind::Table)
    }

    pub fn view(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(schema, name, RelationKind::View)
    }

    pub fn function(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(schema, name, RelationKind::Function)
    }

    fn with_kind(schema: impl Into<String>, name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_columns(mut self, columns: Vec<ColumnInfo>) -> Self {
        self.columns = columns;
        self
    }

    #[must_use]
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.schema, &self.name)
    }
}

/// Catalog held in memory, refreshed wholesale from introspection
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    relations: Arc<RwLock<HashMap<QualifiedName, RelationInfo>>>,
    last_refresh: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a fixed relation list
    pub fn with_relations(relations: impl IntoIterator<Item = RelationInfo>) -> Self {
        let catalog = Self::new();
        catalog.replace_all(relations);
        catalog
    }

    /// Add or replace one relation
    pub fn insert(&self, relation: RelationInfo) {
        self.relations
            .write()
            .insert(relation.qualified_name(), relation);
    }

    /// Swap the whole catalog contents and stamp the refresh time
    pub fn replace_all(&self, relations: impl IntoIterator<Item = RelationInfo>) {
        let fresh: HashMap<_, _> = relations
            .into_iter()
            .map(|r| (r.qualified_name(), r))
            .collect();
        *self.relations.write() = fresh;
        *self.last_refresh.write() = Some(Utc::now());
    }

    pub fn get(&self, schema: &str, name: &str) -> Option<RelationInfo> {
        self.relations
            .read()
            .get(&QualifiedName::new(schema, name))
            .cloned()
    }

    /// All relations sorted by qualified name
    pub fn relations(&self) -> Vec<RelationInfo> {
        let mut all: Vec<_> = self.relations.read().values().cloned().collect();
        all.sort_by_key(RelationInfo::qualified_name);
        all
    }

    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.read().is_empty()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read()
    }
}

impl SchemaCatalog for InMemoryCatalog {
    fn relation_kind(&self, schema: &str, name: &str) -> Option<RelationKind> {
        self.relations
            .read()
            .get(&QualifiedName::new(schema, name))
            .map(|r| r.kind)
    }

    fn has_column(&self, schema: &str, table: &str, column: &str) -> Option<bool> {
        let relations = self.relations.read();
        let relation = relations.get(&QualifiedName::new(schema, table))?;
        if relation.columns.is_empty() {
            return None;
        }
        Some(relation.columns.iter().any(|c| c.name == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_kind() {
        let catalog = InMemoryCatalog::with_relations([
            RelationInfo::table("public", "orders"),
            RelationInfo::view("reporting", "daily_sales"),
        ]);

        assert_eq!(catalog.relation_kind("public", "orders"), Some(RelationKind::Table));
        assert_eq!(
            catalog.relation_kind("reporting", "daily_sales"),
            Some(RelationKind::View)
        );
        assert_eq!(catalog.relation_kind("reporting", "orders"), None);
        assert!(catalog.last_refresh().is_some());
    }

    #[test]
    fn test_has_column() {
        let catalog = InMemoryCatalog::with_relations([
            RelationInfo::table("public", "orders")
                .with_columns(vec![ColumnInfo::new("id", "int8"), ColumnInfo::new("status", "text")]),
            RelationInfo::table("public", "bare"),
        ]);

        assert_eq!(catalog.has_column("public", "orders", "status"), Some(true));
        assert_eq!(catalog.has_column("public", "orders", "total"), Some(false));
        assert_eq!(catalog.has_column("public", "bare", "anything"), None);
        assert_eq!(catalog.has_column("public", "missing", "id"), None);
    }

    #[test]
    fn test_replace_all_drops_stale_entries() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(RelationInfo::table("public", "legacy"));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.last_refresh().is_none());

        catalog.replace_all([
            RelationInfo::table("public", "users"),
            RelationInfo::table("public", "accounts"),
        ]);
        assert!(catalog.get("public", "legacy").is_none());
        let names: Vec<_> = catalog.relations().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["accounts", "users"]);
    }

    #[test]
    fn test_qualified_name_display() {
        assert_eq!(QualifiedName::new("public", "orders").to_string(), "public.orders");
    }
}
