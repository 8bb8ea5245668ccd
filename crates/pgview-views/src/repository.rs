//! Storage of managed views and their dependency rows

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use pgview_common::error::{Error, Result};
use pgview_common::types::{PerformanceMetrics, VersionLabel, ViewDependency};

use crate::model::DatabaseView;

/// Persistence for [`DatabaseView`] records. A view and its dependency rows
/// are always written together.
#[async_trait]
pub trait ViewRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<DatabaseView>>;

    async fn find_by_name(
        &self,
        connection_id: Uuid,
        schema: &str,
        name: &str,
    ) -> Result<Option<DatabaseView>>;

    /// Store a new view; `Error::ViewAlreadyExists` if the name is taken on
    /// the same connection
    async fn insert(&self, view: DatabaseView, dependencies: Vec<ViewDependency>) -> Result<()>;

    /// Replace a view only if its stored version is still `expected`
    async fn replace_if_version(
        &self,
        view: DatabaseView,
        dependencies: Vec<ViewDependency>,
        expected: VersionLabel,
    ) -> Result<()>;

    /// Overwrite stored metrics without touching anything else
    async fn set_metrics(&self, id: Uuid, metrics: PerformanceMetrics) -> Result<()>;

    async fn dependencies(&self, id: Uuid) -> Result<Vec<ViewDependency>>;

    /// Views of one connection, sorted by qualified name
    async fn list(&self, connection_id: Uuid) -> Result<Vec<DatabaseView>>;
}

#[derive(Debug, Clone)]
struct StoredView {
    view: DatabaseView,
    dependencies: Vec<ViewDependency>,
}

/// View records held in memory
#[derive(Debug, Default)]
pub struct InMemoryViewRepository {
    views: RwLock<HashMap<Uuid, StoredView>>,
}

impl InMemoryViewRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(
    views: &HashMap<Uuid, StoredView>,
    candidate: &DatabaseView,
) -> bool {
    views.values().any(|stored| {
        stored.view.id != candidate.id
            && stored.view.connection_id == candidate.connection_id
            && stored.view.schema == candidate.schema
            && stored.view.name == candidate.name
    })
}

#[async_trait]
impl ViewRepository for InMemoryViewRepository {
    async fn get(&self, id: Uuid) -> Result<Option<DatabaseView>> {
        Ok(self.views.read().get(&id).map(|s| s.view.clone()))
    }

    async fn find_by_name(
        &self,
        connection_id: Uuid,
        schema: &str,
        name: &str,
    ) -> Result<Option<DatabaseView>> {
        Ok(self
            .views
            .read()
            .values()
            .find(|s| {
                s.view.connection_id == connection_id
                    && s.view.schema == schema
                    && s.view.name == name
            })
            .map(|s| s.view.clone()))
    }

    async fn insert(&self, view: DatabaseView, dependencies: Vec<ViewDependency>) -> Result<()> {
        let mut views = self.views.write();
        if views.contains_key(&view.id) || name_taken(&views, &view) {
            return Err(Error::ViewAlreadyExists(view.qualified_name()));
        }
        views.insert(view.id, StoredView { view, dependencies });
        Ok(())
    }

    async fn replace_if_version(
        &self,
        view: DatabaseView,
        dependencies: Vec<ViewDependency>,
        expected: VersionLabel,
    ) -> Result<()> {
        let mut views = self.views.write();
        let found = views
            .get(&view.id)
            .map(|s| s.view.current_version)
            .ok_or(Error::ViewNotFound(view.id))?;
        if found != expected {
            return Err(Error::VersionConflict {
                view_id: view.id,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
        if name_taken(&views, &view) {
            return Err(Error::ViewAlreadyExists(view.qualified_name()));
        }
        views.insert(view.id, StoredView { view, dependencies });
        Ok(())
    }

    async fn set_metrics(&self, id: Uuid, metrics: PerformanceMetrics) -> Result<()> {
        let mut views = self.views.write();
        let stored = views.get_mut(&id).ok_or(Error::ViewNotFound(id))?;
        stored.view.performance_metrics = Some(metrics);
        Ok(())
    }

    async fn dependencies(&self, id: Uuid) -> Result<Vec<ViewDependency>> {
        self.views
            .read()
            .get(&id)
            .map(|s| s.dependencies.clone())
            .ok_or(Error::ViewNotFound(id))
    }

    async fn list(&self, connection_id: Uuid) -> Result<Vec<DatabaseView>> {
        let mut views: Vec<_> = self
            .views
            .read()
            .values()
            .filter(|s| s.view.connection_id == connection_id)
            .map(|s| s.view.clone())
            .collect();
        views.sort_by_key(DatabaseView::qualified_name);
        Ok(views)
    }
}
