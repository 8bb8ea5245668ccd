//! Append-only view version history
//!
//! Label assignment is serialized per view with an async mutex; different
//! views never wait on each other. The store additionally refuses an append
//! whose expected predecessor is not the newest stored version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use pgview_common::error::{Error, Result};
use pgview_common::types::{VersionLabel, ViewVersion};

/// Persistence for version history
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Newest version of `view_id`
    async fn latest(&self, view_id: Uuid) -> Result<Option<ViewVersion>>;

    /// Append `version` only if the newest stored label is `expected`
    /// (`None` meaning no history yet).
    async fn append_if_latest(
        &self,
        expected: Option<VersionLabel>,
        version: ViewVersion,
    ) -> Result<()>;

    /// Full history of `view_id`, oldest first
    async fn history(&self, view_id: Uuid) -> Result<Vec<ViewVersion>>;
}

/// Version history held in memory
#[derive(Debug, Default)]
pub struct InMemoryVersionStore {
    versions: RwLock<HashMap<Uuid, Vec<ViewVersion>>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn label_or_none(label: Option<VersionLabel>) -> String {
    label.map_or_else(|| "none".to_string(), |l| l.to_string())
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn latest(&self, view_id: Uuid) -> Result<Option<ViewVersion>> {
        Ok(self
            .versions
            .read()
            .get(&view_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn append_if_latest(
        &self,
        expected: Option<VersionLabel>,
        version: ViewVersion,
    ) -> Result<()> {
        let mut versions = self.versions.write();
        let history = versions.entry(version.view_id).or_default();
        let found = history.last().map(|v| v.version);
        if found != expected {
            return Err(Error::VersionConflict {
                view_id: version.view_id,
                expected: label_or_none(expected),
                found: label_or_none(found),
            });
        }
        history.push(version);
        Ok(())
    }

    async fn history(&self, view_id: Uuid) -> Result<Vec<ViewVersion>> {
        Ok(self
            .versions
            .read()
            .get(&view_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Assigns version labels and appends history records
pub struct VersionManager {
    store: Arc<dyn VersionStore>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl VersionManager {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Append a new version after whatever is currently newest: `1.0` for
    /// the first version, otherwise the minor component is incremented.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn record_version(
        &self,
        view_id: Uuid,
        sql_definition: impl Into<String>,
        change_notes: Option<String>,
        actor: impl Into<String>,
    ) -> Result<ViewVersion> {
        self.append(view_id, None, sql_definition.into(), change_notes, actor.into())
            .await
    }

    /// Like [`VersionManager::record_version`], but only when the newest
    /// version is `expected`.
    ///
    /// # Errors
    /// Returns `Error::VersionConflict` if another save already moved the
    /// history past `expected`.
    pub async fn record_version_after(
        &self,
        view_id: Uuid,
        expected: Option<VersionLabel>,
        sql_definition: impl Into<String>,
        change_notes: Option<String>,
        actor: impl Into<String>,
    ) -> Result<ViewVersion> {
        self.append(
            view_id,
            Some(expected),
            sql_definition.into(),
            change_notes,
            actor.into(),
        )
        .await
    }

    async fn append(
        &self,
        view_id: Uuid,
        expected: Option<Option<VersionLabel>>,
        sql_definition: String,
        change_notes: Option<String>,
        created_by: String,
    ) -> Result<ViewVersion> {
        let lock = self.locks.entry(view_id).or_default().clone();
        let _guard = lock.lock().await;

        let latest = self.store.latest(view_id).await?;
        let found = latest.as_ref().map(|v| v.version);
        if let Some(expected) = expected {
            if expected != found {
                return Err(Error::VersionConflict {
                    view_id,
                    expected: label_or_none(expected),
                    found: label_or_none(found),
                });
            }
        }

        let label = found.map_or(VersionLabel::INITIAL, VersionLabel::next_minor);
        let now = Utc::now();
        let created_at = latest.as_ref().map_or(now, |v| v.created_at.max(now));
        let version = ViewVersion {
            id: Uuid::new_v4(),
            view_id,
            version: label,
            sql_definition,
            change_notes,
            created_by,
            created_at,
        };

        self.store.append_if_latest(found, version.clone()).await?;
        info!(%view_id, version = %label, actor = %version.created_by, "Recorded view version");
        Ok(version)
    }

    /// History of `view_id`, newest first
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn list_versions(&self, view_id: Uuid) -> Result<Vec<ViewVersion>> {
        let mut history = self.store.history(view_id).await?;
        history.reverse();
        Ok(history)
    }

    /// Newest version label of `view_id`
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn latest_label(&self, view_id: Uuid) -> Result<Option<VersionLabel>> {
        Ok(self.store.latest(view_id).await?.map(|v| v.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> VersionManager {
        VersionManager::new(Arc::new(InMemoryVersionStore::new()))
    }

    #[tokio::test]
    async fn test_sequential_labels() {
        let versions = manager();
        let view_id = Uuid::new_v4();

        let first = versions
            .record_version(view_id, "SELECT 1", None, "alice")
            .await
            .unwrap();
        let second = versions
            .record_version(view_id, "SELECT 2", Some("tweak".to_string()), "bob")
            .await
            .unwrap();

        assert_eq!(first.version.to_string(), "1.0");
        assert_eq!(second.version.to_string(), "1.1");
        assert!(second.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let versions = manager();
        let view_id = Uuid::new_v4();
        for i in 0..3 {
            versions
                .record_version(view_id, format!("SELECT {i}"), None, "alice")
                .await
                .unwrap();
        }

        let listed = versions.list_versions(view_id).await.unwrap();
        let labels: Vec<_> = listed.iter().map(|v| v.version.to_string()).collect();
        assert_eq!(labels, vec!["1.2", "1.1", "1.0"]);
        assert_eq!(listed[0].sql_definition, "SELECT 2");

        assert!(versions.list_versions(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_get_distinct_labels() {
        let versions = Arc::new(manager());
        let view_id = Uuid::new_v4();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let versions = Arc::clone(&versions);
                tokio::spawn(async move {
                    versions
                        .record_version(view_id, format!("SELECT {i}"), None, "worker")
                        .await
                })
            })
            .collect();

        let mut labels = Vec::new();
        for task in tasks {
            labels.push(task.await.unwrap().unwrap().version);
        }
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 16);
        assert_eq!(labels.last().unwrap().to_string(), "1.15");
    }

    #[tokio::test]
    async fn test_stale_expectation_conflicts() {
        let versions = manager();
        let view_id = Uuid::new_v4();
        versions
            .record_version_after(view_id, None, "SELECT 1", None, "alice")
            .await
            .unwrap();
        versions
            .record_version_after(view_id, Some(VersionLabel::INITIAL), "SELECT 2", None, "bob")
            .await
            .unwrap();

        let err = versions
            .record_version_after(view_id, Some(VersionLabel::INITIAL), "SELECT 3", None, "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(versions.list_versions(view_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_rejects_out_of_order_append() {
        let store = InMemoryVersionStore::new();
        let view_id = Uuid::new_v4();
        let version = ViewVersion {
            id: Uuid::new_v4(),
            view_id,
            version: VersionLabel::INITIAL.next_minor(),
            sql_definition: "SELECT 1".to_string(),
            change_notes: None,
            created_by: "alice".to_string(),
            created_at: Utc::now(),
        };
        let err = store
            .append_if_latest(Some(VersionLabel::INITIAL), version)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }
}
