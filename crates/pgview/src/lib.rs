//! pgview: Managed, Versioned PostgreSQL Views
//!
//! Compiles UI-editable query definitions into parameterized SQL and
//! manages the resulting views.
//!
//! # Features
//!
//! - **Query compiler** - deterministic SQL with positional parameters
//! - **Dependency analysis** - tables, views and functions a view reads
//! - **Version history** - append-only, per-view serialized labels
//! - **Estimation and preview** - plan-only metrics and bounded read-only runs
//! - **Webhooks** - retrying delivery of view change events

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use pgview_common as common;
pub use pgview_query as query;
pub use pgview_views as views;
pub use pgview_webhooks as webhooks;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use pgview_common::config::PlatformConfig;
use pgview_common::error::{Error, Result};
use pgview_query::InMemoryCatalog;
use pgview_views::introspect::refresh_catalog;
use pgview_views::{PgBackend, ViewService};
use pgview_webhooks::{ReqwestTransport, WebhookManager};

/// How often due webhook deliveries are attempted
const WEBHOOK_TICK: Duration = Duration::from_secs(1);

/// Read a TOML configuration file, falling back to defaults when it does
/// not exist.
///
/// # Errors
/// Returns `Error::Io` when the file cannot be read, `Error::Config` when it
/// does not parse or fails validation.
pub fn load_config(path: &Path) -> Result<PlatformConfig> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?
    } else {
        info!(path = %path.display(), "Using default configuration");
        PlatformConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// A connected platform: pool, catalog, view service and webhook delivery
pub struct Platform {
    config: PlatformConfig,
    backend: PgBackend,
    catalog: InMemoryCatalog,
    service: Arc<ViewService>,
    webhooks: Arc<WebhookManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Platform {
    /// Build the pool, pre-warm it, load the schema catalog and start the
    /// background tasks.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the database is
    /// unreachable.
    pub async fn connect(config: PlatformConfig) -> Result<Self> {
        config.validate()?;
        info!(
            host = %config.database.host,
            database = %config.database.database,
            "Connecting to target database"
        );

        let backend = PgBackend::new(&config.database, &config.pool)?;
        backend.prewarm().await?;

        let catalog = InMemoryCatalog::new();
        let schemas = vec![config.compiler.default_schema.clone()];
        if let Err(e) = refresh_catalog(&backend, &catalog, &schemas).await {
            warn!(error = %e, "Catalog introspection failed, dependencies will be unresolved");
        }

        let transport = ReqwestTransport::new(&config.webhooks)
            .map_err(|e| Error::Config(e.to_string()))?;
        let webhooks = Arc::new(WebhookManager::new(Arc::new(transport), &config.webhooks));

        let service = Arc::new(
            ViewService::new(
                config.clone(),
                Arc::new(backend.clone()),
                Arc::new(catalog.clone()),
            )
            .with_event_sink(webhooks.clone()),
        );

        let tasks = vec![
            backend.spawn_idle_reaper(),
            Arc::clone(&webhooks).spawn_scheduler(WEBHOOK_TICK),
        ];

        Ok(Self {
            config,
            backend,
            catalog,
            service,
            webhooks,
            tasks,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    #[must_use]
    pub fn service(&self) -> Arc<ViewService> {
        Arc::clone(&self.service)
    }

    #[must_use]
    pub fn webhooks(&self) -> Arc<WebhookManager> {
        Arc::clone(&self.webhooks)
    }

    #[must_use]
    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    /// Reload the schema catalog
    ///
    /// # Errors
    /// Returns the introspection error; the previous catalog stays in place.
    pub async fn refresh_catalog(&self) -> Result<usize> {
        let schemas = vec![self.config.compiler.default_schema.clone()];
        refresh_catalog(&self.backend, &self.catalog, &schemas).await
    }

    /// Stop background tasks
    pub fn shutdown(self) {
        info!("Shutting down pgview");
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.preview.default_limit, 100);
    }

    #[test]
    fn test_load_config_rejects_invalid_pool() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_connections = 10\nmax_connections = 2").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[test]
    fn test_load_config_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[preview]\nmax_rows = 250\n\n[compiler]\ndefault_schema = \"app\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.preview.ceiling(), 250);
        assert_eq!(config.compiler.default_schema, "app");
        assert_eq!(config.estimator.timeout_ms, PlatformConfig::default().estimator.timeout_ms);
    }
}
