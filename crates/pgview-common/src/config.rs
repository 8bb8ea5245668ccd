//! Configuration types for pgview

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard ceiling on preview rows; configuration can lower it, never raise it.
pub const MAX_PREVIEW_ROWS: u32 = 1000;

/// Default preview row count when the caller gives none.
pub const DEFAULT_PREVIEW_ROWS: u32 = 100;

/// Main configuration for all pgview services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Target database connection
    pub database: DatabaseConfig,
    /// Connection pool limits
    pub pool: PoolConfig,
    /// Query compiler settings
    pub compiler: CompilerConfig,
    /// Preview executor settings
    pub preview: PreviewConfig,
    /// Performance estimator settings
    pub estimator: EstimatorConfig,
    /// Webhook delivery settings
    pub webhooks: WebhookConfig,
}

impl PlatformConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            return Err(Error::Config("pool.max_connections must be > 0".to_string()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.preview.timeout_ms == 0 || self.estimator.timeout_ms == 0 {
            return Err(Error::Config("timeouts must be > 0".to_string()));
        }
        if self.preview.default_limit == 0 || self.preview.max_rows == 0 {
            return Err(Error::Config("preview limits must be > 0".to_string()));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(Error::Config("webhooks.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Application name reported to the server
    pub application_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            application_name: "pgview".to_string(),
        }
    }
}

/// Connection pool limits for a target connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly at startup
    pub min_connections: usize,
    /// Upper bound on concurrent connections
    pub max_connections: usize,
    /// Idle connections older than this are closed
    pub idle_timeout_secs: u64,
    /// How long a caller waits for a free connection
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_secs: 300,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Query compiler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Schema used to qualify bare identifiers in raw SQL
    pub default_schema: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_schema: "public".to_string(),
        }
    }
}

/// Preview executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Rows returned when the caller gives no (or a non-positive) limit
    pub default_limit: u32,
    /// Upper bound on rows; clamped to `MAX_PREVIEW_ROWS`
    pub max_rows: u32,
    /// Default statement timeout in milliseconds
    pub timeout_ms: u64,
}

impl PreviewConfig {
    /// Effective ceiling, never above the hard limit.
    #[must_use]
    pub fn ceiling(&self) -> u32 {
        self.max_rows.clamp(1, MAX_PREVIEW_ROWS)
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PREVIEW_ROWS,
            max_rows: MAX_PREVIEW_ROWS,
            timeout_ms: 10_000,
        }
    }
}

/// Performance estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Default plan request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Total delivery attempts before a delivery is abandoned
    pub max_attempts: u32,
    /// First retry delay
    pub base_backoff_ms: u64,
    /// Retry delay cap
    pub max_backoff_ms: u64,
    /// Per-request HTTP timeout
    pub request_timeout_ms: u64,
    /// Finished deliveries kept for inspection, oldest dropped first
    pub history_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            request_timeout_ms: 5_000,
            history_limit: 1_000,
        }
    }
}
