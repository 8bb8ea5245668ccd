//! Pooled PostgreSQL backend

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime, Timeouts,
};
use futures::future::join_all;
use serde_json::{Map, Number, Value as JsonValue};
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{CancelToken, NoTls, Row};
use tracing::{debug, info, warn};

use pgview_common::config::{DatabaseConfig, PoolConfig};
use pgview_common::error::{Error, Result};
use pgview_common::types::{ParamValue, PreviewColumn};

use crate::backend::{BackendSession, CancelHandle, QueryRows, ViewBackend};

/// Bounded connection pool against one PostgreSQL database
#[derive(Clone)]
pub struct PgBackend {
    pool: Pool,
    limits: PoolConfig,
}

impl PgBackend {
    /// Build the pool. No connection is opened until [`PgBackend::prewarm`]
    /// or the first checkout.
    ///
    /// # Errors
    /// Returns `Error::Pool` when the pool configuration is rejected.
    pub fn new(database: &DatabaseConfig, limits: &PoolConfig) -> Result<Self> {
        let mut cfg = PgConfig::new();
        cfg.host = Some(database.host.clone());
        cfg.port = Some(database.port);
        cfg.dbname = Some(database.database.clone());
        cfg.user = Some(database.user.clone());
        cfg.password = Some(database.password.clone());
        cfg.application_name = Some(database.application_name.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let acquire = Some(Duration::from_millis(limits.acquire_timeout_ms));
        let mut pool_cfg = deadpool_postgres::PoolConfig::new(limits.max_connections);
        pool_cfg.timeouts = Timeouts {
            wait: acquire,
            create: acquire,
            recycle: acquire,
        };
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::Pool(e.to_string()))?;

        Ok(Self {
            pool,
            limits: limits.clone(),
        })
    }

    /// Open `min_connections` connections so the first requests skip connect
    /// latency.
    ///
    /// # Errors
    /// Returns `Error::Pool` if any connection cannot be opened.
    pub async fn prewarm(&self) -> Result<()> {
        let wanted = self.limits.min_connections.saturating_sub(self.pool.status().size);
        if wanted == 0 {
            return Ok(());
        }
        let checkouts = join_all((0..wanted).map(|_| self.pool.get())).await;
        for checkout in checkouts {
            checkout.map_err(|e| Error::Pool(e.to_string()))?;
        }
        debug!(connections = wanted, "Pre-warmed connection pool");
        Ok(())
    }

    /// Periodically close connections idle longer than `idle_timeout_secs`,
    /// then top the pool back up to `min_connections`.
    pub fn spawn_idle_reaper(&self) -> JoinHandle<()> {
        let backend = self.clone();
        let idle = Duration::from_secs(self.limits.idle_timeout_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval((idle / 2).max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                let before = backend.pool.status().size;
                backend.pool.retain(|_, metrics| {
                    metrics.recycled.unwrap_or(metrics.created).elapsed() < idle
                });
                let after = backend.pool.status().size;
                if after < before {
                    debug!(closed = before - after, "Reaped idle connections");
                }
                if let Err(e) = backend.prewarm().await {
                    warn!(error = %e, "Failed to restore minimum connections");
                }
            }
        })
    }

    /// Raw client for catalog introspection
    ///
    /// # Errors
    /// Returns `Error::Pool` when no connection is available in time.
    pub async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }

    pub fn limits(&self) -> &PoolConfig {
        &self.limits
    }
}

#[async_trait]
impl ViewBackend for PgBackend {
    async fn session(&self) -> Result<Box<dyn BackendSession>> {
        let client = self.client().await?;
        Ok(Box::new(PgSession {
            cancel: client.cancel_token(),
            client: Some(client),
        }))
    }
}

struct PgSession {
    client: Option<Object>,
    cancel: CancelToken,
}

impl PgSession {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Execution("session was discarded".to_string()))
    }
}

fn exec_err(e: &tokio_postgres::Error) -> Error {
    match e.as_db_error() {
        Some(db) => Error::Execution(format!("{} ({})", db.message(), db.code().code())),
        None => Error::Execution(e.to_string()),
    }
}

fn bind(params: &[ParamValue]) -> Vec<PgParam<'_>> {
    params.iter().map(PgParam).collect()
}

fn as_sql_refs<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl BackendSession for PgSession {
    async fn begin_read_only(&mut self, statement_timeout: Duration) -> Result<()> {
        let sql = format!(
            "BEGIN READ ONLY; SET LOCAL statement_timeout = {}",
            statement_timeout.as_millis().max(1)
        );
        self.client()?.batch_execute(&sql).await.map_err(|e| exec_err(&e))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| exec_err(&e))
    }

    async fn explain(&mut self, sql: &str, params: &[ParamValue]) -> Result<JsonValue> {
        let explain = format!("EXPLAIN (FORMAT JSON) {sql}");
        let bound = bind(params);
        let row = self
            .client()?
            .query_one(explain.as_str(), &as_sql_refs(&bound))
            .await
            .map_err(|e| exec_err(&e))?;
        row.try_get::<_, JsonValue>(0)
            .map_err(|e| Error::Execution(format!("unreadable plan: {e}")))
    }

    async fn query(&mut self, sql: &str, params: &[ParamValue]) -> Result<QueryRows> {
        let client = self.client()?;
        let statement = client.prepare(sql).await.map_err(|e| exec_err(&e))?;
        let bound = bind(params);
        let rows = client
            .query(&statement, &as_sql_refs(&bound))
            .await
            .map_err(|e| exec_err(&e))?;

        let columns = statement
            .columns()
            .iter()
            .map(|c| PreviewColumn {
                name: c.name().to_string(),
                data_type: c.type_().name().to_string(),
            })
            .collect();
        let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
        Ok(QueryRows { columns, rows })
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        Arc::new(PgCancel(self.cancel.clone()))
    }

    fn discard(&mut self) {
        if let Some(object) = self.client.take() {
            drop(Object::take(object));
            info!("Discarded connection after cancelled statement");
        }
    }
}

struct PgCancel(CancelToken);

#[async_trait]
impl CancelHandle for PgCancel {
    async fn cancel(&self) -> Result<()> {
        self.0
            .cancel_query(NoTls)
            .await
            .map_err(|e| Error::Execution(format!("cancel failed: {e}")))
    }
}

// ============================================================================
// Parameter Binding
// ============================================================================

/// Binds a [`ParamValue`] to whatever type the server inferred for its
/// placeholder. Pairs without a binary encoding are sent in text format and
/// parsed by the server.
#[derive(Debug)]
struct PgParam<'a>(&'a ParamValue);

impl PgParam<'_> {
    fn has_binary_encoding(&self, ty: &Type) -> bool {
        match self.0 {
            ParamValue::Bool(_) => *ty == Type::BOOL,
            ParamValue::Int(_) => {
                [Type::INT2, Type::INT4, Type::INT8, Type::FLOAT4, Type::FLOAT8].contains(ty)
            }
            ParamValue::Float(_) => [Type::FLOAT4, Type::FLOAT8].contains(ty),
            ParamValue::Text(_) => {
                [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty)
            }
        }
    }
}

impl ToSql for PgParam<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        if !self.has_binary_encoding(ty) {
            out.extend_from_slice(self.0.to_string().as_bytes());
            return Ok(IsNull::No);
        }
        match (self.0, ty) {
            (ParamValue::Bool(v), _) => v.to_sql(ty, out),
            (ParamValue::Int(v), &Type::INT2) => i16::try_from(*v)?.to_sql(ty, out),
            (ParamValue::Int(v), &Type::INT4) => i32::try_from(*v)?.to_sql(ty, out),
            (ParamValue::Int(v), &Type::INT8) => v.to_sql(ty, out),
            #[allow(clippy::cast_precision_loss)]
            (ParamValue::Int(v), &Type::FLOAT4) => (*v as f32).to_sql(ty, out),
            #[allow(clippy::cast_precision_loss)]
            (ParamValue::Int(v), _) => (*v as f64).to_sql(ty, out),
            #[allow(clippy::cast_possible_truncation)]
            (ParamValue::Float(v), &Type::FLOAT4) => (*v as f32).to_sql(ty, out),
            (ParamValue::Float(v), _) => v.to_sql(ty, out),
            (ParamValue::Text(v), _) => v.as_str().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, ty: &Type) -> Format {
        if self.has_binary_encoding(ty) {
            Format::Binary
        } else {
            Format::Text
        }
    }

    to_sql_checked!();
}

// ============================================================================
// Row Decoding
// ============================================================================

fn row_to_json(row: &Row) -> Result<Map<String, JsonValue>> {
    let mut object = Map::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = cell_to_json(row, idx, column.type_())
            .map_err(|e| Error::Execution(format!("column \"{}\": {e}", column.name())))?;
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}

fn cell_to_json(
    row: &Row,
    idx: usize,
    ty: &Type,
) -> std::result::Result<JsonValue, tokio_postgres::Error> {
    fn opt<T, F>(value: Option<T>, f: F) -> JsonValue
    where
        F: FnOnce(T) -> JsonValue,
    {
        value.map_or(JsonValue::Null, f)
    }

    let value = match *ty {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)?, JsonValue::Bool),
        Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx)?, |v| v.into()),
        Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx)?, |v| v.into()),
        Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx)?, |v| v.into()),
        Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx)?, |v| float(f64::from(v))),
        Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx)?, float),
        Type::NUMERIC => opt(row.try_get::<_, Option<PgNumeric>>(idx)?, |v| {
            JsonValue::String(v.0)
        }),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<JsonValue>>(idx)?.unwrap_or_default(),
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx)?, |v| {
            JsonValue::String(v.to_string())
        }),
        Type::TIMESTAMPTZ => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?,
            |v| JsonValue::String(v.to_rfc3339()),
        ),
        Type::TIMESTAMP => opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?, |v| {
            JsonValue::String(v.to_string())
        }),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx)?, |v| {
            JsonValue::String(v.to_string())
        }),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => opt(v, JsonValue::String),
            Err(_) => {
                debug!(pg_type = %ty, "No JSON mapping for column type");
                JsonValue::Null
            }
        },
    };
    Ok(value)
}

fn float(v: f64) -> JsonValue {
    Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number)
}

/// NUMERIC decoded to its exact decimal text
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric).ok_or_else(|| "malformed numeric".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Binary NUMERIC layout: ndigits, weight, sign, dscale (all 16-bit), then
/// `ndigits` base-10000 digits, most significant first.
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*raw.get(2 * i)?, *raw.get(2 * i + 1)?]))
    };
    let ndigits = usize::from(word(0)?);
    #[allow(clippy::cast_possible_wrap)]
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let digits = (0..ndigits).map(|i| word(4 + i)).collect::<Option<Vec<_>>>()?;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digit_at = |k: i32| -> u16 {
        usize::try_from(k)
            .ok()
            .and_then(|k| digits.get(k).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for k in 0..=weight {
            if k == 0 {
                text.push_str(&digit_at(k).to_string());
            } else {
                text.push_str(&format!("{:04}", digit_at(k)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let groups = dscale.div_ceil(4);
        for j in 1..=groups {
            let k = weight + i32::try_from(j).ok()?;
            fraction.push_str(&format!("{:04}", digit_at(k)));
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in [ndigits, weight as u16, sign, dscale] {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.678
        let raw = numeric(3, 1, 0, 3, &[1, 2345, 6780]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("12345.678"));

        // -0.05
        let raw = numeric(1, -1, 0x4000, 2, &[500]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("-0.05"));

        // 10000 (trailing zero groups omitted)
        let raw = numeric(1, 1, 0, 0, &[1]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("10000"));

        let raw = numeric(0, 0, 0xC000, 0, &[]);
        assert_eq!(decode_numeric(&raw).as_deref(), Some("NaN"));
    }

    #[test]
    fn test_decode_numeric_truncated_input() {
        assert_eq!(decode_numeric(&[0, 2, 0, 0]), None);
    }

    #[test]
    fn test_text_params_fall_back_to_text_format() {
        let value = ParamValue::Text("2024-01-31".to_string());
        let param = PgParam(&value);
        assert!(matches!(param.encode_format(&Type::DATE), Format::Text));
        assert!(matches!(param.encode_format(&Type::TEXT), Format::Binary));

        let mut out = BytesMut::new();
        param.to_sql(&Type::DATE, &mut out).unwrap();
        assert_eq!(&out[..], b"2024-01-31");
    }

    #[test]
    fn test_int_params_narrow_to_server_type() {
        let value = ParamValue::Int(42);
        let mut out = BytesMut::new();
        PgParam(&value).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &42i32.to_be_bytes());

        let big = ParamValue::Int(i64::MAX);
        let mut out = BytesMut::new();
        assert!(PgParam(&big).to_sql(&Type::INT2, &mut out).is_err());
    }
}
