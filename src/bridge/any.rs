//! Bridge driver backed by `sqlx::AnyConnection`.
//!
//! The warehouse endpoint is reached through whichever sqlx driver matches
//! the URL scheme of the connection string. Column metadata comes from a
//! prepare round-trip, so empty results still carry their column names.

use std::future::Future;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column, Connection, Executor, Row, Statement, TypeInfo};
use tracing::{debug, info};

use super::{
    BridgeDriver, BridgeError, BridgeParam, BridgeResponse, BridgeResult, BridgeValue,
    QueryOptions, ResultSet,
};

/// Statement that reports the id of the previous query on the same session.
pub const LAST_QUERY_ID: &str = "SELECT LAST_QUERY_ID()";

/// A [`BridgeDriver`] that opens one `AnyConnection` per handle.
///
/// The connection string must be a URL (`postgres://...`); ODBC keyword
/// strings are rejected with `08001`.
///
/// Calls made with `with_query_id` follow the statement with a query id
/// lookup ([`LAST_QUERY_ID`] unless replaced). A backend that cannot answer
/// it yields `query_id: None`, and column types are then inferred. The
/// lookup is skipped on PostgreSQL, where a failed statement aborts the
/// open transaction.
#[derive(Debug, Clone)]
pub struct SqlxBridge {
    query_id_lookup: Option<String>,
}

impl Default for SqlxBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlxBridge {
    pub fn new() -> Self {
        // Install default drivers
        sqlx::any::install_default_drivers();
        Self {
            query_id_lookup: Some(LAST_QUERY_ID.to_string()),
        }
    }

    /// Replace the query id lookup statement, or disable it with `None`.
    pub fn query_id_lookup(mut self, statement: Option<&str>) -> Self {
        self.query_id_lookup = statement.map(str::to_string);
        self
    }
}

#[async_trait]
impl BridgeDriver for SqlxBridge {
    type Handle = AnyConnection;

    async fn connect(&self, connection_string: &str) -> BridgeResult<AnyConnection> {
        if !connection_string.contains("://") && !connection_string.starts_with("sqlite:") {
            return Err(
                BridgeError::new("sqlx bridge requires a URL connection string")
                    .with_sqlstate("08001"),
            );
        }
        sqlx::any::install_default_drivers();
        let conn = AnyConnection::connect(connection_string)
            .await
            .map_err(|e| map_connect_error(&e))?;
        info!(backend = conn.backend_name(), "sqlx bridge connected");
        Ok(conn)
    }

    async fn param_query(
        &self,
        handle: &mut AnyConnection,
        statement: &str,
        params: &[BridgeParam],
        opts: &QueryOptions,
    ) -> BridgeResult<BridgeResponse> {
        let lookup = if opts.with_query_id && handle.backend_name() != "PostgreSQL" {
            self.query_id_lookup.as_deref()
        } else {
            None
        };
        with_timeout(opts, run(handle, statement, params, lookup)).await
    }

    async fn disconnect(&self, handle: AnyConnection) -> BridgeResult<()> {
        handle.close().await.map_err(|e| map_error(&e))
    }
}

async fn with_timeout<T>(
    opts: &QueryOptions,
    fut: impl Future<Output = BridgeResult<T>>,
) -> BridgeResult<T> {
    match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            BridgeError::new(format!("bridge call exceeded {:?}", limit)).with_sqlstate("HYT00")
        })?,
        None => fut.await,
    }
}

async fn run(
    handle: &mut AnyConnection,
    statement: &str,
    params: &[BridgeParam],
    query_id_lookup: Option<&str>,
) -> BridgeResult<BridgeResponse> {
    let prepared = (&mut *handle)
        .prepare(statement)
        .await
        .map_err(|e| map_error(&e))?;
    let columns: Vec<String> = prepared
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut query = sqlx::query(statement);
    for param in params {
        query = bind(query, param)?;
    }

    if columns.is_empty() {
        let done = query
            .execute(&mut *handle)
            .await
            .map_err(|e| map_error(&e))?;
        return Ok(BridgeResponse::updated(done.rows_affected()));
    }

    let rows: Vec<AnyRow> = query
        .fetch_all(&mut *handle)
        .await
        .map_err(|e| map_error(&e))?;
    debug!(rows = rows.len(), "sqlx bridge fetched");
    let rows = rows
        .iter()
        .map(row_to_values)
        .collect::<BridgeResult<Vec<_>>>()?;

    let query_id = match query_id_lookup {
        Some(lookup) => last_query_id(handle, lookup).await,
        None => None,
    };

    Ok(BridgeResponse::Selected(ResultSet {
        columns,
        rows,
        query_id,
        warnings: 0,
    }))
}

/// Id of the statement just run, or `None` when the backend cannot say.
async fn last_query_id(handle: &mut AnyConnection, lookup: &str) -> Option<String> {
    match sqlx::query_scalar::<_, Option<String>>(lookup)
        .fetch_one(&mut *handle)
        .await
    {
        Ok(id) => id.filter(|id| !id.is_empty()),
        Err(e) => {
            debug!("query id lookup unavailable: {}", e);
            None
        }
    }
}

fn bind<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    param: &'q BridgeParam,
) -> BridgeResult<Query<'q, Any, AnyArguments<'q>>> {
    Ok(match &param.value {
        BridgeValue::Null => query.bind(None::<String>),
        BridgeValue::Int(v) => query.bind(*v),
        BridgeValue::Float(v) => query.bind(*v),
        BridgeValue::Bit(v) => query.bind(*v),
        BridgeValue::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| {
                BridgeError::new(format!("parameter is not valid UTF-8: {}", e))
                    .with_sqlstate("22018")
            })?;
            query.bind(text)
        }
        BridgeValue::Binary(bytes) => query.bind(bytes.clone()),
    })
}

/// Convert one row to bridge values by the column's reported type name.
///
/// A cell that fails to decode is an error, never a NULL.
fn row_to_values(row: &AnyRow) -> BridgeResult<Vec<BridgeValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = match column.type_info().name() {
                "BOOL" | "BOOLEAN" => cell::<bool>(row, i)?.map(BridgeValue::Bit),
                "INT2" | "INT4" | "INT8" | "INTEGER" | "BIGINT" | "SMALLINT" => {
                    cell::<i64>(row, i)?.map(BridgeValue::Int)
                }
                "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" => {
                    cell::<f64>(row, i)?.map(BridgeValue::Float)
                }
                "BLOB" | "BYTEA" => cell::<Vec<u8>>(row, i)?.map(BridgeValue::Binary),
                _ => cell::<String>(row, i)?.map(BridgeValue::text),
            };
            Ok(value.unwrap_or(BridgeValue::Null))
        })
        .collect()
}

fn cell<'r, T>(row: &'r AnyRow, index: usize) -> BridgeResult<Option<T>>
where
    T: sqlx::Decode<'r, Any> + sqlx::Type<Any>,
{
    row.try_get::<Option<T>, _>(index).map_err(|e| map_error(&e))
}

fn map_connect_error(err: &sqlx::Error) -> BridgeError {
    match err {
        sqlx::Error::Database(_) => map_error(err),
        _ => BridgeError::new(err.to_string()).with_sqlstate("08001"),
    }
}

/// Translate a sqlx error into a bridge error with a SQLSTATE.
fn map_error(err: &sqlx::Error) -> BridgeError {
    let state = match err {
        sqlx::Error::Database(db) => {
            return match db.code() {
                Some(code) => BridgeError::new(db.message()).with_sqlstate(code.into_owned()),
                None => BridgeError::new(db.message()).with_sqlstate("HY000"),
            };
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => "08S01",
        sqlx::Error::WorkerCrashed | sqlx::Error::PoolClosed => "08003",
        sqlx::Error::PoolTimedOut => "HYT01",
        sqlx::Error::Configuration(_) => "08001",
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => "22018",
        sqlx::Error::ColumnNotFound(_) => "42S22",
        _ => "HY000",
    };
    BridgeError::new(err.to_string()).with_sqlstate(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_odbc_strings() {
        let result = SqlxBridge::new()
            .connect("DRIVER=SnowflakeDSIIDriver;SERVER=acme.snowflakecomputing.com")
            .await;
        match result {
            Err(err) => assert_eq!(err.sqlstate.as_deref(), Some("08001")),
            Ok(_) => panic!("ODBC keyword string must be rejected"),
        }
    }

    #[test]
    fn test_map_error_classes() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(map_error(&io).sqlstate.as_deref(), Some("08S01"));
        assert_eq!(
            map_error(&sqlx::Error::PoolTimedOut).sqlstate.as_deref(),
            Some("HYT01")
        );
        assert_eq!(
            map_error(&sqlx::Error::RowNotFound).sqlstate.as_deref(),
            Some("HY000")
        );
    }

    #[tokio::test]
    async fn test_timeout_is_hyt00() {
        let opts = QueryOptions {
            with_query_id: false,
            timeout: Some(std::time::Duration::from_millis(10)),
        };
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok::<_, BridgeError>(())
        };
        let err = with_timeout(&opts, slow).await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("HYT00"));
    }

    async fn sqlite() -> (SqlxBridge, AnyConnection) {
        let bridge = SqlxBridge::new();
        let conn = bridge.connect("sqlite::memory:").await.unwrap();
        (bridge, conn)
    }

    #[tokio::test]
    async fn test_undecodable_cell_is_an_error() {
        let (bridge, mut conn) = sqlite().await;
        let opts = QueryOptions::default();
        for statement in ["CREATE TABLE t (x INTEGER)", "INSERT INTO t VALUES ('abc')"] {
            bridge.param_query(&mut conn, statement, &[], &opts).await.unwrap();
        }

        let err = bridge
            .param_query(&mut conn, "SELECT x FROM t", &[], &opts)
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("22018"));
    }

    #[tokio::test]
    async fn test_missing_query_id_lookup_is_tolerated() {
        let (bridge, mut conn) = sqlite().await;
        let opts = QueryOptions {
            with_query_id: true,
            timeout: None,
        };
        for statement in ["CREATE TABLE t (x INTEGER)", "INSERT INTO t VALUES (6)"] {
            bridge.param_query(&mut conn, statement, &[], &opts).await.unwrap();
        }

        match bridge.param_query(&mut conn, "SELECT x FROM t", &[], &opts).await {
            Ok(BridgeResponse::Selected(set)) => {
                assert_eq!(set.rows, vec![vec![BridgeValue::Int(6)]]);
                assert_eq!(set.query_id, None);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }
}
