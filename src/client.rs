//! Public entry points.
//!
//! [`Snowbridge`] starts a pool of [`Protocol`] connections sharing one
//! [`TypeCache`] and forwards each call to a checked-out connection.
//!
//! ```rust,ignore
//! let options = ConnectionOptions::from_file("snowbridge.toml")?;
//! let db = Snowbridge::connect(options).await?;
//!
//! let result = db.query("SELECT 2 * 3", &[]).await?;
//! assert_eq!(result.rows, vec![vec![Value::Int(6)]]);
//!
//! let mut tx = db.transaction().await?;
//! tx.execute(&Query::new("INSERT INTO t VALUES (?)"), &[42.into()]).await?;
//! tx.commit().await?;
//! ```

use std::sync::Arc;

use tracing::warn;

use crate::bridge::{BridgeDriver, SqlxBridge};
use crate::config::ConnectionOptions;
use crate::error::Result;
use crate::pool::{Pool, PoolConfig, PoolStats, PooledConnection};
use crate::protocol::{Connection, Cursor, Fetch, Protocol, ProtocolConfig, TransactionStatus};
use crate::query::{Param, Query, QueryResult};
use crate::types::{ColumnType, TypeCache};

type Pooled<D> = PooledConnection<Protocol<D>>;

/// A pooled Snowflake client.
pub struct Snowbridge<D: BridgeDriver = SqlxBridge> {
    pool: Pool<Protocol<D>>,
    cache: Arc<TypeCache>,
}

impl<D: BridgeDriver> Clone for Snowbridge<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl Snowbridge<SqlxBridge> {
    /// Connect through the sqlx bridge with default pool settings.
    pub async fn connect(options: ConnectionOptions) -> Result<Self> {
        let pool = PoolConfig::from_options(&options);
        Self::with_driver(SqlxBridge::new(), options, pool).await
    }
}

impl<D: BridgeDriver> Snowbridge<D> {
    /// Start a pool over `driver` with a fresh type cache.
    pub async fn with_driver(driver: D, options: ConnectionOptions, pool: PoolConfig) -> Result<Self> {
        let config = ProtocolConfig::new(driver, options, Arc::new(TypeCache::new()));
        Self::start(config, pool).await
    }

    /// Start a pool from a full protocol config (custom cache or hook).
    pub async fn start(config: ProtocolConfig<D>, pool: PoolConfig) -> Result<Self> {
        config.options.validate()?;
        let cache = config.cache.clone();
        let pool = Pool::connect(config, pool).await?;
        Ok(Self { pool, cache })
    }

    async fn acquire(&self) -> Result<Pooled<D>> {
        self.pool.acquire().await
    }

    /// Execute a statement and return its result.
    pub async fn query(&self, query: impl Into<Query>, params: &[Param]) -> Result<QueryResult> {
        let query = query.into();
        let mut conn = self.acquire().await?;
        conn.handle_execute(&query, params).await
    }

    /// Validate a query. Nothing is prepared server-side; the returned
    /// query can be executed on any pooled connection.
    pub async fn prepare(&self, query: impl Into<Query>) -> Result<Query> {
        let mut conn = self.acquire().await?;
        conn.handle_prepare(query.into())
    }

    /// Execute a query returned by [`prepare`](Self::prepare).
    pub async fn execute(&self, query: &Query, params: &[Param]) -> Result<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.handle_execute(query, params).await
    }

    /// Prepare and execute on the same connection.
    pub async fn prepare_execute(
        &self,
        query: impl Into<Query>,
        params: &[Param],
    ) -> Result<(Query, QueryResult)> {
        let mut conn = self.acquire().await?;
        let query = conn.handle_prepare(query.into())?;
        let result = conn.handle_execute(&query, params).await?;
        Ok((query, result))
    }

    /// Forget a named query.
    pub async fn close(&self, query: &Query) -> Result<()> {
        let mut conn = self.acquire().await?;
        conn.handle_close(query).await
    }

    /// Stream a query's rows in batches of at most `max_rows`.
    ///
    /// The stream keeps its connection checked out until dropped.
    pub async fn stream(
        &self,
        query: impl Into<Query>,
        params: &[Param],
        max_rows: usize,
    ) -> Result<RowStream<D>> {
        let mut conn = self.acquire().await?;
        let cursor = conn.handle_declare(&query.into(), params, max_rows).await?;
        Ok(RowStream {
            conn,
            cursor,
            done: false,
        })
    }

    /// Begin a transaction on a dedicated connection.
    pub async fn transaction(&self) -> Result<Transaction<D>> {
        let mut conn = self.acquire().await?;
        conn.handle_begin().await?;
        Ok(Transaction { conn: Some(conn) })
    }

    /// Round-trip to the warehouse.
    pub async fn ping(&self) -> Result<TransactionStatus> {
        let mut conn = self.acquire().await?;
        conn.ping().await
    }

    /// Column types of a table.
    pub async fn describe_table(&self, table: &str) -> Result<Vec<ColumnType>> {
        let mut conn = self.acquire().await?;
        conn.describe_table(table).await
    }

    /// The type cache shared by every pooled connection.
    pub fn cache(&self) -> &Arc<TypeCache> {
        &self.cache
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Close the pool. Outstanding streams and transactions finish first.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// Batches of a streamed query.
pub struct RowStream<D: BridgeDriver> {
    conn: Pooled<D>,
    cursor: Cursor,
    done: bool,
}

impl<D: BridgeDriver> RowStream<D> {
    /// The next batch, or `None` once the stream is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<QueryResult>> {
        if self.done {
            return Ok(None);
        }
        let (batch, marker) = self.conn.handle_fetch(&mut self.cursor).await?;
        if marker == Fetch::Done {
            self.done = true;
        }
        Ok(Some(batch))
    }

    /// Re-run the statement and start over from the first batch.
    pub async fn restart(&mut self) -> Result<QueryResult> {
        let (batch, marker) = self.conn.handle_first(&mut self.cursor).await?;
        self.done = marker == Fetch::Done;
        Ok(batch)
    }

    /// Drain the remaining batches into one result.
    pub async fn collect(mut self) -> Result<QueryResult> {
        let mut all = QueryResult::default();
        while let Some(batch) = self.next_batch().await? {
            if all.columns.is_empty() {
                all.columns = batch.columns;
                all.query_id = batch.query_id;
            }
            all.num_rows += batch.num_rows;
            all.num_warnings = all.num_warnings.max(batch.num_warnings);
            all.rows.extend(batch.rows);
        }
        Ok(all)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<D: BridgeDriver> Drop for RowStream<D> {
    fn drop(&mut self) {
        self.cursor.release();
    }
}

/// An open transaction on one pooled connection.
///
/// Dropping it without [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) returns the connection inside the
/// transaction, which disconnects it.
pub struct Transaction<D: BridgeDriver> {
    conn: Option<Pooled<D>>,
}

impl<D: BridgeDriver> Transaction<D> {
    fn conn(&mut self) -> Result<&mut Pooled<D>> {
        self.conn.as_mut().ok_or_else(crate::error::Error::disconnected)
    }

    pub async fn query(&mut self, query: impl Into<Query>, params: &[Param]) -> Result<QueryResult> {
        let query = query.into();
        self.conn()?.handle_execute(&query, params).await
    }

    pub async fn execute(&mut self, query: &Query, params: &[Param]) -> Result<QueryResult> {
        self.conn()?.handle_execute(query, params).await
    }

    pub async fn commit(mut self) -> Result<()> {
        self.conn()?.handle_commit().await?;
        self.conn.take();
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.conn()?.handle_rollback().await?;
        self.conn.take();
        Ok(())
    }
}

impl<D: BridgeDriver> Drop for Transaction<D> {
    fn drop(&mut self) {
        if self
            .conn
            .as_ref()
            .is_some_and(|c| c.handle_status() == Some(TransactionStatus::Transaction))
        {
            warn!("transaction dropped without commit or rollback; discarding connection");
        }
    }
}
