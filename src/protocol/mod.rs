//! Protocol (connection state machine)
//!
//! One `Protocol` owns one bridge handle and its transaction status:
//!
//! ```text
//! disconnected --connect--> idle <--begin/commit/rollback--> transaction
//!       ^                     |                                  |
//!       +------ disconnect / connection failure -----------------+
//! ```
//!
//! Methods are split across modules:
//! - `mod.rs` - the `Connection` contract, connect/reconnect, execute
//! - `transaction.rs` - begin, commit, rollback
//! - `cursor.rs` - declared cursors and batched fetch

mod cursor;
mod transaction;

pub use cursor::{Cursor, Fetch};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use self::cursor::{PendingSegment, Segment, decode_row};
use crate::bridge::{BridgeClient, BridgeDriver, BridgeResponse, QueryOptions, ResultSet};
use crate::config::ConnectionOptions;
use crate::error::{Error, ErrorCode, Result};
use crate::query::{Param, Query, QueryResult};
use crate::types::{
    CatalogRow, ColumnSource, ColumnType, Resolved, TypeCache, codec, parse_rows,
};

/// Transaction status of a connected protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Transaction,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Idle => write!(f, "idle"),
            TransactionStatus::Transaction => write!(f, "transaction"),
        }
    }
}

/// The pooled-connection contract.
///
/// A pool (or any single owner) drives one implementation through
/// connect, checkout/checkin, statement and transaction hooks. Calls on one
/// connection are never concurrent.
#[async_trait]
pub trait Connection: Sized + Send + 'static {
    /// Everything needed to (re)establish a connection.
    type Config: Clone + Send + Sync + 'static;

    async fn connect(config: &Self::Config) -> Result<Self>;

    /// Close the connection. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Tear down (ignoring failures) and connect again with the same config.
    async fn reconnect(&mut self) -> Result<()>;

    async fn checkout(&mut self) -> Result<()>;

    /// Return to the pool. Fails, closing the connection, when a
    /// transaction is still open.
    async fn checkin(&mut self) -> Result<()>;

    /// Round-trip to the warehouse. Fails while disconnected.
    async fn ping(&mut self) -> Result<TransactionStatus>;

    /// Current status, `None` while disconnected. No bridge call.
    fn handle_status(&self) -> Option<TransactionStatus>;

    async fn handle_begin(&mut self) -> Result<()>;
    async fn handle_commit(&mut self) -> Result<()>;
    async fn handle_rollback(&mut self) -> Result<()>;

    /// Validate a query. Nothing is prepared server-side.
    fn handle_prepare(&mut self, query: Query) -> Result<Query>;

    async fn handle_execute(&mut self, query: &Query, params: &[Param]) -> Result<QueryResult>;

    /// Forget a named query.
    async fn handle_close(&mut self, query: &Query) -> Result<()>;

    async fn handle_declare(
        &mut self,
        query: &Query,
        params: &[Param],
        max_rows: usize,
    ) -> Result<Cursor>;

    /// Next batch, starting the cursor if it has not run yet.
    async fn handle_fetch(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)>;

    /// Re-run the cursor's statement and return its first batch.
    async fn handle_first(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)>;

    /// Next batch of an already started cursor.
    async fn handle_next(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)>;

    /// Drop buffered results. The cursor may be restarted with `handle_first`.
    async fn handle_deallocate(&mut self, cursor: &mut Cursor) -> Result<()>;
}

/// Runs against the live handle after every successful connect.
#[async_trait]
pub trait AfterConnect<D: BridgeDriver>: Send + Sync {
    async fn after_connect(&self, client: &mut BridgeClient<D>) -> Result<()>;
}

/// Driver, options and shared cache a protocol is built from.
pub struct ProtocolConfig<D: BridgeDriver> {
    pub driver: D,
    pub options: ConnectionOptions,
    pub cache: Arc<TypeCache>,
    pub after_connect: Option<Arc<dyn AfterConnect<D>>>,
}

impl<D: BridgeDriver> ProtocolConfig<D> {
    pub fn new(driver: D, options: ConnectionOptions, cache: Arc<TypeCache>) -> Self {
        Self {
            driver,
            options,
            cache,
            after_connect: None,
        }
    }

    /// Install a post-connect hook.
    pub fn after_connect(mut self, hook: impl AfterConnect<D> + 'static) -> Self {
        self.after_connect = Some(Arc::new(hook));
        self
    }
}

impl<D: BridgeDriver> Clone for ProtocolConfig<D> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
            after_connect: self.after_connect.clone(),
        }
    }
}

impl<D: BridgeDriver> fmt::Debug for ProtocolConfig<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("options", &self.options)
            .field("after_connect", &self.after_connect.is_some())
            .finish()
    }
}

/// Live handle plus its transaction status.
struct Session<D: BridgeDriver> {
    client: BridgeClient<D>,
    status: TransactionStatus,
}

/// The connection state machine over a bridge driver.
pub struct Protocol<D: BridgeDriver> {
    config: ProtocolConfig<D>,
    session: Option<Session<D>>,
    /// Last statement text prepared or executed under each advisory name.
    named: HashMap<String, Query>,
}

impl<D: BridgeDriver> Protocol<D> {
    /// Connect using `config`. Failures are not retried.
    pub async fn connect(config: &ProtocolConfig<D>) -> Result<Self> {
        config.options.validate()?;
        let session = open_session(config).await?;
        Ok(Self {
            config: config.clone(),
            session: Some(session),
            named: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ProtocolConfig<D> {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> Option<TransactionStatus> {
        self.session.as_ref().map(|s| s.status)
    }

    fn session(&mut self) -> Result<&mut Session<D>> {
        self.session.as_mut().ok_or_else(Error::disconnected)
    }

    fn query_options(&self, with_query_id: bool) -> QueryOptions {
        QueryOptions {
            with_query_id,
            timeout: self.config.options.query_timeout(),
        }
    }

    /// Close the handle. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => {
                info!("disconnecting");
                session.client.disconnect().await.map_err(Error::from_bridge)
            }
            None => Ok(()),
        }
    }

    /// Drop the session after a connection-fatal error. Teardown errors
    /// are logged and swallowed.
    async fn lose_session(&mut self, cause: &Error) {
        if let Some(session) = self.session.take() {
            warn!("connection lost: {}", cause);
            if let Err(e) = session.client.disconnect().await {
                debug!("teardown after connection loss failed: {}", e);
            }
        }
    }

    /// Tear down the current handle (best-effort) and connect again with
    /// the same options.
    pub async fn reconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take()
            && let Err(e) = session.client.disconnect().await
        {
            warn!("ignoring teardown failure during reconnect: {}", e);
        }
        info!(
            "reconnecting to {}",
            self.config.options.connection_string_redacted()
        );
        self.session = Some(open_session(&self.config).await?);
        Ok(())
    }

    /// Issue one bridge call. A connection-fatal failure disconnects.
    async fn call(
        &mut self,
        statement: &str,
        params: &[crate::bridge::BridgeParam],
        with_query_id: bool,
    ) -> Result<BridgeResponse> {
        let opts = self.query_options(with_query_id);
        let session = self.session()?;
        match session.client.query(statement, params, &opts).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let err = Error::from_bridge(e);
                if err.is_connection_error() {
                    self.lose_session(&err).await;
                }
                Err(err)
            }
        }
    }

    /// Round-trip `SELECT 1`.
    pub async fn ping(&mut self) -> Result<TransactionStatus> {
        self.call("SELECT 1", &[], false).await?;
        self.session().map(|s| s.status)
    }

    /// Validate a query and remember its text under its name.
    pub fn prepare(&mut self, query: Query) -> Result<Query> {
        if query.statement.trim().is_empty() {
            return Err(Error::statement(
                "empty statement",
                ErrorCode::SyntaxErrorOrAccessRuleViolation,
            ));
        }
        self.remember(&query);
        Ok(query)
    }

    fn remember(&mut self, query: &Query) {
        if let Some(name) = &query.name {
            self.named.insert(name.clone(), query.clone());
        }
    }

    /// The query last prepared or executed under `name`.
    pub fn prepared(&self, name: &str) -> Option<&Query> {
        self.named.get(name)
    }

    /// Forget the query registered under this query's name.
    pub fn close(&mut self, query: &Query) -> Result<()> {
        self.session()?;
        if let Some(name) = &query.name {
            self.named.remove(name);
        }
        Ok(())
    }

    /// Execute a query.
    pub async fn execute(&mut self, query: &Query, params: &[Param]) -> Result<QueryResult> {
        let query = self.prepare(query.clone())?;
        let response = self.run(&query, params).await?;
        match response {
            BridgeResponse::Updated { rows, warnings } => Ok(QueryResult::affected(rows, warnings)),
            BridgeResponse::Selected(set) => self.materialize(&query.statement, set).await,
            BridgeResponse::Multiple(mut all) if all.len() == 1 => match all.pop() {
                Some(BridgeResponse::Selected(set)) => {
                    self.materialize(&query.statement, set).await
                }
                Some(BridgeResponse::Updated { rows, warnings }) => {
                    Ok(QueryResult::affected(rows, warnings))
                }
                _ => Err(Error::MultipleResults { count: 1 }),
            },
            BridgeResponse::Multiple(all) => Err(Error::MultipleResults { count: all.len() }),
        }
    }

    /// Execute whatever text was last registered under `name`.
    pub async fn execute_named(&mut self, name: &str, params: &[Param]) -> Result<QueryResult> {
        let query = self.named.get(name).cloned().ok_or_else(|| {
            Error::statement(
                format!("no statement prepared under name '{}'", name),
                ErrorCode::Other("26000".to_string()),
            )
        })?;
        self.execute(&query, params).await
    }

    /// Encode parameters and issue the statement.
    async fn run(&mut self, query: &Query, params: &[Param]) -> Result<BridgeResponse> {
        self.session()?;
        let encoded = params
            .iter()
            .map(|p| codec::encode(&p.value, p.declared.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.call(&query.statement, &encoded, returns_rows(&query.statement))
            .await
    }

    /// Resolve column types for `set` and decode every row.
    async fn materialize(&mut self, statement: &str, set: ResultSet) -> Result<QueryResult> {
        let types = self.column_types(statement, &set).await?;
        let rows = set
            .rows
            .iter()
            .map(|row| decode_row(row, &types))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult {
            num_rows: rows.len() as u64,
            columns: set.columns,
            rows,
            num_warnings: set.warnings,
            query_id: set.query_id,
        })
    }

    /// Column types for a live result, through the shared cache.
    async fn column_types(&mut self, statement: &str, set: &ResultSet) -> Result<Arc<[ColumnType]>> {
        let inferred = || -> Arc<[ColumnType]> {
            parse_rows(ColumnSource::Inferred {
                columns: &set.columns,
                rows: &set.rows,
            })
            .into()
        };

        // No catalog to ask and nothing to sample: do not freeze a guess.
        if set.query_id.is_none() && set.rows.is_empty() {
            return Ok(inferred());
        }

        let key = TypeCache::key_from_statement(statement);
        let cache = self.config.cache.clone();
        let session = self.session()?;
        let resolver = resolve_columns(&mut session.client, set);
        let resolved = cache.fetch_column_types(&key, move || resolver).await;

        let types = match resolved {
            Ok(types) => types,
            Err(err) => {
                if err.is_connection_error() {
                    self.lose_session(&err).await;
                }
                return Err(err);
            }
        };

        if types.len() != set.columns.len() {
            warn!(
                cached = types.len(),
                live = set.columns.len(),
                "cached column types do not match result, inferring for '{}'",
                key
            );
            return Ok(inferred());
        }
        Ok(types)
    }

    /// Column types of a table, from `DESCRIBE TABLE`.
    pub async fn describe_table(&mut self, table: &str) -> Result<Vec<ColumnType>> {
        let session = self.session()?;
        let described = match session.client.describe(table).await {
            Ok(set) => set,
            Err(e) => {
                let err = Error::from_bridge(e);
                if err.is_connection_error() {
                    self.lose_session(&err).await;
                }
                return Err(err);
            }
        };
        let rows = CatalogRow::from_result_set(&described)?;
        Ok(parse_rows(ColumnSource::Catalog(&rows)))
    }

    /// Declare a cursor. Nothing runs until the first fetch.
    pub fn declare(&mut self, query: &Query, params: &[Param], max_rows: usize) -> Result<Cursor> {
        self.session()?;
        let query = self.prepare(query.clone())?;
        Ok(Cursor::new(query, params.to_vec(), max_rows))
    }

    /// Run the cursor's statement from the beginning and return the first batch.
    pub async fn fetch_first(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)> {
        cursor.release();
        let query = cursor.query.clone();
        let response = self.run(&query, &cursor.params).await?;

        let mut segments = Vec::new();
        for (idx, pending) in PendingSegment::flatten(response).into_iter().enumerate() {
            segments.push(match pending {
                PendingSegment::Updated { rows, warnings } => Segment::Updated { rows, warnings },
                // Only the first result set shares the statement's cache entry.
                PendingSegment::Rows(set) if idx == 0 => {
                    let types = self.column_types(&query.statement, &set).await?;
                    Segment::Rows { set, types }
                }
                PendingSegment::Rows(set) => {
                    let types = parse_rows(ColumnSource::Inferred {
                        columns: &set.columns,
                        rows: &set.rows,
                    })
                    .into();
                    Segment::Rows { set, types }
                }
            });
        }
        cursor.open(segments);
        cursor.next_batch()
    }

    /// Next batch of a started cursor.
    pub fn fetch_next(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)> {
        self.session()?;
        if !cursor.is_open() && !cursor.is_exhausted() {
            return Err(Error::statement(
                "cursor is not open; fetch the first batch",
                ErrorCode::Other("24000".to_string()),
            ));
        }
        cursor.next_batch()
    }
}

impl<D: BridgeDriver> fmt::Debug for Protocol<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("status", &self.status())
            .field("named", &self.named.len())
            .finish()
    }
}

/// Connect, run post-connect statements and the hook.
async fn open_session<D: BridgeDriver>(config: &ProtocolConfig<D>) -> Result<Session<D>> {
    let connection_string = config.options.connection_string();
    let mut client = BridgeClient::connect(config.driver.clone(), &connection_string)
        .await
        .map_err(|e| {
            let code = e
                .sqlstate
                .as_deref()
                .map(ErrorCode::from_sqlstate)
                .unwrap_or(ErrorCode::UnableToConnect);
            Error::connection(e.message, code)
        })?;

    if let Err(err) = after_connect(config, &mut client).await {
        if let Err(e) = client.disconnect().await {
            debug!("teardown after failed post-connect step: {}", e);
        }
        return Err(match err {
            Error::Statement { message, code } => Error::connection(
                format!("post-connect statement failed: {}", message),
                code,
            ),
            other => other,
        });
    }

    info!(
        "connected to {}",
        config.options.connection_string_redacted()
    );
    Ok(Session {
        client,
        status: TransactionStatus::Idle,
    })
}

async fn after_connect<D: BridgeDriver>(
    config: &ProtocolConfig<D>,
    client: &mut BridgeClient<D>,
) -> Result<()> {
    let opts = QueryOptions {
        with_query_id: false,
        timeout: config.options.query_timeout(),
    };
    for statement in &config.options.after_connect {
        client.query(statement, &[], &opts).await?;
    }
    if let Some(hook) = &config.after_connect {
        hook.after_connect(client).await?;
    }
    Ok(())
}

/// Ask the catalog for a result's column types, falling back to inference.
///
/// Only a lost connection is an error here. Types inferred because the
/// catalog lookup failed are transient and never cached.
async fn resolve_columns<D: BridgeDriver>(
    client: &mut BridgeClient<D>,
    set: &ResultSet,
) -> Result<Resolved> {
    let inferred = || {
        parse_rows(ColumnSource::Inferred {
            columns: &set.columns,
            rows: &set.rows,
        })
    };
    let Some(query_id) = &set.query_id else {
        return Ok(Resolved::Durable(inferred()));
    };

    match client.describe_result(query_id).await {
        Ok(described) => match CatalogRow::from_result_set(&described) {
            Ok(rows) if rows.len() == set.columns.len() => {
                return Ok(Resolved::Durable(parse_rows(ColumnSource::Catalog(&rows))));
            }
            Ok(rows) => warn!(
                catalog = rows.len(),
                live = set.columns.len(),
                "catalog column count mismatch, inferring types"
            ),
            Err(e) => warn!("unreadable catalog rows, inferring types: {}", e),
        },
        Err(e) => {
            let err = Error::from_bridge(e);
            if err.is_connection_error() {
                return Err(err);
            }
            warn!("catalog lookup failed, inferring types: {}", err);
        }
    }
    Ok(Resolved::Transient(inferred()))
}

/// Whether a statement is expected to produce rows, judged by its leading
/// keyword after comments and parentheses.
pub(crate) fn returns_rows(statement: &str) -> bool {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            break;
        }
    }
    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "LIST" | "LS" | "VALUES"
            | "CALL"
    )
}

#[async_trait]
impl<D: BridgeDriver> Connection for Protocol<D> {
    type Config = ProtocolConfig<D>;

    async fn connect(config: &ProtocolConfig<D>) -> Result<Self> {
        Protocol::connect(config).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        Protocol::disconnect(self).await
    }

    async fn reconnect(&mut self) -> Result<()> {
        Protocol::reconnect(self).await
    }

    async fn checkout(&mut self) -> Result<()> {
        self.session()?;
        Ok(())
    }

    async fn checkin(&mut self) -> Result<()> {
        let status = self.session()?.status;
        if status == TransactionStatus::Transaction {
            let err = Error::connection(
                "connection returned to the pool inside a transaction",
                ErrorCode::InvalidTransactionState,
            );
            self.lose_session(&err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<TransactionStatus> {
        Protocol::ping(self).await
    }

    fn handle_status(&self) -> Option<TransactionStatus> {
        self.status()
    }

    async fn handle_begin(&mut self) -> Result<()> {
        self.begin().await
    }

    async fn handle_commit(&mut self) -> Result<()> {
        self.commit().await
    }

    async fn handle_rollback(&mut self) -> Result<()> {
        self.rollback().await
    }

    fn handle_prepare(&mut self, query: Query) -> Result<Query> {
        self.prepare(query)
    }

    async fn handle_execute(&mut self, query: &Query, params: &[Param]) -> Result<QueryResult> {
        self.execute(query, params).await
    }

    async fn handle_close(&mut self, query: &Query) -> Result<()> {
        self.close(query)
    }

    async fn handle_declare(
        &mut self,
        query: &Query,
        params: &[Param],
        max_rows: usize,
    ) -> Result<Cursor> {
        self.declare(query, params, max_rows)
    }

    async fn handle_fetch(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)> {
        if cursor.is_open() || cursor.is_exhausted() {
            self.fetch_next(cursor)
        } else {
            self.fetch_first(cursor).await
        }
    }

    async fn handle_first(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)> {
        self.fetch_first(cursor).await
    }

    async fn handle_next(&mut self, cursor: &mut Cursor) -> Result<(QueryResult, Fetch)> {
        self.fetch_next(cursor)
    }

    async fn handle_deallocate(&mut self, cursor: &mut Cursor) -> Result<()> {
        self.session()?;
        cursor.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 2 * 3"));
        assert!(returns_rows("  -- totals\n  with t as (select 1) select * from t"));
        assert!(returns_rows("/* hint */ (SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("show warnings"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
        assert!(!returns_rows("BEGIN"));
        assert!(!returns_rows(""));
    }
}
