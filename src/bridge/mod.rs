//! Bridge client (Layer 1: synchronous request/reply)
//!
//! Thin facade over a generic SQL bridge driver. The driver owns the wire
//! protocol to the warehouse; this layer only sequences calls and carries
//! driver-native values in and out.
//!
//! - `BridgeDriver` - the outbound contract (connect, param_query, disconnect)
//! - `BridgeClient` - one live handle plus the calls the protocol issues on it
//! - `any.rs` - a driver backed by `sqlx::AnyConnection`

pub mod any;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

pub use self::any::SqlxBridge;

/// Driver-native cell or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeValue {
    Null,
    Int(i64),
    Float(f64),
    Bit(bool),
    /// Character data as sent/received on the wire (expected UTF-8).
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl BridgeValue {
    pub fn text(s: impl Into<String>) -> Self {
        BridgeValue::Text(s.into().into_bytes())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BridgeValue::Null)
    }
}

/// Parameter type tags understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bigint,
    Double,
    Decimal { precision: u32, scale: u32 },
    Bit,
    Char(u32),
    Varchar(u32),
    Binary(u32),
    Date,
    Time,
    Timestamp,
}

/// An encoded parameter: bridge type tag plus value.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeParam {
    pub sql_type: SqlType,
    pub value: BridgeValue,
}

/// Rows returned by a row-producing statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<BridgeValue>>,
    /// Warehouse query id, when requested via [`QueryOptions::with_query_id`].
    pub query_id: Option<String>,
    pub warnings: u32,
}

/// Outcome of a parametrized call.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeResponse {
    /// Row-affecting statement.
    Updated { rows: u64, warnings: u32 },
    /// Row-returning statement.
    Selected(ResultSet),
    /// Several results (procedures, multi-statement text).
    Multiple(Vec<BridgeResponse>),
}

impl BridgeResponse {
    pub fn updated(rows: u64) -> Self {
        BridgeResponse::Updated { rows, warnings: 0 }
    }

    pub fn selected(columns: &[&str], rows: Vec<Vec<BridgeValue>>) -> Self {
        BridgeResponse::Selected(ResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            query_id: None,
            warnings: 0,
        })
    }
}

/// Per-call options forwarded to the driver.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Ask the driver to report the warehouse query id alongside the rows.
    pub with_query_id: bool,
    /// Driver-side timeout. The protocol never interrupts a call itself.
    pub timeout: Option<Duration>,
}

/// Error reported by the driver: message plus SQLSTATE when known.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeError {
    pub message: String,
    pub sqlstate: Option<String>,
    pub native_code: Option<i32>,
}

impl BridgeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            native_code: None,
        }
    }

    pub fn with_sqlstate(mut self, state: impl Into<String>) -> Self {
        self.sqlstate = Some(state.into());
        self
    }

    pub fn with_native_code(mut self, code: i32) -> Self {
        self.native_code = Some(code);
        self
    }

    /// The handle is gone (closed or severed).
    pub fn connection_closed() -> Self {
        Self::new("connection closed").with_sqlstate("08003")
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "[{}] {}", state, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Result type for bridge calls.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// The outbound contract a bridge driver satisfies.
///
/// Calls on one handle are issued strictly in order, one at a time.
#[async_trait]
pub trait BridgeDriver: Clone + Send + Sync + 'static {
    /// Opaque live connection.
    type Handle: Send + 'static;

    async fn connect(&self, connection_string: &str) -> BridgeResult<Self::Handle>;

    async fn param_query(
        &self,
        handle: &mut Self::Handle,
        statement: &str,
        params: &[BridgeParam],
        opts: &QueryOptions,
    ) -> BridgeResult<BridgeResponse>;

    async fn disconnect(&self, handle: Self::Handle) -> BridgeResult<()>;
}

/// A live bridge handle and the driver that owns it.
pub struct BridgeClient<D: BridgeDriver> {
    driver: D,
    handle: D::Handle,
}

impl<D: BridgeDriver> BridgeClient<D> {
    /// Open a handle using an ODBC-style connection string.
    pub async fn connect(driver: D, connection_string: &str) -> BridgeResult<Self> {
        let handle = driver.connect(connection_string).await?;
        Ok(Self { driver, handle })
    }

    /// Send a parametrized statement.
    pub async fn query(
        &mut self,
        statement: &str,
        params: &[BridgeParam],
        opts: &QueryOptions,
    ) -> BridgeResult<BridgeResponse> {
        debug!(
            params = params.len(),
            with_query_id = opts.with_query_id,
            "bridge query: {}",
            statement
        );
        self.driver
            .param_query(&mut self.handle, statement, params, opts)
            .await
    }

    /// Describe the result of an earlier query by its warehouse query id.
    pub async fn describe_result(&mut self, query_id: &str) -> BridgeResult<ResultSet> {
        if query_id.is_empty()
            || !query_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BridgeError::new(format!("invalid query id: {}", query_id)).with_sqlstate("HY000"));
        }
        let statement = format!("DESCRIBE RESULT '{}'", query_id);
        expect_rows(self.query(&statement, &[], &QueryOptions::default()).await?)
    }

    /// Describe a table's columns.
    pub async fn describe(&mut self, table: &str) -> BridgeResult<ResultSet> {
        let statement = format!("DESCRIBE TABLE {}", check_identifier(table)?);
        expect_rows(self.query(&statement, &[], &QueryOptions::default()).await?)
    }

    /// Close the handle.
    pub async fn disconnect(self) -> BridgeResult<()> {
        self.driver.disconnect(self.handle).await
    }
}

fn expect_rows(response: BridgeResponse) -> BridgeResult<ResultSet> {
    match response {
        BridgeResponse::Selected(set) => Ok(set),
        BridgeResponse::Updated { .. } => Err(BridgeError::new("describe returned no rows")),
        BridgeResponse::Multiple(mut all) => match all.pop() {
            Some(last) => expect_rows(last),
            None => Err(BridgeError::new("describe returned no rows")),
        },
    }
}

/// Validate a possibly qualified table name before it is spliced into SQL.
///
/// Each part is either a plain identifier or a double-quoted one.
pub fn check_identifier(name: &str) -> BridgeResult<String> {
    let invalid = || BridgeError::new(format!("invalid identifier: {}", name)).with_sqlstate("42000");
    let mut quoted = Vec::new();
    for part in name.split('.') {
        let part = part.trim();
        if part.len() >= 2 && part.starts_with('"') && part.ends_with('"') {
            let inner = &part[1..part.len() - 1];
            if inner.contains('"') {
                return Err(invalid());
            }
            quoted.push(part.to_string());
        } else if !part.is_empty()
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            quoted.push(part.to_string());
        } else {
            return Err(invalid());
        }
    }
    Ok(quoted.join("."))
}
