//! In-memory bridge driver for tests and offline use.
//!
//! `ScriptedBridge` answers statements from a script instead of a
//! warehouse. It understands transaction statements and `SELECT 1` out of
//! the box, hands out query ids for row-returning calls, answers
//! `DESCRIBE RESULT` from registered catalog rows, and can sever live
//! handles to simulate a dropped link.
//!
//! ```rust,ignore
//! let bridge = ScriptedBridge::new()
//!     .respond("SELECT 2 * 3", BridgeResponse::selected(&["2 * 3"], vec![vec![BridgeValue::Int(6)]]))
//!     .with_catalog("SELECT 2 * 3", vec![CatalogRow::new("2 * 3", "NUMBER(3,0)")]);
//! let mut conn = Protocol::connect(&ProtocolConfig::new(bridge.clone(), options, cache)).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::bridge::{
    BridgeDriver, BridgeError, BridgeParam, BridgeResponse, BridgeResult, BridgeValue,
    QueryOptions, ResultSet,
};
use crate::types::{CatalogRow, TypeCache};

type ResponderFn = dyn Fn(&[BridgeParam]) -> BridgeResult<BridgeResponse> + Send + Sync;

#[derive(Clone)]
enum Responder {
    Fixed(BridgeResponse),
    Dynamic(Arc<ResponderFn>),
}

/// One recorded `param_query` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub handle: u64,
    pub statement: String,
    pub params: Vec<BridgeParam>,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, Responder>,
    failures: HashMap<String, BridgeError>,
    catalogs: HashMap<String, Vec<CatalogRow>>,
    tables: HashMap<String, Vec<CatalogRow>>,
    query_ids: HashMap<String, String>,
    next_query_id: u64,
    next_handle: u64,
    open: HashSet<u64>,
    severed: HashSet<u64>,
    refuse: Option<BridgeError>,
    connects: usize,
    calls: Vec<Call>,
}

/// Scripted [`BridgeDriver`]. Clones share one script.
#[derive(Clone, Default)]
pub struct ScriptedBridge {
    script: Arc<Mutex<Script>>,
}

/// Handle issued by [`ScriptedBridge`].
#[derive(Debug)]
pub struct ScriptedHandle {
    id: u64,
}

impl ScriptedHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `statement` with a fixed response.
    pub fn respond(self, statement: &str, response: BridgeResponse) -> Self {
        self.script()
            .responses
            .insert(key(statement), Responder::Fixed(response));
        self
    }

    /// Answer `statement` by calling `f` with the bound parameters.
    pub fn respond_with<F>(self, statement: &str, f: F) -> Self
    where
        F: Fn(&[BridgeParam]) -> BridgeResult<BridgeResponse> + Send + Sync + 'static,
    {
        self.script()
            .responses
            .insert(key(statement), Responder::Dynamic(Arc::new(f)));
        self
    }

    /// Fail every call of `statement` with `error`.
    pub fn fail(self, statement: &str, error: BridgeError) -> Self {
        self.script().failures.insert(key(statement), error);
        self
    }

    /// Register catalog rows served by `DESCRIBE RESULT` for `statement`.
    pub fn with_catalog(self, statement: &str, rows: Vec<CatalogRow>) -> Self {
        self.script().catalogs.insert(key(statement), rows);
        self
    }

    /// Register catalog rows served by `DESCRIBE TABLE <table>`.
    pub fn with_table(self, table: &str, rows: Vec<CatalogRow>) -> Self {
        self.script().tables.insert(table.to_ascii_uppercase(), rows);
        self
    }

    /// Sever every open handle. New connections still succeed.
    pub fn sever(&self) {
        let mut script = self.script();
        let open: Vec<u64> = script.open.iter().copied().collect();
        script.severed.extend(open);
    }

    /// Refuse new connections with `error` until [`accept_connections`](Self::accept_connections).
    pub fn refuse_connections(&self, error: BridgeError) {
        self.script().refuse = Some(error);
    }

    pub fn accept_connections(&self) {
        self.script().refuse = None;
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.script().connects
    }

    /// Handles currently open and not severed.
    pub fn live_handles(&self) -> usize {
        let script = self.script();
        script.open.difference(&script.severed).count()
    }

    /// Every call issued so far.
    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    /// Statements issued so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.script().calls.iter().map(|c| c.statement.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }
}

#[async_trait]
impl BridgeDriver for ScriptedBridge {
    type Handle = ScriptedHandle;

    async fn connect(&self, _connection_string: &str) -> BridgeResult<ScriptedHandle> {
        let mut script = self.script();
        if let Some(err) = &script.refuse {
            return Err(err.clone());
        }
        script.next_handle += 1;
        let id = script.next_handle;
        script.open.insert(id);
        script.connects += 1;
        Ok(ScriptedHandle { id })
    }

    async fn param_query(
        &self,
        handle: &mut ScriptedHandle,
        statement: &str,
        params: &[BridgeParam],
        opts: &QueryOptions,
    ) -> BridgeResult<BridgeResponse> {
        let mut script = self.script();
        script.calls.push(Call {
            handle: handle.id,
            statement: statement.to_string(),
            params: params.to_vec(),
        });

        if !script.open.contains(&handle.id) {
            return Err(BridgeError::connection_closed());
        }
        if script.severed.contains(&handle.id) {
            return Err(BridgeError::new("Communication link failure").with_sqlstate("08S01"));
        }

        let stmt_key = key(statement);
        if let Some(err) = script.failures.get(&stmt_key) {
            return Err(err.clone());
        }
        if let Some(id) = describe_result_id(&stmt_key) {
            return describe_result(&script, id);
        }
        if let Some(table) = stmt_key.strip_prefix("DESCRIBE TABLE ") {
            return match script.tables.get(&table.to_ascii_uppercase()) {
                Some(rows) => Ok(catalog_response(rows)),
                None => Err(not_found(&format!("Table '{}' does not exist", table))),
            };
        }

        let response = match script.responses.get(&stmt_key).cloned() {
            Some(Responder::Fixed(response)) => response,
            Some(Responder::Dynamic(f)) => f(params)?,
            None => builtin(&stmt_key)?,
        };

        if opts.with_query_id {
            return Ok(tag_query_ids(&mut script, &stmt_key, response));
        }
        Ok(response)
    }

    async fn disconnect(&self, handle: ScriptedHandle) -> BridgeResult<()> {
        let mut script = self.script();
        script.open.remove(&handle.id);
        if script.severed.remove(&handle.id) {
            return Err(BridgeError::connection_closed());
        }
        Ok(())
    }
}

fn key(statement: &str) -> String {
    TypeCache::key_from_statement(statement)
}

fn builtin(statement: &str) -> BridgeResult<BridgeResponse> {
    let upper = statement.to_ascii_uppercase();
    match upper.as_str() {
        "BEGIN" | "BEGIN TRANSACTION" | "START TRANSACTION" | "COMMIT" | "ROLLBACK" => {
            Ok(BridgeResponse::updated(0))
        }
        "SELECT 1" => Ok(BridgeResponse::selected(&["1"], vec![vec![BridgeValue::Int(1)]])),
        s if s.starts_with("ALTER SESSION ") || s.starts_with("USE ") => {
            Ok(BridgeResponse::updated(0))
        }
        _ => Err(BridgeError::new(format!(
            "SQL compilation error: no scripted response for '{}'",
            statement
        ))
        .with_sqlstate("42000")),
    }
}

fn tag_query_ids(script: &mut Script, statement: &str, response: BridgeResponse) -> BridgeResponse {
    match response {
        BridgeResponse::Selected(mut set) => {
            script.next_query_id += 1;
            let id = format!("01b0c0de-0000-4000-8000-{:012}", script.next_query_id);
            script.query_ids.insert(id.clone(), statement.to_string());
            set.query_id = Some(id);
            BridgeResponse::Selected(set)
        }
        BridgeResponse::Multiple(all) => BridgeResponse::Multiple(
            all.into_iter()
                .map(|r| tag_query_ids(script, statement, r))
                .collect(),
        ),
        updated => updated,
    }
}

fn describe_result_id(statement: &str) -> Option<&str> {
    statement
        .strip_prefix("DESCRIBE RESULT '")?
        .strip_suffix('\'')
}

fn describe_result(script: &Script, id: &str) -> BridgeResult<BridgeResponse> {
    let rows = script
        .query_ids
        .get(id)
        .and_then(|statement| script.catalogs.get(statement))
        .ok_or_else(|| not_found(&format!("Statement {} not found", id)))?;
    Ok(catalog_response(rows))
}

fn catalog_response(rows: &[CatalogRow]) -> BridgeResponse {
    BridgeResponse::Selected(ResultSet {
        columns: vec!["name".into(), "type".into(), "kind".into(), "null?".into()],
        rows: rows
            .iter()
            .map(|row| {
                vec![
                    BridgeValue::text(row.name.clone()),
                    BridgeValue::text(row.data_type.clone()),
                    BridgeValue::text("COLUMN"),
                    BridgeValue::text("Y"),
                ]
            })
            .collect(),
        ..Default::default()
    })
}

fn not_found(message: &str) -> BridgeError {
    BridgeError::new(message).with_sqlstate("02000")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_and_severed() {
        let bridge = ScriptedBridge::new();
        let mut handle = bridge.connect("DSN=test").await.unwrap();
        let opts = QueryOptions::default();

        let response = bridge.param_query(&mut handle, "SELECT 1", &[], &opts).await.unwrap();
        assert_eq!(
            response,
            BridgeResponse::selected(&["1"], vec![vec![BridgeValue::Int(1)]])
        );

        bridge.sever();
        let err = bridge
            .param_query(&mut handle, "SELECT 1", &[], &opts)
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("08S01"));
        assert!(bridge.disconnect(handle).await.is_err());
        assert_eq!(bridge.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_query_ids_feed_describe_result() {
        let bridge = ScriptedBridge::new()
            .respond("SELECT id FROM t", BridgeResponse::selected(&["ID"], vec![]))
            .with_catalog("SELECT id FROM t", vec![CatalogRow::new("ID", "NUMBER(38,0)")]);
        let mut handle = bridge.connect("DSN=test").await.unwrap();
        let opts = QueryOptions {
            with_query_id: true,
            ..Default::default()
        };

        let BridgeResponse::Selected(set) = bridge
            .param_query(&mut handle, "SELECT  id FROM t;", &[], &opts)
            .await
            .unwrap()
        else {
            panic!("expected rows");
        };
        let id = set.query_id.unwrap();

        let describe = format!("DESCRIBE RESULT '{}'", id);
        let BridgeResponse::Selected(catalog) = bridge
            .param_query(&mut handle, &describe, &[], &QueryOptions::default())
            .await
            .unwrap()
        else {
            panic!("expected catalog rows");
        };
        assert_eq!(catalog.rows.len(), 1);
        assert_eq!(catalog.rows[0][1], BridgeValue::text("NUMBER(38,0)"));
    }
}
