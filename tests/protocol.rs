//! Protocol tests against the scripted bridge.
//!
//! Run: `cargo test --test protocol`

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use snowbridge::bridge::{
    BridgeClient, BridgeError, BridgeResponse, BridgeValue, QueryOptions, SqlType,
};
use snowbridge::prelude::*;
use snowbridge::testing::ScriptedBridge;
use snowbridge::types::CatalogRow;

fn options() -> ConnectionOptions {
    ConnectionOptions::builder()
        .dsn("snowflake")
        .warehouse("COMPUTE_WH")
        .build()
        .unwrap()
}

async fn connect(bridge: &ScriptedBridge) -> Result<Protocol<ScriptedBridge>> {
    let config = ProtocolConfig::new(bridge.clone(), options(), Arc::new(TypeCache::new()));
    Protocol::connect(&config).await
}

fn six_bridge() -> ScriptedBridge {
    ScriptedBridge::new()
        .respond(
            "SELECT 2 * 3",
            BridgeResponse::selected(&["2 * 3"], vec![vec![BridgeValue::Int(6)]]),
        )
        .with_catalog("SELECT 2 * 3", vec![CatalogRow::new("2 * 3", "NUMBER(3,0)")])
}

fn describe_calls(bridge: &ScriptedBridge) -> usize {
    bridge
        .statements()
        .iter()
        .filter(|s| s.starts_with("DESCRIBE RESULT"))
        .count()
}

/// `SELECT 2 * 3` yields one column, one row, `[[6]]`.
#[tokio::test]
async fn test_select_two_times_three() -> Result<()> {
    let bridge = six_bridge();
    let mut conn = connect(&bridge).await?;

    let result = conn.handle_execute(&Query::new("SELECT 2 * 3"), &[]).await?;

    assert_eq!(result.columns, vec!["2 * 3".to_string()]);
    assert_eq!(result.num_rows, 1);
    assert_eq!(result.rows, vec![vec![Value::Int(6)]]);
    assert!(result.query_id.is_some());
    Ok(())
}

/// The second execution of a statement shape reuses cached column types.
#[tokio::test]
async fn test_column_types_resolved_once_per_statement() -> Result<()> {
    let bridge = six_bridge();
    let mut conn = connect(&bridge).await?;

    conn.execute(&Query::new("SELECT 2 * 3"), &[]).await?;
    conn.execute(&Query::new("SELECT 2 *   3;"), &[]).await?;
    let result = conn.execute(&Query::new("SELECT 2 * 3"), &[]).await?;

    assert_eq!(result.rows, vec![vec![Value::Int(6)]]);
    assert_eq!(describe_calls(&bridge), 1);
    let stats = conn.config().cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    Ok(())
}

/// A shared cache serves every connection built from the same config.
#[tokio::test]
async fn test_cache_shared_across_connections() -> Result<()> {
    let bridge = six_bridge();
    let config = ProtocolConfig::new(bridge.clone(), options(), Arc::new(TypeCache::new()));
    let mut first = Protocol::connect(&config).await?;
    let mut second = Protocol::connect(&config).await?;

    first.execute(&Query::new("SELECT 2 * 3"), &[]).await?;
    second.execute(&Query::new("SELECT 2 * 3"), &[]).await?;

    assert_eq!(describe_calls(&bridge), 1);
    Ok(())
}

#[tokio::test]
async fn test_zero_rows_is_not_an_error() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "SELECT id FROM orders WHERE false",
        BridgeResponse::selected(&["ID"], vec![]),
    );
    let mut conn = connect(&bridge).await?;

    let result = conn
        .execute(&Query::new("SELECT id FROM orders WHERE false"), &[])
        .await?;

    assert_eq!(result.columns, vec!["ID".to_string()]);
    assert_eq!(result.num_rows, 0);
    assert!(result.rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_update_returns_affected_rows() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "UPDATE orders SET paid = TRUE",
        BridgeResponse::Updated {
            rows: 7,
            warnings: 1,
        },
    );
    let mut conn = connect(&bridge).await?;

    let result = conn
        .execute(&Query::new("UPDATE orders SET paid = TRUE"), &[])
        .await?;

    assert!(result.columns.is_empty());
    assert_eq!(result.num_rows, 7);
    assert_eq!(result.num_warnings, 1);
    assert_eq!(describe_calls(&bridge), 0);
    Ok(())
}

/// A fixed-point parameter travels as exact text and comes back with its scale.
#[tokio::test]
async fn test_decimal_parameter_round_trip() -> Result<()> {
    let bridge = ScriptedBridge::new()
        .respond_with("SELECT ? AS amount", |params| {
            Ok(BridgeResponse::selected(
                &["AMOUNT"],
                vec![vec![params[0].value.clone()]],
            ))
        })
        .with_catalog(
            "SELECT ? AS amount",
            vec![CatalogRow::new("AMOUNT", "NUMBER(10,2)")],
        );
    let mut conn = connect(&bridge).await?;

    let amount = Decimal::from_str("42.00").unwrap();
    let param = Param::typed(
        amount,
        TypeKind::Decimal {
            precision: 10,
            scale: 2,
        },
    );
    let result = conn
        .execute(&Query::new("SELECT ? AS amount"), &[param])
        .await?;

    let calls = bridge.calls();
    assert_eq!(
        calls[0].params[0].sql_type,
        SqlType::Decimal {
            precision: 10,
            scale: 2
        }
    );
    assert_eq!(calls[0].params[0].value, BridgeValue::text("42.00"));
    match &result.rows[0][0] {
        Value::Decimal(d) => assert_eq!(d.to_string(), "42.00"),
        other => panic!("expected a decimal, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_severed_handle_until_reconnect() -> Result<()> {
    let bridge = six_bridge();
    let mut conn = connect(&bridge).await?;

    bridge.sever();
    let err = conn
        .execute(&Query::new("SELECT 2 * 3"), &[])
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(conn.handle_status(), None);

    assert!(conn.ping().await.unwrap_err().is_connection_error());
    assert!(conn.ping().await.is_err());

    conn.reconnect().await?;
    assert_eq!(conn.ping().await?, TransactionStatus::Idle);
    assert_eq!(bridge.connects(), 2);
    Ok(())
}

#[tokio::test]
async fn test_disconnected_operations() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let mut conn = connect(&bridge).await?;
    conn.disconnect().await?;
    conn.disconnect().await?;

    assert_eq!(conn.handle_status(), None);
    assert!(conn.handle_prepare(Query::new("SELECT 1")).is_ok());
    let query = Query::new("SELECT 1");
    assert!(conn.handle_execute(&query, &[]).await.unwrap_err().is_connection_error());
    assert!(conn.handle_begin().await.unwrap_err().is_connection_error());
    assert!(conn.handle_close(&query).await.unwrap_err().is_connection_error());
    assert!(conn.handle_declare(&query, &[], 10).await.unwrap_err().is_connection_error());
    assert!(conn.checkout().await.unwrap_err().is_connection_error());
    assert_eq!(bridge.live_handles(), 0);
    Ok(())
}

/// Two queries sharing a name: the last prepared text is what the name runs.
#[tokio::test]
async fn test_query_name_is_advisory() -> Result<()> {
    let bridge = six_bridge();
    let mut conn = connect(&bridge).await?;

    let first = conn.handle_prepare(Query::named("totals", "SELECT 1"))?;
    conn.execute_named("totals", &[]).await?;
    let second = Query::named("totals", "SELECT 2 * 3");
    conn.execute(&second, &[]).await?;

    let result = conn.execute_named("totals", &[]).await?;
    assert_eq!(result.rows, vec![vec![Value::Int(6)]]);
    assert_eq!(conn.prepared("totals"), Some(&second));
    assert_ne!(conn.prepared("totals"), Some(&first));

    let statements: Vec<String> = bridge
        .statements()
        .into_iter()
        .filter(|s| !s.starts_with("DESCRIBE"))
        .collect();
    assert_eq!(statements, vec!["SELECT 1", "SELECT 2 * 3", "SELECT 2 * 3"]);

    conn.handle_close(&second).await?;
    let err = conn.execute_named("totals", &[]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Other("26000".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_empty_statement_rejected() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let mut conn = connect(&bridge).await?;

    let err = conn.handle_prepare(Query::new("   ")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SyntaxErrorOrAccessRuleViolation);
    assert!(bridge.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_statement_error_keeps_connection() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let mut conn = connect(&bridge).await?;
    conn.begin().await?;

    let err = conn
        .execute(&Query::new("SELEC oops"), &[])
        .await
        .unwrap_err();

    assert!(!err.is_connection_error());
    assert_eq!(err.code(), ErrorCode::SyntaxErrorOrAccessRuleViolation);
    assert_eq!(conn.handle_status(), Some(TransactionStatus::Transaction));
    Ok(())
}

#[tokio::test]
async fn test_invalid_utf8_is_a_decode_error() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "SELECT name FROM users",
        BridgeResponse::selected(&["NAME"], vec![vec![BridgeValue::Text(vec![0x66, 0xff])]]),
    );
    let mut conn = connect(&bridge).await?;

    let err = conn
        .execute(&Query::new("SELECT name FROM users"), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Decode { .. }));
    assert!(conn.is_connected());
    Ok(())
}

/// A cached entry whose arity no longer matches is bypassed, not replaced.
#[tokio::test]
async fn test_arity_mismatch_falls_back_to_inference() -> Result<()> {
    let bridge = ScriptedBridge::new()
        .respond(
            "SELECT * FROM events",
            BridgeResponse::selected(&["ID"], vec![vec![BridgeValue::Int(1)]]),
        )
        .with_catalog("SELECT * FROM events", vec![CatalogRow::new("ID", "NUMBER(38,0)")]);
    let mut conn = connect(&bridge).await?;
    conn.execute(&Query::new("SELECT * FROM events"), &[]).await?;

    // The table gained a column.
    let bridge = bridge.respond(
        "SELECT * FROM events",
        BridgeResponse::selected(
            &["ID", "KIND"],
            vec![vec![BridgeValue::Int(1), BridgeValue::text("click")]],
        ),
    );
    let result = conn.execute(&Query::new("SELECT * FROM events"), &[]).await?;

    assert_eq!(
        result.rows,
        vec![vec![Value::Int(1), Value::Text("click".to_string())]]
    );
    let cached = conn
        .config()
        .cache
        .get_column_types("SELECT * FROM events")
        .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(describe_calls(&bridge), 1);
    Ok(())
}

/// Types guessed after a failed catalog lookup are used once, not cached.
#[tokio::test]
async fn test_failed_catalog_lookup_is_not_cached() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "SELECT shipped FROM orders",
        BridgeResponse::selected(&["SHIPPED"], vec![vec![BridgeValue::text("2020-01-02")]]),
    );
    let mut conn = connect(&bridge).await?;

    let result = conn.execute(&Query::new("SELECT shipped FROM orders"), &[]).await?;
    assert_eq!(result.rows, vec![vec![Value::Text("2020-01-02".to_string())]]);
    assert!(conn.config().cache.is_empty());

    let bridge = bridge.with_catalog(
        "SELECT shipped FROM orders",
        vec![CatalogRow::new("SHIPPED", "DATE")],
    );
    let date = Value::Date(chrono::NaiveDate::from_ymd_opt(2020, 1, 2).unwrap());
    for _ in 0..2 {
        let result = conn.execute(&Query::new("SELECT shipped FROM orders"), &[]).await?;
        assert_eq!(result.rows, vec![vec![date.clone()]]);
    }
    assert_eq!(describe_calls(&bridge), 2);
    assert_eq!(conn.config().cache.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_multiple_results_need_a_cursor() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "CALL refresh_totals()",
        BridgeResponse::Multiple(vec![
            BridgeResponse::updated(3),
            BridgeResponse::selected(&["TOTAL"], vec![vec![BridgeValue::Int(9)]]),
        ]),
    );
    let mut conn = connect(&bridge).await?;
    let query = Query::new("CALL refresh_totals()");

    let err = conn.execute(&query, &[]).await.unwrap_err();
    assert!(matches!(err, Error::MultipleResults { count: 2 }));
    assert!(conn.is_connected());

    let mut cursor = conn.handle_declare(&query, &[], 100).await?;
    let (updated, marker) = conn.handle_fetch(&mut cursor).await?;
    assert_eq!(updated.num_rows, 3);
    assert_eq!(marker, Fetch::More);
    let (rows, marker) = conn.handle_fetch(&mut cursor).await?;
    assert_eq!(rows.rows, vec![vec![Value::Int(9)]]);
    assert_eq!(marker, Fetch::Done);
    Ok(())
}

#[tokio::test]
async fn test_cursor_batches_and_restart() -> Result<()> {
    let rows = (1..=5).map(|n| vec![BridgeValue::Int(n)]).collect();
    let bridge = ScriptedBridge::new()
        .respond("SELECT n FROM nums", BridgeResponse::selected(&["N"], rows))
        .with_catalog("SELECT n FROM nums", vec![CatalogRow::new("N", "NUMBER(38,0)")]);
    let mut conn = connect(&bridge).await?;
    let query = Query::new("SELECT n FROM nums");

    let mut cursor = conn.handle_declare(&query, &[], 2).await?;
    assert!(bridge.calls().is_empty());

    let mut sizes = Vec::new();
    loop {
        let (batch, marker) = conn.handle_fetch(&mut cursor).await?;
        sizes.push(batch.num_rows);
        if marker == Fetch::Done {
            break;
        }
    }
    assert_eq!(sizes, vec![2, 2, 1]);

    let (first, marker) = conn.handle_first(&mut cursor).await?;
    assert_eq!(first.rows, vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
    assert_eq!(marker, Fetch::More);
    let (next, _) = conn.handle_next(&mut cursor).await?;
    assert_eq!(next.rows, vec![vec![Value::Int(3)], vec![Value::Int(4)]]);

    conn.handle_deallocate(&mut cursor).await?;
    let err = conn.handle_next(&mut cursor).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Other("24000".to_string()));
    assert_eq!(describe_calls(&bridge), 1);
    Ok(())
}

struct UseWarehouse {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl AfterConnect<ScriptedBridge> for UseWarehouse {
    async fn after_connect(&self, client: &mut BridgeClient<ScriptedBridge>) -> Result<()> {
        client
            .query("USE WAREHOUSE COMPUTE_WH", &[], &QueryOptions::default())
            .await?;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_after_connect_runs_on_every_connect() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let options = ConnectionOptions::builder()
        .dsn("snowflake")
        .after_connect("ALTER SESSION SET TIMEZONE = 'UTC'")
        .build()?;
    let config = ProtocolConfig::new(bridge.clone(), options, Arc::new(TypeCache::new()))
        .after_connect(UseWarehouse { runs: runs.clone() });

    let mut conn = Protocol::connect(&config).await?;
    assert_eq!(
        bridge.statements(),
        vec!["ALTER SESSION SET TIMEZONE = 'UTC'", "USE WAREHOUSE COMPUTE_WH"]
    );

    conn.reconnect().await?;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(bridge.live_handles(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_after_connect_is_a_connection_error() {
    let bridge = ScriptedBridge::new().fail(
        "USE ROLE missing",
        BridgeError::new("Role 'MISSING' does not exist").with_sqlstate("42000"),
    );
    let options = ConnectionOptions::builder()
        .dsn("snowflake")
        .after_connect("USE ROLE missing")
        .build()
        .unwrap();
    let config = ProtocolConfig::new(bridge.clone(), options, Arc::new(TypeCache::new()));

    let err = Protocol::connect(&config).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(bridge.live_handles(), 0);
}

#[tokio::test]
async fn test_refused_connect() {
    let bridge = ScriptedBridge::new();
    bridge.refuse_connections(BridgeError::new("Incorrect username or password").with_sqlstate("28000"));

    let err = connect(&bridge).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(err.code(), ErrorCode::Other("28000".to_string()));
}

#[tokio::test]
async fn test_describe_table() -> Result<()> {
    let bridge = ScriptedBridge::new().with_table(
        "orders",
        vec![
            CatalogRow::new("ID", "NUMBER(38,0)"),
            CatalogRow::new("TOTAL", "NUMBER(12,2)"),
            CatalogRow::new("PLACED_AT", "TIMESTAMP_TZ(9)"),
        ],
    );
    let mut conn = connect(&bridge).await?;

    let columns = conn.describe_table("orders").await?;
    assert_eq!(
        columns,
        vec![
            ColumnType::new("ID", TypeKind::Integer),
            ColumnType::new(
                "TOTAL",
                TypeKind::Decimal {
                    precision: 12,
                    scale: 2
                }
            ),
            ColumnType::new("PLACED_AT", TypeKind::TimestampTz),
        ]
    );
    assert!(conn.describe_table("orders; DROP TABLE x").await.is_err());
    Ok(())
}
