//! Facade tests over the scripted bridge.

use std::time::Duration;

use pretty_assertions::assert_eq;
use snowbridge::bridge::{BridgeResponse, BridgeValue};
use snowbridge::prelude::*;
use snowbridge::testing::ScriptedBridge;
use snowbridge::types::CatalogRow;

async fn start(bridge: &ScriptedBridge) -> Result<Snowbridge<ScriptedBridge>> {
    let options = ConnectionOptions::builder().dsn("snowflake").build()?;
    Snowbridge::with_driver(bridge.clone(), options, PoolConfig::new().max_connections(2)).await
}

fn nums_bridge() -> ScriptedBridge {
    let rows = (1..=5).map(|n| vec![BridgeValue::Int(n)]).collect();
    ScriptedBridge::new()
        .respond("SELECT n FROM nums", BridgeResponse::selected(&["N"], rows))
        .with_catalog("SELECT n FROM nums", vec![CatalogRow::new("N", "NUMBER(38,0)")])
        .respond("INSERT INTO orders VALUES (?)", BridgeResponse::updated(1))
}

/// Spawned check-ins run once the test task yields.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_query_and_prepare_execute() -> Result<()> {
    let bridge = nums_bridge();
    let db = start(&bridge).await?;

    let result = db.query("SELECT n FROM nums", &[]).await?;
    assert_eq!(result.num_rows, 5);
    assert_eq!(result.rows[4], vec![Value::Int(5)]);

    let (query, result) = db
        .prepare_execute(Query::named("insert_order", "INSERT INTO orders VALUES (?)"), &[42.into()])
        .await?;
    assert_eq!(query.name(), Some("insert_order"));
    assert_eq!(result.num_rows, 1);

    let prepared = db.prepare("SELECT n FROM nums").await?;
    assert_eq!(db.execute(&prepared, &[]).await?.num_rows, 5);
    assert!(db.prepare("").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_stream_in_batches() -> Result<()> {
    let bridge = nums_bridge();
    let db = start(&bridge).await?;

    let mut stream = db.stream("SELECT n FROM nums", &[], 2).await?;
    let mut sizes = Vec::new();
    while let Some(batch) = stream.next_batch().await? {
        sizes.push(batch.rows.len());
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(stream.is_done());

    let first = stream.restart().await?;
    assert_eq!(first.rows, vec![vec![Value::Int(1)], vec![Value::Int(2)]]);

    let all = db.stream("SELECT n FROM nums", &[], 2).await?.collect().await?;
    assert_eq!(all.columns, vec!["N".to_string()]);
    assert_eq!(all.num_rows, 5);
    Ok(())
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() -> Result<()> {
    let bridge = nums_bridge();
    let db = start(&bridge).await?;

    let mut tx = db.transaction().await?;
    tx.query("INSERT INTO orders VALUES (?)", &[7.into()]).await?;
    tx.commit().await?;

    let tx = db.transaction().await?;
    tx.rollback().await?;
    settle().await;

    assert_eq!(
        bridge.statements(),
        vec!["BEGIN", "INSERT INTO orders VALUES (?)", "COMMIT", "BEGIN", "ROLLBACK"]
    );
    assert_eq!(db.pool_stats().await.discarded, 0);
    Ok(())
}

#[tokio::test]
async fn test_dropped_transaction_discards_connection() -> Result<()> {
    let bridge = nums_bridge();
    let db = start(&bridge).await?;

    {
        let mut tx = db.transaction().await?;
        tx.query("INSERT INTO orders VALUES (?)", &[1.into()]).await?;
    }
    settle().await;

    assert_eq!(bridge.live_handles(), 0);
    assert_eq!(db.pool_stats().await.discarded, 1);
    assert_eq!(db.ping().await?, TransactionStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn test_multiple_results_through_facade() -> Result<()> {
    let bridge = ScriptedBridge::new().respond(
        "CALL two_sets()",
        BridgeResponse::Multiple(vec![
            BridgeResponse::selected(&["A"], vec![vec![BridgeValue::Int(1)]]),
            BridgeResponse::selected(&["B"], vec![vec![BridgeValue::text("x")]]),
        ]),
    );
    let db = start(&bridge).await?;

    let err = db.query("CALL two_sets()", &[]).await.unwrap_err();
    assert!(matches!(err, Error::MultipleResults { count: 2 }));

    let mut stream = db.stream("CALL two_sets()", &[], 10).await?;
    let first = stream.next_batch().await?.unwrap();
    let second = stream.next_batch().await?.unwrap();
    assert_eq!(first.columns, vec!["A".to_string()]);
    assert_eq!(second.rows, vec![vec![Value::Text("x".to_string())]]);
    assert!(stream.next_batch().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_shared_cache_and_describe() -> Result<()> {
    let bridge = nums_bridge().with_table("orders", vec![CatalogRow::new("ID", "NUMBER(38,0)")]);
    let db = start(&bridge).await?;

    db.query("SELECT n FROM nums", &[]).await?;
    db.query("SELECT n FROM nums", &[]).await?;
    assert_eq!(db.cache().stats().misses, 1);

    let columns = db.describe_table("orders").await?;
    assert_eq!(columns, vec![ColumnType::new("ID", TypeKind::Integer)]);

    db.shutdown().await;
    assert!(db.ping().await.is_err());
    Ok(())
}
