//! Pool supervision tests: keepalive, reconnect, discard.

use std::sync::Arc;
use std::time::Duration;

use snowbridge::bridge::BridgeError;
use snowbridge::prelude::*;
use snowbridge::testing::ScriptedBridge;

type TestPool = Pool<Protocol<ScriptedBridge>>;

async fn start(bridge: &ScriptedBridge, config: PoolConfig) -> Result<TestPool> {
    let options = ConnectionOptions::builder().dsn("snowflake").build()?;
    let protocol = ProtocolConfig::new(bridge.clone(), options, Arc::new(TypeCache::new()));
    Pool::connect(protocol, config).await
}

#[tokio::test]
async fn test_connections_are_reused() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new().max_connections(2)).await?;

    for _ in 0..3 {
        let mut conn = pool.acquire().await?;
        conn.ping().await?;
        conn.release().await;
    }

    assert_eq!(bridge.connects(), 1);
    let stats = pool.stats().await;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total_created, 1);
    Ok(())
}

#[tokio::test]
async fn test_idle_connection_is_pinged_and_reconnected() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new().idle_interval(Duration::ZERO)).await?;

    bridge.sever();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut conn = pool.acquire().await?;
    assert_eq!(conn.ping().await?, TransactionStatus::Idle);
    conn.release().await;

    assert_eq!(bridge.connects(), 2);
    assert_eq!(pool.stats().await.reconnects, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_reconnect_discards_connection() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new().idle_interval(Duration::ZERO)).await?;

    bridge.sever();
    bridge.refuse_connections(BridgeError::new("Account is locked").with_sqlstate("08004"));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = pool.acquire().await.err().unwrap();
    assert!(err.is_connection_error());
    let stats = pool.stats().await;
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle, 0);

    bridge.accept_connections();
    let mut conn = pool.acquire().await?;
    conn.ping().await?;
    Ok(())
}

#[tokio::test]
async fn test_checkin_inside_transaction_disconnects() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new()).await?;

    let mut conn = pool.acquire().await?;
    conn.handle_begin().await?;
    conn.release().await;

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.discarded, 1);
    assert_eq!(bridge.live_handles(), 0);

    let mut conn = pool.acquire().await?;
    assert_eq!(conn.handle_status(), Some(TransactionStatus::Idle));
    conn.release().await;
    assert_eq!(bridge.connects(), 2);
    Ok(())
}

#[tokio::test]
async fn test_lost_connection_is_not_returned() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new()).await?;

    let mut conn = pool.acquire().await?;
    bridge.sever();
    assert!(conn.ping().await.is_err());
    conn.release().await;

    assert_eq!(pool.idle_count().await, 0);
    assert_eq!(pool.stats().await.discarded, 1);
    Ok(())
}

#[tokio::test]
async fn test_acquire_times_out() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let config = PoolConfig::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(20));
    let pool = start(&bridge, config).await?;

    let held = pool.acquire().await?;
    let err = pool.acquire().await.err().unwrap();
    assert_eq!(err.code(), ErrorCode::ConnectionTimeout);

    held.release().await;
    assert!(pool.acquire().await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_closed_pool_refuses_acquire() -> Result<()> {
    let bridge = ScriptedBridge::new();
    let pool = start(&bridge, PoolConfig::new()).await?;

    pool.close().await;
    assert!(pool.is_closed());
    assert!(pool.acquire().await.is_err());
    assert_eq!(bridge.live_handles(), 0);
    Ok(())
}
