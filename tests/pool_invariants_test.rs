//! Pool limit and lifecycle guarantees, exercised through the manager
//! against an in-memory backend.

mod common;

use common::{BROKEN, FakeConnector, SLEEP, ready_manager};
use dbconn::config::PoolOptions;
use dbconn::db::{CallOptions, ConnectionManager};
use dbconn::models::{CloseReason, PoolEvent};
use dbconn::DbError;
use futures_util::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn close_reasons(events: &[PoolEvent]) -> Vec<CloseReason> {
    events.iter().filter_map(PoolEvent::close_reason).collect()
}

#[tokio::test]
async fn test_max_open_is_never_exceeded() {
    let (manager, connector, _sink) = ready_manager(PoolOptions {
        max_open_conns: 3,
        ..Default::default()
    })
    .await;
    connector.set_hold(Duration::from_millis(20));

    let mut rng = rand::thread_rng();
    let calls = (0..24).map(|i| {
        let jitter = Duration::from_millis(rng.gen_range(0..10));
        let manager = &manager;
        async move {
            tokio::time::sleep(jitter).await;
            if i % 2 == 0 {
                let rows = manager.query("SELECT 1", &[]).await?;
                rows.release().await;
            } else {
                manager.execute("UPDATE t SET x = 1", &[]).await?;
            }
            Ok::<_, DbError>(())
        }
    });
    for result in join_all(calls).await {
        assert_ok!(result);
    }

    assert!(connector.peak() <= 3, "peak was {}", connector.peak());
    let stats = manager.stats().unwrap();
    assert_eq!(stats.in_use, 0);
    assert!(stats.open <= 3);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_unlimited_max_open_allows_concurrency() {
    let (manager, connector, _sink) = ready_manager(PoolOptions::default()).await;
    connector.set_hold(Duration::from_millis(50));
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let rows = manager.query("SELECT 1", &[]).await?;
            rows.release().await;
            Ok::<_, DbError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(connector.peak(), 6);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_excess_idle_connections_are_closed() {
    let (manager, connector, sink) = ready_manager(PoolOptions {
        max_idle_conns: Some(1),
        ..Default::default()
    })
    .await;

    let a = manager.query("SELECT 1", &[]).await.unwrap();
    let b = manager.query("SELECT 1", &[]).await.unwrap();
    let c = manager.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(connector.live(), 3);
    assert_eq!(manager.stats().unwrap().in_use, 3);

    a.release().await;
    b.release().await;
    c.release().await;

    let stats = manager.stats().unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.open, 1);
    assert_eq!(connector.live(), 1);

    let excess = close_reasons(&sink.events())
        .into_iter()
        .filter(|r| *r == CloseReason::MaxIdleExceeded)
        .count();
    assert_eq!(excess, 2);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_max_idle_zero_keeps_nothing_warm() {
    let (manager, connector, _sink) = ready_manager(PoolOptions {
        max_idle_conns: Some(0),
        ..Default::default()
    })
    .await;

    manager.execute("UPDATE t SET x = 1", &[]).await.unwrap();
    assert_eq!(manager.stats().unwrap().idle, 0);
    assert_eq!(connector.live(), 0);
    // verify + execute
    assert_eq!(connector.opened(), 2);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_not_reused_past_lifetime() {
    let (manager, _connector, sink) = ready_manager(PoolOptions {
        conn_max_lifetime: Some(Duration::from_millis(60)),
        ..Default::default()
    })
    .await;

    let rows = manager.query("SELECT 1", &[]).await.unwrap();
    let first = rows.connection_id().unwrap();
    rows.release().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let rows = manager.query("SELECT 1", &[]).await.unwrap();
    let second = rows.connection_id().unwrap();
    rows.release().await;

    assert_ne!(first, second);
    assert!(close_reasons(&sink.events()).contains(&CloseReason::LifetimeExpired));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_time_limit_evicts_on_checkout() {
    let (manager, _connector, sink) = ready_manager(PoolOptions {
        conn_max_idle_time: Some(Duration::from_millis(40)),
        ..Default::default()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    let rows = manager.query("SELECT 1", &[]).await.unwrap();
    rows.release().await;

    assert!(close_reasons(&sink.events()).contains(&CloseReason::IdleTimeout));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_reaper_evicts_without_traffic() {
    let (manager, connector, sink) = ready_manager(PoolOptions {
        conn_max_lifetime: Some(Duration::from_millis(1500)),
        ..Default::default()
    })
    .await;
    assert_eq!(manager.stats().unwrap().idle, 1);

    // No calls: only the background reaper can close the connection
    tokio::time::sleep(Duration::from_secs(3)).await;

    let stats = manager.stats().unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.open, 0);
    assert_eq!(connector.live(), 0);
    assert_eq!(
        close_reasons(&sink.events()),
        vec![CloseReason::LifetimeExpired]
    );
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_interrupted_by_acquire_timeout_is_still_reported() {
    let (manager, connector, sink) = ready_manager(PoolOptions {
        conn_max_lifetime: Some(Duration::from_millis(40)),
        ..Default::default()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Checkout finds the expired connection and times out while closing it
    connector.set_close_delay(Duration::from_millis(200));
    let options = CallOptions::default().with_acquire_timeout(Duration::from_millis(30));
    let err = manager
        .query_with("SELECT 1", &[], options)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolTimeout { .. }));

    assert_eq!(manager.stats().unwrap().open, 0);
    assert_eq!(connector.live(), 0);
    let events = sink.events();
    let opened = events
        .iter()
        .filter(|e| matches!(e, PoolEvent::Opened { .. }))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(close_reasons(&events), vec![CloseReason::LifetimeExpired]);

    connector.set_close_delay(Duration::ZERO);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_second_caller_waits_for_single_connection() {
    let (manager, connector, _sink) = ready_manager(PoolOptions {
        max_open_conns: 1,
        ..Default::default()
    })
    .await;
    connector.set_hold(Duration::from_millis(40));

    let first = async {
        let rows = manager.query("SELECT 1", &[]).await?;
        let id = rows.connection_id();
        rows.release().await;
        Ok::<_, DbError>(id)
    };
    let second = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let rows = manager.query("SELECT 2", &[]).await?;
        let id = rows.connection_id();
        rows.release().await;
        Ok::<_, DbError>(id)
    };
    let (first, second) = tokio::join!(first, second);

    // Both ran, one after the other, on the only connection
    assert_eq!(assert_ok!(first), Some(1));
    assert_eq!(assert_ok!(second), Some(1));
    assert_eq!(connector.opened(), 1);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_acquire_timeout_yields_pool_timeout() {
    let (manager, _connector, sink) = ready_manager(PoolOptions {
        max_open_conns: 1,
        ..Default::default()
    })
    .await;

    let held = manager.query("SELECT 1", &[]).await.unwrap();
    let options = CallOptions::default().with_acquire_timeout(Duration::from_millis(50));
    let err = manager
        .query_with("SELECT 2", &[], options)
        .await
        .unwrap_err();
    match &err {
        DbError::PoolTimeout { waited } => assert_eq!(*waited, Duration::from_millis(50)),
        other => panic!("expected PoolTimeout, got {other:?}"),
    }
    assert!(err.is_retryable());

    let record = sink.records().pop().unwrap();
    assert_eq!(record.statement, "SELECT 2");
    assert_eq!(record.connection_id, None);
    assert!(!record.outcome.is_success());

    held.release().await;
    let rows = manager.query_with("SELECT 3", &[], options).await.unwrap();
    rows.release().await;
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_close_fails_waiters_and_closes_held_connections_on_release() {
    let (manager, connector, sink) = ready_manager(PoolOptions {
        max_open_conns: 1,
        ..Default::default()
    })
    .await;
    let manager = Arc::new(manager);

    let held = manager.query("SELECT 1", &[]).await.unwrap();
    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.execute("UPDATE t SET x = 1", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    manager.close().await.unwrap();
    let err = assert_err!(waiter.await.unwrap());
    assert!(matches!(err, DbError::ManagerClosed));

    // The held connection survives close until it is released
    assert_eq!(connector.live(), 1);
    held.release().await;
    assert_eq!(connector.live(), 0);
    assert_eq!(connector.dropped(), 0);
    assert_eq!(
        close_reasons(&sink.events()).last(),
        Some(&CloseReason::PoolClosed)
    );
}

#[tokio::test]
async fn test_broken_connection_is_discarded() {
    let (manager, connector, sink) = ready_manager(PoolOptions::default()).await;

    let err = manager.execute(BROKEN, &[]).await.unwrap_err();
    assert!(matches!(err, DbError::ExecutionFailed { .. }));
    assert!(close_reasons(&sink.events()).contains(&CloseReason::Broken));
    assert_eq!(connector.live(), 0);

    let rows = manager.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(rows.connection_id(), Some(2));
    rows.release().await;
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_statement_timeout_discards_connection() {
    let (manager, connector, _sink) = ready_manager(PoolOptions::default()).await;

    let options = CallOptions::default().with_statement_timeout(Duration::from_millis(20));
    let err = manager.execute_with(SLEEP, &[], options).await.unwrap_err();
    match &err {
        DbError::ExecutionFailed { message, statement, .. } => {
            assert!(message.contains("timed out"));
            assert_eq!(statement, SLEEP);
        }
        other => panic!("expected ExecutionFailed, got {other:?}"),
    }
    assert_eq!(connector.live(), 0);
    assert_eq!(manager.stats().unwrap().open, 0);
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_row_set_still_returns_connection() {
    let (manager, connector, _sink) = ready_manager(PoolOptions::default()).await;

    let rows = manager.query("SELECT 1", &[]).await.unwrap();
    drop(rows);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = manager.stats().unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(connector.live(), 1);
    manager.close().await.unwrap();
}

#[test]
fn test_row_set_dropped_outside_runtime_is_reported() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (manager, connector, sink, rows) = runtime.block_on(async {
        let (manager, connector, sink) = ready_manager(PoolOptions::default()).await;
        let rows = manager.query("SELECT 1", &[]).await.unwrap();
        (manager, connector, sink, rows)
    });
    drop(runtime);

    drop(rows);
    assert_eq!(connector.dropped(), 1);
    assert_eq!(connector.live(), 0);
    assert_eq!(manager.stats().unwrap().open, 0);
    assert_eq!(close_reasons(&sink.events()), vec![CloseReason::Abandoned]);
}

#[tokio::test]
async fn test_close_leaves_no_connection_open() {
    let (manager, connector, sink): (ConnectionManager<FakeConnector>, _, _) =
        ready_manager(PoolOptions::default()).await;

    let a = manager.query("SELECT 1", &[]).await.unwrap();
    let b = manager.query("SELECT 1", &[]).await.unwrap();
    a.release().await;
    b.release().await;
    assert_eq!(connector.live(), 2);

    manager.close().await.unwrap();
    assert_eq!(connector.live(), 0);
    assert_eq!(connector.opened(), connector.closed());
    assert_eq!(connector.targets_closed(), 1);

    let opened = sink
        .events()
        .iter()
        .filter(|e| matches!(e, PoolEvent::Opened { .. }))
        .count();
    let closed = close_reasons(&sink.events()).len();
    assert_eq!(opened, closed);
}
