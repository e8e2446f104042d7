use std::sync::{Arc, Mutex};
use std::time::Duration;

use odbc_middleware::prelude::*;
use odbc_middleware::test_utils::MemoryDriver;
use tokio::task::{JoinHandle, yield_now};

async fn wait_for_waiters(pool: &Pool, count: usize) {
    while pool.status().waiting < count {
        yield_now().await;
    }
}

fn queue_up(pool: &Pool, name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>) -> JoinHandle<Result<(), OdbcMiddlewareError>> {
    let pool = pool.clone();
    let order = Arc::clone(order);
    tokio::spawn(async move {
        let conn = pool.acquire().await?;
        order.lock().expect("order lock").push(name);
        conn.release().await
    })
}

/// Waiters are served in the order they started waiting.
#[tokio::test(flavor = "current_thread")]
async fn waiters_are_served_first_come_first_served() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(1).maxsize(1).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    let held = pool.acquire().await?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let a = queue_up(&pool, "A", &order);
    wait_for_waiters(&pool, 1).await;
    let b = queue_up(&pool, "B", &order);
    wait_for_waiters(&pool, 2).await;
    let c = queue_up(&pool, "C", &order);
    wait_for_waiters(&pool, 3).await;

    held.release().await?;
    for task in [a, b, c] {
        task.await.expect("waiter panicked")?;
    }

    assert_eq!(*order.lock().expect("order lock"), vec!["A", "B", "C"]);
    assert_eq!(driver.connects(), 1);
    pool.shutdown().await
}

/// A newcomer does not jump the queue even when the release happens while it is arriving.
#[tokio::test(flavor = "current_thread")]
async fn released_connection_goes_to_waiter_not_newcomer() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(1).maxsize(1).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    let held = pool.acquire().await?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let waiter = queue_up(&pool, "waiter", &order);
    wait_for_waiters(&pool, 1).await;
    held.release().await?;

    let err = pool.try_acquire().await.expect_err("handed to the waiter");
    assert!(matches!(err, OdbcMiddlewareError::PoolExhausted { .. }));
    waiter.await.expect("waiter panicked")?;
    assert_eq!(*order.lock().expect("order lock"), vec!["waiter"]);
    pool.shutdown().await
}

/// Giving up while queued leaves the pool exactly as it was.
#[tokio::test(flavor = "current_thread")]
async fn cancelled_waiter_leaves_no_trace() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(0).maxsize(1).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    let held = pool.acquire().await?;

    let gave_up = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(gave_up.is_err());
    let status = pool.status();
    assert_eq!(status.waiting, 0);
    assert_eq!(status.size, 1);
    assert_eq!(status.in_use, 1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let next = queue_up(&pool, "next", &order);
    wait_for_waiters(&pool, 1).await;
    held.release().await?;
    next.await.expect("waiter panicked")?;
    assert_eq!(pool.status().free, 1);
    pool.shutdown().await
}

/// A waiter aborted after being handed a connection passes it on instead of leaking it.
#[tokio::test(flavor = "current_thread")]
async fn aborted_waiter_returns_its_grant() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(1).maxsize(1).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    let held = pool.acquire().await?;

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };
    wait_for_waiters(&pool, 1).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let second = queue_up(&pool, "second", &order);
    wait_for_waiters(&pool, 2).await;

    // The grant lands in `first` before it gets polled again.
    drop(held);
    first.abort();
    let _ = first.await;

    second.await.expect("waiter panicked")?;
    assert_eq!(*order.lock().expect("order lock"), vec!["second"]);
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.size, 1);
    pool.shutdown().await
}
