use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use odbc_middleware::prelude::*;
use odbc_middleware::test_utils::MemoryDriver;

fn sized(min: usize, max: usize) -> PoolOptions {
    PoolOptions::builder().minsize(min).maxsize(max).finish()
}

#[tokio::test(flavor = "current_thread")]
async fn prefills_minsize_connections() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(3, 5)).await?;
    let status = pool.status();
    assert_eq!(status.size, 3);
    assert_eq!(status.free, 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(driver.connects(), 3);
    pool.shutdown().await?;
    assert_eq!(driver.open_connections(), 0);
    Ok(())
}

/// However many tasks compete, the pool never holds more than `maxsize` connections.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_maxsize_under_contention() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 3)).await?;
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..24 {
        let pool = pool.clone();
        let driver = driver.clone();
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            let status = pool.status();
            assert!(status.size <= status.maxsize, "{status:?}");
            assert!(driver.open_connections() <= 3);
            peak.fetch_max(status.in_use, Ordering::Relaxed);
            let sql = format!("SLEEP {}", 1 + i % 4);
            conn.execute(&sql, &[]).await?;
            conn.release().await
        }));
    }
    for task in tasks {
        task.await.expect("worker task panicked")?;
    }

    assert!(peak.load(Ordering::Relaxed) <= 3);
    assert!(driver.connects() <= 3);
    assert_eq!(pool.in_use_size(), 0);
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn single_slot_pool_blocks_second_acquire() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(1, 1)).await?;
    let held = pool.acquire().await?;

    let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(blocked.is_err(), "second acquire should wait");
    assert_eq!(pool.status().waiting, 0);

    let held_id = held.id();
    held.release().await?;
    let next = pool.acquire().await?;
    assert_eq!(next.id(), held_id);
    next.release().await?;
    assert_eq!(driver.connects(), 1);
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn try_acquire_reports_exhaustion() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 2)).await?;
    let a = pool.try_acquire().await?;
    let b = pool.try_acquire().await?;
    let err = pool.try_acquire().await.expect_err("pool is full");
    assert!(matches!(err, OdbcMiddlewareError::PoolExhausted { max: 2 }));
    drop(a);
    let c = pool.try_acquire().await?;
    b.release().await?;
    c.release().await?;
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn acquire_timeout_option_bounds_the_wait() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder()
        .minsize(0)
        .maxsize(1)
        .acquire_timeout(Duration::from_millis(30))
        .finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    let held = pool.acquire().await?;
    let err = pool.acquire().await.expect_err("times out");
    assert!(matches!(err, OdbcMiddlewareError::AcquireTimeout(_)));
    let err = pool
        .acquire_timeout(Duration::from_millis(10))
        .await
        .expect_err("times out");
    assert!(matches!(err, OdbcMiddlewareError::AcquireTimeout(_)));
    held.release().await?;
    pool.shutdown().await
}

/// A failed connect gives its reserved slot back.
#[tokio::test(flavor = "current_thread")]
async fn failed_connect_does_not_leak_capacity() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    driver.fail_next_connect();
    let err = pool.acquire().await.expect_err("connect fails");
    assert!(err.is_driver_error());
    assert_eq!(pool.size(), 0);

    let conn = pool.acquire().await?;
    assert_eq!(pool.size(), 1);
    conn.release().await?;
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn pool_reports_its_configuration() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(1).maxsize(4).echo(true).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;
    assert_eq!(pool.minsize(), 1);
    assert_eq!(pool.maxsize(), 4);
    assert!(pool.echo());
    let conn = pool.acquire().await?;
    assert!(conn.echo());
    conn.release().await?;
    pool.shutdown().await
}
