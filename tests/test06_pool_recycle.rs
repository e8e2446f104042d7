use std::time::Duration;

use odbc_middleware::prelude::*;
use odbc_middleware::test_utils::MemoryDriver;

fn recycling(after: Duration) -> PoolOptions {
    PoolOptions::builder()
        .minsize(1)
        .maxsize(1)
        .pool_recycle(after)
        .finish()
}

/// A connection older than `pool_recycle` is replaced on its next acquire.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn expired_connection_is_replaced_on_acquire() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", recycling(Duration::from_secs(10))).await?;

    let first = pool.acquire().await?;
    let first_id = first.id();
    first.release().await?;

    tokio::time::advance(Duration::from_secs(5)).await;
    let young = pool.acquire().await?;
    assert_eq!(young.id(), first_id);
    young.release().await?;

    tokio::time::advance(Duration::from_secs(6)).await;
    let replaced = pool.acquire().await?;
    assert_ne!(replaced.id(), first_id);
    assert_eq!(pool.size(), 1);
    assert_eq!(driver.connects(), 2);
    replaced.release().await?;

    pool.shutdown().await?;
    assert_eq!(driver.open_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn no_recycling_by_default() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let options = PoolOptions::builder().minsize(1).maxsize(1).finish();
    let pool = create_pool(driver.handle(), "memory", options).await?;

    let first = pool.acquire().await?;
    let first_id = first.id();
    first.release().await?;

    tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
    let later = pool.acquire().await?;
    assert_eq!(later.id(), first_id);
    later.release().await?;
    pool.shutdown().await
}

/// A connection handed straight to a waiter is age-checked too.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn expired_connection_handed_to_waiter_is_replaced() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", recycling(Duration::from_secs(10))).await?;
    let held = pool.acquire().await?;
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await?;
            let id = conn.id();
            conn.release().await?;
            Ok::<_, OdbcMiddlewareError>(id)
        })
    };
    while pool.status().waiting == 0 {
        tokio::task::yield_now().await;
    }

    tokio::time::advance(Duration::from_secs(11)).await;
    held.release().await?;
    let waiter_id = waiter.await.expect("waiter panicked")?;
    assert_ne!(waiter_id, held_id);
    assert_eq!(pool.size(), 1);
    pool.shutdown().await
}
