use std::time::Duration;

use odbc_middleware::prelude::*;
use odbc_middleware::test_utils::MemoryDriver;
use tokio::time::timeout;

fn sized(min: usize, max: usize) -> PoolOptions {
    PoolOptions::builder().minsize(min).maxsize(max).finish()
}

/// A connection that hit a driver error is closed on release, never reused.
#[tokio::test(flavor = "current_thread")]
async fn broken_connection_is_not_returned_to_free() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 2)).await?;
    let conn = pool.acquire().await?;
    let broken_id = conn.id();
    assert!(conn.execute("FAIL on purpose", &[]).await.is_err());
    assert!(conn.is_broken());

    pool.release(conn).await?;
    let status = pool.status();
    assert_eq!(status.free, 0);
    assert_eq!(status.size, 0);
    assert_eq!(driver.open_connections(), 0);

    let fresh = pool.acquire().await?;
    assert_ne!(fresh.id(), broken_id);
    fresh.release().await?;
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn closed_connection_is_dropped_on_release() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(1, 1)).await?;
    let conn = pool.acquire().await?;
    conn.close().await?;
    conn.release().await?;
    assert_eq!(pool.size(), 0);

    let again = pool.acquire().await?;
    assert!(!again.is_closed());
    again.release().await?;
    assert_eq!(driver.connects(), 2);
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn lost_link_frees_the_slot() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    let conn = pool.acquire().await?;
    assert!(conn.execute("DISCONNECT", &[]).await.is_err());
    assert!(conn.is_closed());
    drop(conn);
    assert_eq!(pool.size(), 0);
    assert_eq!(driver.open_connections(), 0);
    pool.shutdown().await
}

/// A broken connection released while someone waits lets the waiter open a new one.
#[tokio::test(flavor = "current_thread")]
async fn discarded_connection_hands_its_slot_to_a_waiter() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(1, 1)).await?;
    let conn = pool.acquire().await?;
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

    let old_id = conn.id();
    assert!(conn.execute("FAIL again", &[]).await.is_err());
    conn.release().await?;
    let new_id = waiter.await.expect("waiter panicked")?;
    assert_ne!(new_id, old_id);
    assert_eq!(driver.connects(), 2);
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn detached_connection_leaves_the_pool() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(1, 1)).await?;
    let conn = pool.acquire().await?.detach();
    assert_eq!(pool.size(), 0);

    let other = pool.acquire().await?;
    assert_ne!(other.id(), conn.id());
    let mut cursor = conn.execute("SELECT 1", &[]).await?;
    assert_eq!(cursor.fetch_val().await?, Some(Value::Int(1)));
    other.release().await?;
    pool.shutdown().await?;

    assert!(!conn.is_closed());
    conn.close().await?;
    assert_eq!(driver.open_connections(), 0);
    Ok(())
}

/// A call abandoned by its caller keeps running on the worker; the next holder must not
/// get the connection until it has finished.
#[tokio::test(flavor = "current_thread")]
async fn release_waits_out_an_abandoned_call() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    let conn = pool.acquire().await?;
    let first_id = conn.id();
    let mut cursor = conn.cursor().await?;
    let call = cursor.execute("SLEEP 300", &[]);
    assert!(timeout(Duration::from_millis(10), call).await.is_err());
    assert!(conn.pending_calls() > 0);
    drop(cursor);

    conn.release().await?;
    let again = pool.acquire().await?;
    assert_eq!(again.id(), first_id);
    assert_eq!(again.pending_calls(), 0);
    let mut cursor = again.execute("SELECT 3", &[]).await?;
    assert_eq!(cursor.fetch_val().await?, Some(Value::Int(3)));
    cursor.close().await?;
    again.release().await?;
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn dropped_guard_defers_hand_off_past_an_abandoned_call() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    let conn = pool.acquire().await?;
    let first_id = conn.id();
    let mut cursor = conn.cursor().await?;
    let call = cursor.execute("SLEEP 300", &[]);
    assert!(timeout(Duration::from_millis(10), call).await.is_err());
    drop(cursor);

    drop(conn);
    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.free, 0);
    assert!(pool.try_acquire().await.is_err());

    let again = pool.acquire().await?;
    assert_eq!(again.id(), first_id);
    assert_eq!(again.pending_calls(), 0);
    assert!(!again.is_broken());
    again.release().await?;
    assert_eq!(driver.connects(), 1);
    pool.shutdown().await
}

/// Cursors opened by one holder die when the connection goes back to the pool.
#[tokio::test(flavor = "current_thread")]
async fn cursor_from_an_earlier_checkout_is_dead() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    let first = pool.acquire().await?;
    let first_id = first.id();
    let mut stale = first.execute("SELECT 1", &[]).await?;
    assert!(!stale.is_closed());
    first.release().await?;
    assert!(stale.is_closed());

    let second = pool.acquire().await?;
    assert_eq!(second.id(), first_id);
    let err = stale
        .execute("SELECT 5", &[])
        .await
        .expect_err("cursor outlived its checkout");
    assert!(matches!(err, OdbcMiddlewareError::Usage(_)));
    assert!(stale.fetch_one().await.is_err());
    assert!(stale.commit().await.is_err());
    stale.close().await?;
    assert!(!second.is_broken());

    let mut cursor = second.execute("SELECT 2", &[]).await?;
    assert_eq!(cursor.fetch_val().await?, Some(Value::Int(2)));
    cursor.close().await?;
    second.release().await?;
    pool.shutdown().await
}

#[tokio::test(flavor = "current_thread")]
async fn dropped_guard_invalidates_its_cursors() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let pool = create_pool(driver.handle(), "memory", sized(0, 1)).await?;
    let conn = pool.acquire().await?;
    let mut stale = conn.cursor().await?;
    drop(conn);
    assert!(stale.is_closed());
    let err = stale
        .execute("SELECT 5", &[])
        .await
        .expect_err("cursor outlived its checkout");
    assert!(matches!(err, OdbcMiddlewareError::Usage(_)));
    drop(stale);

    let again = pool.acquire().await?;
    let mut cursor = again.execute("SELECT 4", &[]).await?;
    assert_eq!(cursor.fetch_val().await?, Some(Value::Int(4)));
    cursor.close().await?;
    again.release().await?;
    pool.shutdown().await
}
