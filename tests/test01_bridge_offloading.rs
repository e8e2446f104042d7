use std::time::{Duration, Instant};

use odbc_middleware::prelude::*;
use odbc_middleware::test_utils::{MemoryDriver, MemoryEvent};

/// A native call that blocks for a while must not stall other tasks on the same runtime.
#[tokio::test(flavor = "current_thread")]
async fn slow_native_call_leaves_scheduler_free() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let conn = connect(driver.handle(), "memory", ConnectOptions::default()).await?;

    let started = Instant::now();
    let slow = tokio::spawn(async move {
        let result = conn.execute("SLEEP 300", &[]).await.map(|_| ());
        (conn, result)
    });

    let mut ticks = 0_u32;
    while !slow.is_finished() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ticks += 1;
    }
    let (conn, result) = slow.await.expect("slow task panicked");
    result?;

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(ticks >= 10, "scheduler only ticked {ticks} times");
    conn.close().await
}

#[tokio::test(flavor = "current_thread")]
async fn native_calls_run_on_the_connection_worker() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let conn = connect(driver.handle(), "memory", ConnectOptions::default()).await?;

    let thread_name = conn
        .with_raw(|_native| Ok(std::thread::current().name().map(str::to_owned)))
        .await?;
    assert_eq!(thread_name, Some(format!("odbc-worker-{}", conn.id())));
    conn.close().await
}

/// Calls issued on one connection reach the driver in the order they were issued.
#[tokio::test(flavor = "current_thread")]
async fn calls_on_one_connection_are_serialized() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let conn = connect(driver.handle(), "memory", ConnectOptions::default()).await?;
    let mut first = conn.cursor().await?;
    let mut second = conn.cursor().await?;
    let mut third = conn.cursor().await?;
    driver.clear_events();

    let (a, b, c) = tokio::join!(
        first.execute("SLEEP 50", &[]),
        second.execute("SELECT 2", &[]),
        third.execute("SELECT 3", &[]),
    );
    a?;
    b?;
    c?;

    let executed: Vec<String> = driver
        .events()
        .into_iter()
        .filter_map(|event| match event {
            MemoryEvent::Execute { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(executed, vec!["SLEEP 50", "SELECT 2", "SELECT 3"]);
    conn.close().await
}

/// An abandoned call still runs to completion; the next call queues behind it.
#[tokio::test(flavor = "current_thread")]
async fn abandoned_call_finishes_before_the_next_one() -> Result<(), OdbcMiddlewareError> {
    let driver = MemoryDriver::new();
    let conn = connect(driver.handle(), "memory", ConnectOptions::default()).await?;
    let mut slow = conn.cursor().await?;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), slow.execute("SLEEP 150", &[])).await;
    assert!(abandoned.is_err());
    assert_eq!(conn.pending_calls(), 1);

    let mut cursor = conn.execute("SELECT 7", &[]).await?;
    assert_eq!(conn.pending_calls(), 0);
    assert_eq!(cursor.fetch_val().await?, Some(Value::Int(7)));
    assert!(!conn.is_broken());
    conn.close().await
}
