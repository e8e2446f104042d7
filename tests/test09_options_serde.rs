use std::time::Duration;

use odbc_middleware::prelude::*;

#[test]
fn pool_options_from_json_fill_defaults() -> Result<(), serde_json::Error> {
    let options: PoolOptions = serde_json::from_str(
        r#"{
            "minsize": 1,
            "maxsize": 4,
            "pool_recycle": { "secs": 30, "nanos": 0 },
            "connect": { "autocommit": true, "attributes": { "APP": "reports" } }
        }"#,
    )?;
    assert_eq!(options.minsize, 1);
    assert_eq!(options.maxsize, 4);
    assert_eq!(options.pool_recycle, Some(Duration::from_secs(30)));
    assert_eq!(options.acquire_timeout, None);
    assert!(options.connect.autocommit);
    assert!(!options.connect.echo);
    assert_eq!(
        options.connect.connection_string("DSN=main"),
        "DSN=main;APP=reports"
    );
    assert!(options.validate().is_ok());
    Ok(())
}

#[test]
fn empty_json_gives_default_pool() -> Result<(), serde_json::Error> {
    let options: PoolOptions = serde_json::from_str("{}")?;
    assert_eq!(options.minsize, 10);
    assert_eq!(options.maxsize, 10);
    assert!(options.pool_recycle.is_none());
    Ok(())
}

#[test]
fn hook_is_not_serialized() -> Result<(), serde_json::Error> {
    let options = ConnectOptions::builder()
        .echo(true)
        .after_created(|_conn| Box::pin(async { Ok::<_, OdbcMiddlewareError>(()) }))
        .finish();
    let json = serde_json::to_value(&options)?;
    assert_eq!(json["echo"], serde_json::Value::Bool(true));
    assert!(json.get("after_created").is_none());

    let back: ConnectOptions = serde_json::from_value(json)?;
    assert!(back.echo);
    assert!(back.after_created.is_none());
    Ok(())
}

#[test]
fn invalid_sizes_are_rejected_before_connecting() {
    let options: PoolOptions =
        serde_json::from_str(r#"{ "minsize": 5, "maxsize": 2 }"#).expect("valid json");
    let err = options.validate().expect_err("inverted sizes");
    assert!(matches!(err, OdbcMiddlewareError::Config(_)));
}
