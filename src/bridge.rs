//! Blocking-call bridge.
//!
//! Split into:
//! - channel: command and job types crossing the thread boundary
//! - dispatcher: the worker loop
//! - manager: the async-facing [`Bridge`] handle

mod channel;
mod dispatcher;
mod manager;

pub use manager::Bridge;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::Bridge;
    use crate::driver::DriverError;
    use crate::error::OdbcMiddlewareError;

    #[tokio::test(flavor = "current_thread")]
    async fn runs_calls_in_order_against_owned_state() -> Result<(), OdbcMiddlewareError> {
        let bridge = Bridge::spawn("bridge-test", Vec::<u32>::new)?;
        for i in 0..5 {
            bridge
                .run(move |state| {
                    state.push(i);
                    Ok(())
                })
                .await?;
        }
        let seen = bridge.run(|state| Ok(state.clone())).await?;
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn errors_are_delivered_to_the_caller() -> Result<(), OdbcMiddlewareError> {
        let bridge = Bridge::spawn("bridge-err", || ())?;
        let err = bridge
            .run(|_| -> Result<(), OdbcMiddlewareError> {
                Err(DriverError::statement("boom").into())
            })
            .await
            .expect_err("driver error should surface");
        assert!(err.is_driver_error());
        // the worker keeps serving after a failed call
        assert_eq!(bridge.run(|_| Ok(7)).await?, 7);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn panicking_call_stops_the_worker() -> Result<(), OdbcMiddlewareError> {
        let bridge = Bridge::spawn("bridge-panic", || ())?;
        let err = bridge
            .run(|_| -> Result<(), OdbcMiddlewareError> { panic!("driver bug") })
            .await
            .expect_err("panic should surface as worker error");
        assert!(matches!(err, OdbcMiddlewareError::Worker(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bridge.run(|_| Ok(())).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn abandoned_call_still_completes() -> Result<(), OdbcMiddlewareError> {
        let bridge = Bridge::spawn("bridge-cancel", || ())?;
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let call = bridge.run(move |_| {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(5), call).await;
        assert!(timed_out.is_err());
        assert_eq!(bridge.in_flight(), 1);

        // queued behind the abandoned call, so it observes its side effect
        bridge.run(|_| Ok(())).await?;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(bridge.in_flight(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn follow_up_runs_after_the_call_stops_counting() -> Result<(), OdbcMiddlewareError> {
        let bridge = Arc::new(Bridge::spawn("bridge-then", || 0_u32)?);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let observer = Arc::clone(&bridge);
        let recorded = Arc::clone(&seen);
        bridge.submit_then(
            |state| *state += 1,
            move || {
                recorded.store(observer.in_flight(), Ordering::SeqCst);
                let _ = tx.send(());
            },
        )?;
        rx.await
            .map_err(|_| OdbcMiddlewareError::Worker("follow-up never ran".into()))?;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.run(|state| Ok(*state)).await?, 1);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn call_timeout_surfaces_as_typed_error() -> Result<(), OdbcMiddlewareError> {
        let bridge = Bridge::spawn("bridge-timeout", || ())?
            .with_call_timeout(Some(Duration::from_millis(10)));
        let err = bridge
            .run(|_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            })
            .await
            .expect_err("call should time out");
        assert!(matches!(err, OdbcMiddlewareError::CallTimeout(_)));
        Ok(())
    }
}
