use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::OdbcMiddlewareError;

use super::channel::{Command, Job};
use super::dispatcher::run_worker;

/// Runs blocking calls on one dedicated thread and hands results back to async callers.
///
/// Calls are served strictly one at a time in submission order, so whatever state the
/// thread owns is never touched by two calls at once.
pub struct Bridge<S: 'static> {
    sender: Sender<Command<S>>,
    name: Arc<str>,
    in_flight: Arc<AtomicUsize>,
    call_timeout: Option<Duration>,
}

impl<S: 'static> Bridge<S> {
    /// Start the worker thread; `init` builds its state on that thread.
    ///
    /// # Errors
    /// Returns [`OdbcMiddlewareError::Worker`] if the thread cannot be spawned.
    pub fn spawn<F>(name: impl Into<String>, init: F) -> Result<Self, OdbcMiddlewareError>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::channel::<Command<S>>();
        let handle = Handle::try_current().ok();
        let thread_name = Arc::clone(&name);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Lets native code reach the caller's runtime if it needs to.
                let runtime_guard = handle.as_ref().map(Handle::enter);
                let state = init();
                run_worker(&thread_name, state, &receiver);
                drop(runtime_guard);
            })
            .map_err(|err| {
                OdbcMiddlewareError::Worker(format!("failed to spawn worker thread {name}: {err}"))
            })?;

        Ok(Self {
            sender,
            name,
            in_flight: Arc::new(AtomicUsize::new(0)),
            call_timeout: None,
        })
    }

    /// Bound how long [`run`](Self::run) waits for a reply.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls submitted but not yet finished on the worker, including abandoned ones.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run `func` on the worker and await its result.
    ///
    /// Dropping the returned future does not interrupt the call: it finishes on the worker
    /// and its result is discarded. Later calls queue behind it.
    ///
    /// # Errors
    /// Returns whatever `func` returns, [`OdbcMiddlewareError::Worker`] if the worker is gone
    /// or died mid-call, or [`OdbcMiddlewareError::CallTimeout`] when the configured bound
    /// elapses first.
    pub async fn run<F, R>(&self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut S) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        self.run_bounded(func, self.call_timeout).await
    }

    /// Like [`run`](Self::run) but ignoring the call timeout, for calls that must be
    /// waited out (closing the native handles).
    ///
    /// # Errors
    /// Returns whatever `func` returns, or [`OdbcMiddlewareError::Worker`].
    pub async fn run_to_completion<F, R>(&self, func: F) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut S) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        self.run_bounded(func, None).await
    }

    async fn run_bounded<F, R>(
        &self,
        func: F,
        limit: Option<Duration>,
    ) -> Result<R, OdbcMiddlewareError>
    where
        F: FnOnce(&mut S) -> Result<R, OdbcMiddlewareError> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |state, in_flight| {
            let result = func(state);
            drop(in_flight);
            let _ = tx.send(result);
        })?;
        tracing::trace!(worker = %self.name, "call submitted");

        let reply = match limit {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| OdbcMiddlewareError::CallTimeout(limit))?,
            None => rx.await,
        };
        reply.map_err(|_| {
            OdbcMiddlewareError::Worker(format!("{} dropped the call before replying", self.name))
        })?
    }

    /// Queue `func` without waiting for it.
    ///
    /// # Errors
    /// Returns [`OdbcMiddlewareError::Worker`] if the worker has already stopped.
    pub fn submit<F>(&self, func: F) -> Result<(), OdbcMiddlewareError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.enqueue(move |state, _in_flight| func(state))
    }

    /// Queue `func`, then run `then` on the worker once `func` no longer counts as in flight.
    ///
    /// `then` is dropped unrun if the worker has already stopped.
    ///
    /// # Errors
    /// Returns [`OdbcMiddlewareError::Worker`] if the worker has already stopped.
    pub fn submit_then<F, T>(&self, func: F, then: T) -> Result<(), OdbcMiddlewareError>
    where
        F: FnOnce(&mut S) + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        self.enqueue(move |state, in_flight| {
            func(state);
            drop(in_flight);
            then();
        })
    }

    fn enqueue<F>(&self, func: F) -> Result<(), OdbcMiddlewareError>
    where
        F: FnOnce(&mut S, InFlight) + Send + 'static,
    {
        // Dropping the job unrun (send failure) releases the counter too.
        let in_flight = InFlight::enter(&self.in_flight);
        let job: Job<S> = Box::new(move |state| func(state, in_flight));
        self.sender
            .send(Command::Run(job))
            .map_err(|_| OdbcMiddlewareError::Worker(format!("{} is closed", self.name)))
    }

    /// Ask the worker to exit once the calls already queued have run.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

impl<S: 'static> Drop for Bridge<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: 'static> std::fmt::Debug for Bridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Counts a call from submission until its job is run or discarded.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
