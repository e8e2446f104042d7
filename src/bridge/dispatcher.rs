use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;

use super::channel::Command;

/// Serve commands until shutdown, the last sender going away, or a job panicking.
///
/// The state is dropped on this thread when the loop ends, which is where native
/// handles get released.
pub(super) fn run_worker<S>(name: &str, mut state: S, receiver: &Receiver<Command<S>>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run(job) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state)));
                if outcome.is_err() {
                    // The job's reply channel was dropped during unwinding, so the caller
                    // already sees a worker failure. The state may be half-updated; stop.
                    tracing::error!(worker = name, "native call panicked; stopping worker");
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
    tracing::trace!(worker = name, "worker exiting");
    drop(state);
}
