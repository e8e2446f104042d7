/// Unit of work shipped to a worker: runs against the thread-owned state exactly once.
pub(super) type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub(super) enum Command<S> {
    Run(Job<S>),
    Shutdown,
}
