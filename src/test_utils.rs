//! Test utilities: an in-memory driver with fault injection.
//!
//! Enabled with the `test-utils` feature and always under `cfg(test)`.

mod memory;

pub use memory::{MemoryDriver, MemoryEvent};
