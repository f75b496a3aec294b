//! Cooperative cancellation for runs and stage attempts.

mod token;

pub use token::{CancelCallback, CancellationToken};
