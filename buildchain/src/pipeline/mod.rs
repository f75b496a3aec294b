//! Dependency resolution and retry backoff.
//!
//! This module provides:
//! - Topological ordering and cycle detection
//! - Precomputed upstream/downstream adjacency
//! - Backoff for stages that declare a retry count

mod dag;
mod retry;

pub use dag::{resolve, DependencyResolver};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
