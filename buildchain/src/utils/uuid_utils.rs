//! UUID generation utilities.

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered).
///
/// Run ids use v7 so that lexical order matches creation order.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}
