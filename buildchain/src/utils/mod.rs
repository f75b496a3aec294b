//! Utility functions for id generation and timestamp handling.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{duration_ms, iso_timestamp, now_utc, Timestamp};
pub use uuid_utils::generate_uuid_v7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_v7_is_valid() {
        let id = generate_uuid_v7();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.contains(':'));
    }
}
