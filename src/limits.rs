//! Shared hard limits to prevent unbounded allocations or payload growth.

use crate::error::RemoteError;

/// Maximum allowed frame payload in bytes (default: 16MB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
/// Size of the big-endian length prefix in front of every stream frame.
pub const FRAME_HEADER_BYTES: usize = 4;
/// Default number of noblock replies a client keeps before evicting the oldest.
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 1024;
/// Payloads queued for one dedicated event subscriber before new ones are dropped.
pub const DEDICATED_QUEUE_CAPACITY: usize = 256;

/// Validate a frame length announced by a peer (or about to be written).
pub fn validate_frame_len(len: usize, max_bytes: usize) -> Result<(), RemoteError> {
    if len > max_bytes {
        return Err(RemoteError::Protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            len, max_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len_within_limit() {
        assert!(validate_frame_len(1024, MAX_FRAME_BYTES).is_ok());
        assert!(validate_frame_len(MAX_FRAME_BYTES, MAX_FRAME_BYTES).is_ok());
    }

    #[test]
    fn test_frame_len_over_limit() {
        let err = validate_frame_len(MAX_FRAME_BYTES + 1, MAX_FRAME_BYTES).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
