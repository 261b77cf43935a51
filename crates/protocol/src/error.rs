//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding USB wire structures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the structure being decoded
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// bDescriptorType did not match the structure being decoded
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptorType { expected: u8, found: u8 },

    /// bLength is shorter than the fixed part of the descriptor
    #[error("Invalid descriptor length {length} (minimum {minimum})")]
    InvalidLength { length: u8, minimum: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnexpectedDescriptorType {
            expected: 0x02,
            found: 0x04,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unexpected descriptor type"));
        assert!(msg.contains("0x04"));
        assert!(msg.contains("0x02"));
    }

    #[test]
    fn test_buffer_too_small_error() {
        let err = ProtocolError::BufferTooSmall {
            needed: 9,
            available: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Buffer too small"));
    }
}
