//! Target-layer error types

use protocol::UsbError;
use thiserror::Error;

/// Errors returned by the target layer
///
/// Transport failures are carried through unchanged in `Transport`; every
/// other variant is raised by the target layer itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// The underlying transport call failed
    #[error("Transport error: {0}")]
    Transport(UsbError),

    /// A descriptor buffer or interface/pipe array could not be allocated
    #[error("Insufficient resources")]
    ResourceExhausted,

    /// The device reported no interfaces after configuration selection
    #[error("Invalid device state: {0}")]
    InvalidDeviceState(String),

    /// Interface index out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// No pipe matches the endpoint address
    #[error("Endpoint {endpoint:#04x} not found")]
    NotFound { endpoint: u8 },

    /// Caller buffer cannot hold the configuration descriptor
    #[error("Buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    /// Transport succeeded but reported an empty configuration descriptor
    #[error("Invalid configuration descriptor")]
    InvalidConfigurationDescriptor,

    /// In-flight transfers did not drain before reconfiguration
    #[error("Interface {interface} busy: {outstanding} transfers still in flight")]
    Busy { interface: u8, outstanding: usize },

    /// Request was released without being given a terminal status
    #[error("Request cancelled")]
    Cancelled,
}

impl From<UsbError> for TargetError {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::NoMemory => TargetError::ResourceExhausted,
            other => TargetError::Transport(other),
        }
    }
}

/// Type alias for target results
pub type Result<T> = std::result::Result<T, TargetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_passes_through() {
        assert_eq!(
            TargetError::from(UsbError::Pipe),
            TargetError::Transport(UsbError::Pipe)
        );
        assert_eq!(
            TargetError::from(UsbError::Other {
                message: "babble".to_string()
            }),
            TargetError::Transport(UsbError::Other {
                message: "babble".to_string()
            })
        );
    }

    #[test]
    fn test_allocation_failure_is_resource_exhausted() {
        assert_eq!(
            TargetError::from(UsbError::NoMemory),
            TargetError::ResourceExhausted
        );
    }

    #[test]
    fn test_error_display() {
        let msg = TargetError::NotFound { endpoint: 0x99 }.to_string();
        assert!(msg.contains("0x99"));

        let msg = TargetError::BufferTooSmall { required: 34 }.to_string();
        assert!(msg.contains("34 bytes"));
    }
}
