//! USB request and transport status types
//!
//! This module defines the wire-level pieces every transfer is built from:
//! the 8-byte setup packet, endpoint/pipe metadata and the status codes a
//! USB transport reports back.

use crate::descriptors::{DescriptorType, REQUEST_GET_DESCRIPTOR};
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of a USB setup packet on the wire
pub const SETUP_PACKET_LEN: usize = 8;

/// Direction bit shared by bmRequestType and endpoint addresses
pub const DIRECTION_IN: u8 = 0x80;

/// Request ID for matching completions
///
/// Assigned by whoever creates the request (typically an atomic counter in
/// the dispatch layer). The target layer only carries it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// USB control setup packet
///
/// Field order and widths follow USB 2.0, section 9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Standard device-to-host GET_DESCRIPTOR request
    ///
    /// wValue carries the descriptor type in the high byte and the
    /// descriptor index in the low byte. Lengths above `u16::MAX` are
    /// clamped, the device never returns more than wLength anyway.
    pub fn get_descriptor(descriptor_type: DescriptorType, index: u8, length: usize) -> Self {
        Self {
            request_type: DIRECTION_IN,
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(descriptor_type as u8) << 8) | u16::from(index),
            index: 0,
            length: length.min(u16::MAX as usize) as u16,
        }
    }

    /// True for device-to-host requests
    pub fn is_in(&self) -> bool {
        (self.request_type & DIRECTION_IN) != 0
    }

    /// Encode into the 8-byte little-endian wire layout
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut buf = [0u8; SETUP_PACKET_LEN];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    /// Decode from the 8-byte wire layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_LEN,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

/// True if the endpoint address has the IN direction bit set
pub fn is_in_endpoint(endpoint_address: u8) -> bool {
    (endpoint_address & DIRECTION_IN) != 0
}

/// USB pipe (endpoint) transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl PipeType {
    /// Decode from the bmAttributes field of an endpoint descriptor
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => PipeType::Control,
            1 => PipeType::Isochronous,
            2 => PipeType::Bulk,
            _ => PipeType::Interrupt,
        }
    }
}

/// Metadata for one configured pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeInfo {
    /// Endpoint address, including the direction bit
    pub endpoint_address: u8,
    /// Transfer type
    pub pipe_type: PipeType,
    /// wMaxPacketSize as reported by the device
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
    /// Largest transfer the transport accepts in one request
    pub maximum_transfer_size: u32,
}

impl PipeInfo {
    /// True for IN (device-to-host) pipes
    pub fn is_in(&self) -> bool {
        is_in_endpoint(self.endpoint_address)
    }
}

/// Transport status codes
///
/// Mirrors the libusb error set (see rusb::Error) plus the two conditions
/// a redirection transport adds: allocation failure and cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    Timeout,
    /// Endpoint stalled (protocol error)
    Pipe,
    /// Device was disconnected
    NoDevice,
    /// Device or endpoint not found
    NotFound,
    /// Device is busy
    Busy,
    /// Buffer overflow
    Overflow,
    /// I/O error
    Io,
    /// Invalid parameter
    InvalidParam,
    /// Access denied (permissions)
    Access,
    /// Transport could not allocate a resource
    NoMemory,
    /// Transfer was cancelled (pipe abort)
    Cancelled,
    /// Other error with message
    Other { message: String },
}

impl std::fmt::Display for UsbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbError::Timeout => write!(f, "timed out"),
            UsbError::Pipe => write!(f, "endpoint stalled"),
            UsbError::NoDevice => write!(f, "no such device"),
            UsbError::NotFound => write!(f, "entity not found"),
            UsbError::Busy => write!(f, "resource busy"),
            UsbError::Overflow => write!(f, "overflow"),
            UsbError::Io => write!(f, "input/output error"),
            UsbError::InvalidParam => write!(f, "invalid parameter"),
            UsbError::Access => write!(f, "access denied"),
            UsbError::NoMemory => write!(f, "insufficient memory"),
            UsbError::Cancelled => write!(f, "transfer cancelled"),
            UsbError::Other { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for UsbError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_descriptor_setup_packet() {
        let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 1, 9);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0201);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 9);
        assert!(setup.is_in());
    }

    #[test]
    fn test_setup_packet_wire_layout() {
        let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 0, 0x0120);
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x20, 0x01]
        );
        assert_eq!(SetupPacket::from_bytes(&setup.to_bytes()).unwrap(), setup);
    }

    #[test]
    fn test_setup_packet_too_short() {
        let err = SetupPacket::from_bytes(&[0x80, 0x06]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: 8,
                available: 2
            }
        ));
    }

    #[test]
    fn test_get_descriptor_length_clamped() {
        let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 0, 100_000);
        assert_eq!(setup.length, u16::MAX);
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(is_in_endpoint(0x81));
        assert!(!is_in_endpoint(0x02));
    }

    #[test]
    fn test_pipe_type_from_attributes() {
        assert_eq!(PipeType::from_attributes(0x00), PipeType::Control);
        assert_eq!(PipeType::from_attributes(0x01), PipeType::Isochronous);
        assert_eq!(PipeType::from_attributes(0x02), PipeType::Bulk);
        assert_eq!(PipeType::from_attributes(0x03), PipeType::Interrupt);
        // Upper bits carry sync/usage type and must be ignored
        assert_eq!(PipeType::from_attributes(0x0d), PipeType::Isochronous);
    }

    #[test]
    fn test_usb_error_equality() {
        assert_eq!(UsbError::Timeout, UsbError::Timeout);
        assert_ne!(UsbError::Timeout, UsbError::NoDevice);
        assert_eq!(UsbError::Cancelled.to_string(), "transfer cancelled");
    }
}
