//! USB wire types for usbtarget
//!
//! This crate defines the pieces of the USB protocol the target layer
//! speaks directly: setup packets, the standard descriptor types, the
//! device descriptor and configuration descriptor header layouts, pipe
//! metadata and transport status codes.
//!
//! # Example
//!
//! ```
//! use protocol::{DescriptorType, SetupPacket};
//!
//! // Ask for the 9-byte header of configuration 0
//! let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 0, 9);
//! assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00]);
//! ```

pub mod descriptors;
pub mod error;
pub mod types;

pub use descriptors::{
    CONFIGURATION_DESCRIPTOR_LEN, ConfigurationDescriptorHeader, DEVICE_DESCRIPTOR_LEN,
    DescriptorType, DeviceDescriptor, REQUEST_GET_DESCRIPTOR, REQUEST_SET_INTERFACE,
    configuration_total_length,
};
pub use error::{ProtocolError, Result};
pub use types::{
    DIRECTION_IN, PipeInfo, PipeType, RequestId, SETUP_PACKET_LEN, SetupPacket, UsbError,
    is_in_endpoint,
};
