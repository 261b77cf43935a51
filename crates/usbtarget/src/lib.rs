//! USB target layer for usbtarget
//!
//! This crate models one redirected USB device as a tree: a
//! [`UsbTargetDevice`] owns the device's [`FunctionalInterface`]s, and each
//! interface owns the [`EndpointChannel`]s of its current alternate setting.
//! Requests coming from the dispatch layer are routed by endpoint address to
//! the right channel, or sent on the default control pipe.
//!
//! Everything below the target layer sits behind the [`Transport`] trait.
//! [`sim::SimulatedTransport`] is an in-memory implementation used by the
//! tests and the probe's simulated mode.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use usbtarget::sim::{SimulatedDevice, SimulatedTransport};
//! use usbtarget::{TargetOptions, UsbTargetDevice};
//!
//! let transport = Arc::new(SimulatedTransport::new(SimulatedDevice::mass_storage()));
//! let device = UsbTargetDevice::create(transport, &TargetOptions::default()).unwrap();
//!
//! let mut buffer = vec![0u8; 256];
//! let len = device.configuration_descriptor(0, &mut buffer).unwrap();
//! assert_eq!(buffer[1], 0x02);
//! assert!(len > 9);
//! assert!(device.find_pipe_by_endpoint_address(0x81).is_some());
//! ```

pub mod device;
pub mod error;
pub mod interface;
pub mod pipe;
pub mod request;
pub mod sim;
pub mod transport;
pub mod urb;

pub use device::{TargetOptions, UsbTargetDevice};
pub use error::{Result, TargetError};
pub use interface::{AltSetting, FunctionalInterface, InterfaceSnapshot};
pub use pipe::EndpointChannel;
pub use request::{Completion, CompletionFuture, InFlightRequest, Request, Transfer, TransferOffset};
pub use transport::{
    ConfigSelection, InterfaceHandle, IoTarget, PipeHandle, SendError, TargetHandle, Transport,
    USBD_CLIENT_CONTRACT_VERSION_602, UrbHandle,
};
pub use urb::{PreparedDescriptorRequest, TransferDescriptorBuilder};
