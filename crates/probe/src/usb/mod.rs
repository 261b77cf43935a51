//! USB subsystem
//!
//! Real-device backend for the target layer. The device handle lives on a
//! dedicated worker thread; [`RusbTransport`] implements the target layer's
//! transport seam by forwarding work to it over a channel bridge.

pub mod bridge;
pub mod device;
pub mod transfers;
pub mod transport;
pub mod worker;

pub use device::{DeviceSummary, list_devices};
pub use transport::RusbTransport;
