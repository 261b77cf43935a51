//! Transport seam
//!
//! The target layer never talks to USB hardware directly. Everything it
//! needs from the stack underneath (host controller driver, libusb, a
//! simulated device) goes through the [`Transport`] trait, which hands out
//! opaque handles in the style of a kernel USB target API.

use crate::request::{InFlightRequest, Request, TransferOffset};
use bytes::BytesMut;
use protocol::{DeviceDescriptor, PipeInfo, RequestId, SetupPacket, UsbError};

/// USBD client contract version 6.02 (Windows 8 and later stacks)
pub const USBD_CLIENT_CONTRACT_VERSION_602: u32 = 0x0000_0602;

/// Lower-level device target, owned by a `UsbTargetDevice`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u64);

/// Lower-level interface, owned by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceHandle(pub u64);

/// Lower-level pipe of the interface's current alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeHandle(pub u64);

/// Transport-allocated transfer descriptor (URB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbHandle(pub u64);

/// Where an asynchronous request is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoTarget {
    /// Device-wide default control pipe
    Device(TargetHandle),
    /// A configured bulk/interrupt pipe
    Pipe(PipeHandle),
}

/// How the configuration is selected at target creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSelection {
    /// Every interface of the first configuration, each on its default setting
    AllInterfacesDefaultSettings,
}

/// Returned by [`Transport::send`] when the request could not be queued
///
/// Ownership of the request goes back to the sender so it can complete it.
#[derive(Debug)]
pub struct SendError {
    pub request: InFlightRequest,
    pub error: UsbError,
}

/// USB stack underneath the target layer
///
/// Synchronous methods block the calling thread until the stack is done
/// and must not be called from a context that cannot block.
pub trait Transport: Send + Sync {
    /// Create the device target with the given client contract version
    fn create_target(&self, client_contract_version: u32) -> Result<TargetHandle, UsbError>;

    /// Release a target created by `create_target`
    fn delete_target(&self, target: TargetHandle);

    fn select_configuration(
        &self,
        target: TargetHandle,
        selection: ConfigSelection,
    ) -> Result<(), UsbError>;

    /// Number of interfaces in the selected configuration
    fn interface_count(&self, target: TargetHandle) -> u8;

    fn interface(&self, target: TargetHandle, index: u8) -> Option<InterfaceHandle>;

    /// Select an alternate setting; the interface's pipes are replaced on success
    fn select_setting(&self, interface: InterfaceHandle, alt_setting: u8) -> Result<(), UsbError>;

    /// Setting the hardware is currently on, if the stack can tell
    fn current_setting(&self, _interface: InterfaceHandle) -> Option<u8> {
        None
    }

    /// Number of pipes configured for the current alternate setting
    fn configured_pipe_count(&self, interface: InterfaceHandle) -> u8;

    fn configured_pipe(
        &self,
        interface: InterfaceHandle,
        index: u8,
    ) -> Option<(PipeHandle, PipeInfo)>;

    /// Stop validating transfer sizes against wMaxPacketSize on this pipe
    fn disable_max_packet_size_check(&self, pipe: PipeHandle);

    fn device_descriptor(&self, target: TargetHandle) -> DeviceDescriptor;

    fn allocate_urb(&self, target: TargetHandle) -> Result<UrbHandle, UsbError>;

    fn free_urb(&self, urb: UrbHandle);

    /// Run a control-in URB to completion, returning the bytes transferred
    fn send_urb_synchronously(
        &self,
        target: TargetHandle,
        urb: UrbHandle,
        setup: &SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Format `request` as a read of `pipe` into `buffer`
    fn format_pipe_read(
        &self,
        pipe: PipeHandle,
        request: &mut Request,
        buffer: BytesMut,
    ) -> Result<(), UsbError>;

    /// Format `request` as a write of `buffer` to `pipe`
    fn format_pipe_write(
        &self,
        pipe: PipeHandle,
        request: &mut Request,
        buffer: BytesMut,
    ) -> Result<(), UsbError>;

    /// Format `request` as a control transfer on the default pipe
    fn format_control_transfer(
        &self,
        target: TargetHandle,
        request: &mut Request,
        setup: SetupPacket,
        data: BytesMut,
        offset: Option<TransferOffset>,
    ) -> Result<(), UsbError>;

    /// Queue a formatted request; its completion is delivered later
    fn send(&self, io_target: IoTarget, request: InFlightRequest) -> Result<(), SendError>;

    /// Cancel everything in flight on `pipe` and wait until it has completed
    fn abort_pipe_synchronously(
        &self,
        pipe: PipeHandle,
        request: Option<RequestId>,
    ) -> Result<(), UsbError>;
}
