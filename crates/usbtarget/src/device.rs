//! USB target device
//!
//! [`UsbTargetDevice`] is the entry point the dispatch layer talks to. It
//! owns the lower-level target handle and the interfaces of the selected
//! configuration, answers descriptor queries and routes pipe and control
//! I/O to the right place.

use crate::error::{Result, TargetError};
use crate::interface::{FunctionalInterface, InterfaceSnapshot, PipeRef};
use crate::pipe::EndpointChannel;
use crate::request::{Request, TransferOffset};
use crate::transport::{
    ConfigSelection, IoTarget, TargetHandle, Transport, USBD_CLIENT_CONTRACT_VERSION_602,
};
use crate::urb::TransferDescriptorBuilder;
use bytes::BytesMut;
use protocol::{
    CONFIGURATION_DESCRIPTOR_LEN, DescriptorType, DeviceDescriptor, SetupPacket,
    configuration_total_length,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Options applied when a target device is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOptions {
    /// USBD client contract version passed to target creation
    #[serde(default = "TargetOptions::default_client_contract_version")]
    pub client_contract_version: u32,
    /// How long an alternate-setting change waits for in-flight transfers
    #[serde(default = "TargetOptions::default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            client_contract_version: Self::default_client_contract_version(),
            quiesce_timeout_ms: Self::default_quiesce_timeout_ms(),
        }
    }
}

impl TargetOptions {
    fn default_client_contract_version() -> u32 {
        USBD_CLIENT_CONTRACT_VERSION_602
    }

    fn default_quiesce_timeout_ms() -> u64 {
        5000
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }
}

/// Target handle released exactly once, however `create` or the device ends
struct OwnedTarget {
    transport: Arc<dyn Transport>,
    handle: TargetHandle,
}

impl Drop for OwnedTarget {
    fn drop(&mut self) {
        debug!("Releasing USB target {:?}", self.handle);
        self.transport.delete_target(self.handle);
    }
}

/// One USB device, as a tree of interfaces and endpoint channels
pub struct UsbTargetDevice {
    // Declared first so interfaces are dropped before the target they live on
    interfaces: Vec<FunctionalInterface>,
    target: OwnedTarget,
}

impl UsbTargetDevice {
    /// Create the target, select the configuration and build every interface
    ///
    /// Interfaces are created in index order, each on alternate setting 0.
    /// The first failure aborts creation; whatever was built so far,
    /// including the target handle, is released on the way out.
    pub fn create(transport: Arc<dyn Transport>, options: &TargetOptions) -> Result<Self> {
        let handle = transport
            .create_target(options.client_contract_version)
            .map_err(|e| {
                error!("Cannot create USB target: {}", e);
                TargetError::from(e)
            })?;
        let target = OwnedTarget { transport, handle };

        target
            .transport
            .select_configuration(handle, ConfigSelection::AllInterfacesDefaultSettings)
            .map_err(|e| {
                error!("Cannot apply device configuration: {}", e);
                TargetError::from(e)
            })?;

        let count = target.transport.interface_count(handle);
        if count == 0 {
            error!("Device reports zero interfaces");
            return Err(TargetError::InvalidDeviceState(
                "configuration has no interfaces".to_string(),
            ));
        }

        let mut interfaces = Vec::new();
        if interfaces.try_reserve_exact(usize::from(count)).is_err() {
            error!("Failed to allocate {} interfaces", count);
            return Err(TargetError::ResourceExhausted);
        }

        for index in 0..count {
            let interface = FunctionalInterface::create(
                target.transport.as_ref(),
                handle,
                index,
                options.quiesce_timeout(),
            )
            .map_err(|e| {
                error!("Cannot create interface {}: {}", index, e);
                e
            })?;
            interfaces.push(interface);
        }

        info!("USB target {:?} ready with {} interfaces", handle, count);
        Ok(Self { interfaces, target })
    }

    fn transport(&self) -> &dyn Transport {
        self.target.transport.as_ref()
    }

    pub fn target_handle(&self) -> TargetHandle {
        self.target.handle
    }

    pub fn interface_count(&self) -> u8 {
        // Bounded by the u8 count the transport reported at creation
        self.interfaces.len() as u8
    }

    pub fn interface(&self, index: u8) -> Option<&FunctionalInterface> {
        self.interfaces.get(usize::from(index))
    }

    pub fn interfaces(&self) -> &[FunctionalInterface] {
        &self.interfaces
    }

    /// Current setting and pipes of every interface
    pub fn endpoints(&self) -> Vec<InterfaceSnapshot> {
        self.interfaces.iter().map(|i| i.snapshot()).collect()
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.transport().device_descriptor(self.target.handle)
    }

    /// Read configuration descriptor `index` into `buffer`
    ///
    /// The header is fetched first to learn wTotalLength. If `buffer` is
    /// shorter than that, `BufferTooSmall` reports the size needed and
    /// `buffer` is left untouched. Otherwise the buffer is zeroed, the
    /// full descriptor read into its start, and its length returned.
    pub fn configuration_descriptor(&self, index: u8, buffer: &mut [u8]) -> Result<usize> {
        let mut urb = TransferDescriptorBuilder::create(self.transport(), self.target.handle)?;

        let mut header = [0u8; CONFIGURATION_DESCRIPTOR_LEN];
        let status = urb
            .build_descriptor_request(DescriptorType::Configuration, index, &mut header)
            .send_synchronously();

        let total_length = usize::from(configuration_total_length(&header));
        if total_length == 0 {
            error!(
                "Cannot query configuration descriptor {} length: {:?}",
                index, status
            );
            return Err(status
                .err()
                .unwrap_or(TargetError::InvalidConfigurationDescriptor));
        }

        if buffer.len() < total_length {
            debug!(
                "Configuration descriptor {} needs {} bytes, caller has {}",
                index,
                total_length,
                buffer.len()
            );
            return Err(TargetError::BufferTooSmall {
                required: total_length,
            });
        }

        buffer.fill(0);
        let descriptor = &mut buffer[..total_length];
        let status = urb
            .build_descriptor_request(DescriptorType::Configuration, index, descriptor)
            .send_synchronously();

        match status {
            Err(e) => {
                error!("Cannot query configuration descriptor {}: {}", index, e);
                Err(e)
            }
            Ok(_) if configuration_total_length(&buffer[..total_length]) == 0 => {
                error!(
                    "Configuration descriptor {} came back with zero length",
                    index
                );
                Err(TargetError::InvalidConfigurationDescriptor)
            }
            Ok(_) => Ok(total_length),
        }
    }

    /// Select `alt_setting` on interface `interface_index`
    pub fn set_interface_alt_setting(&self, interface_index: u8, alt_setting: u8) -> Result<()> {
        let interface = self.interface(interface_index).ok_or_else(|| {
            error!(
                "Interface index {} out of range ({} interfaces)",
                interface_index,
                self.interfaces.len()
            );
            TargetError::InvalidParameter(format!(
                "interface index {} out of range",
                interface_index
            ))
        })?;

        interface.set_alt_setting(self.transport(), alt_setting)
    }

    /// First channel with `endpoint_address`, scanning interfaces in order
    pub fn find_pipe_by_endpoint_address(
        &self,
        endpoint_address: u8,
    ) -> Option<Arc<EndpointChannel>> {
        self.lock_pipe(endpoint_address).map(|pipe| pipe.channel())
    }

    fn lock_pipe(&self, endpoint_address: u8) -> Option<PipeRef<'_>> {
        self.interfaces
            .iter()
            .find_map(|i| i.lock_pipe(endpoint_address))
    }

    /// Read from `endpoint_address` into `buffer`
    ///
    /// An unknown endpoint completes the request with `NotFound` before
    /// this returns.
    pub fn read_pipe_async(&self, request: Request, endpoint_address: u8, buffer: BytesMut) {
        match self.lock_pipe(endpoint_address) {
            Some(pipe) => pipe.read_async(self.transport(), request, buffer),
            None => {
                error!("Read failed: pipe {:#04x} not found", endpoint_address);
                request.complete(Err(TargetError::NotFound {
                    endpoint: endpoint_address,
                }));
            }
        }
    }

    /// Write `buffer` to `endpoint_address`
    ///
    /// Same completion rules as [`read_pipe_async`](Self::read_pipe_async).
    pub fn write_pipe_async(&self, request: Request, endpoint_address: u8, buffer: BytesMut) {
        match self.lock_pipe(endpoint_address) {
            Some(pipe) => pipe.write_async(self.transport(), request, buffer),
            None => {
                error!("Write failed: pipe {:#04x} not found", endpoint_address);
                request.complete(Err(TargetError::NotFound {
                    endpoint: endpoint_address,
                }));
            }
        }
    }

    /// Abort everything in flight on `endpoint_address`
    pub fn abort_pipe(&self, request: &Request, endpoint_address: u8) -> Result<()> {
        match self.lock_pipe(endpoint_address) {
            Some(pipe) => pipe.abort(self.transport(), Some(request)),
            None => {
                error!("Abort failed: pipe {:#04x} not found", endpoint_address);
                Err(TargetError::NotFound {
                    endpoint: endpoint_address,
                })
            }
        }
    }

    /// Send a control transfer on the device's default pipe
    ///
    /// Unlike pipe I/O, a formatting failure is only returned: the request
    /// is neither completed nor detached and stays with the caller. A
    /// successful send detaches it; a failed send returns the failure and
    /// leaves it with the caller carrying that status.
    pub fn control_transfer_async(
        &self,
        request: &mut Request,
        setup: SetupPacket,
        data: BytesMut,
        offset: Option<TransferOffset>,
    ) -> Result<()> {
        let handle = self.target.handle;
        if let Err(e) = self
            .transport()
            .format_control_transfer(handle, request, setup, data, offset)
        {
            error!("Format control transfer failed: {}", e);
            return Err(TargetError::from(e));
        }

        request
            .send_with_completion(self.transport(), IoTarget::Device(handle), None)
            .map_err(|e| {
                error!("Send control transfer failed: {}", e);
                e
            })
    }
}

impl std::fmt::Debug for UsbTargetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTargetDevice")
            .field("target", &self.target.handle)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}
