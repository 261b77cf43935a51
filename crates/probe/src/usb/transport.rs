//! libusb-backed [`Transport`]
//!
//! Handles (target, interfaces, pipes, URBs) are bookkeeping local to
//! this process; everything that touches the device is forwarded to the
//! USB worker thread over the channel bridge.

use crate::usb::bridge::{InterfaceLayout, Submission, UsbBridge, WorkerCommand, create_usb_bridge};
use crate::usb::device::find_device;
use crate::usb::worker::spawn_usb_worker;
use anyhow::{Context as _, Result};
use bytes::BytesMut;
use protocol::{DeviceDescriptor, PipeInfo, RequestId, SetupPacket, UsbError};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use usbtarget::{
    ConfigSelection, InFlightRequest, InterfaceHandle, IoTarget, PipeHandle, Request, SendError,
    TargetHandle, Transfer, TransferOffset, Transport, UrbHandle,
};

/// GET_INTERFACE, device-to-host, standard, recipient interface
const GET_INTERFACE_REQUEST_TYPE: u8 = 0x81;
const REQUEST_GET_INTERFACE: u8 = 0x0a;

#[derive(Debug)]
struct InterfaceState {
    handle: InterfaceHandle,
    layout: InterfaceLayout,
    current: u8,
    pipes: Vec<(PipeHandle, PipeInfo)>,
}

#[derive(Debug, Default)]
struct TransportState {
    next_handle: u64,
    target: Option<TargetHandle>,
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceState>,
    urbs: HashSet<UrbHandle>,
    unchecked_pipes: HashSet<PipeHandle>,
}

impl TransportState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn interface(&self, handle: InterfaceHandle) -> Option<&InterfaceState> {
        self.interfaces.iter().find(|i| i.handle == handle)
    }

    fn pipe_info(&self, pipe: PipeHandle) -> Option<PipeInfo> {
        self.interfaces
            .iter()
            .flat_map(|i| i.pipes.iter())
            .find(|(handle, _)| *handle == pipe)
            .map(|(_, info)| *info)
    }

    fn allocate_pipes(&mut self, pipes: &[PipeInfo]) -> Vec<(PipeHandle, PipeInfo)> {
        pipes
            .iter()
            .map(|info| (PipeHandle(self.allocate_handle()), *info))
            .collect()
    }
}

/// [`Transport`] driving a real device through libusb
pub struct RusbTransport {
    bridge: UsbBridge,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<TransportState>,
}

impl RusbTransport {
    /// Find the device matching `filter` and start its worker thread
    pub fn open(filter: Option<&str>, timeout: Duration) -> Result<Self> {
        let context = rusb::Context::new().context("Failed to create libusb context")?;
        let device = find_device(&context, filter).with_context(|| match filter {
            Some(filter) => format!("No USB device matches '{}'", filter),
            None => "No USB device found".to_string(),
        })?;

        info!(
            "Using device on bus {:03} address {:03}",
            device.bus_number(),
            device.device_address()
        );

        let (bridge, worker) = create_usb_bridge();
        let handle = spawn_usb_worker(worker, device, timeout)
            .context("Failed to spawn USB worker thread")?;

        let mut transport = Self::with_bridge(bridge);
        transport.worker = Mutex::new(Some(handle));
        Ok(transport)
    }

    /// Transport over an already-running worker
    pub fn with_bridge(bridge: UsbBridge) -> Self {
        Self {
            bridge,
            worker: Mutex::new(None),
            state: Mutex::new(TransportState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control_in(&self, setup: SetupPacket, length: usize) -> Result<Vec<u8>, UsbError> {
        self.bridge
            .request(|response| WorkerCommand::ControlIn {
                setup,
                length,
                response,
            })
            .map_err(worker_gone)?
    }
}

fn worker_gone(err: common::Error) -> UsbError {
    warn!("USB worker unavailable: {}", err);
    UsbError::NoDevice
}

impl Transport for RusbTransport {
    fn create_target(&self, client_contract_version: u32) -> Result<TargetHandle, UsbError> {
        if self.state().target.is_some() {
            return Err(UsbError::Busy);
        }

        debug!(
            "Creating target with client contract version {:#x}",
            client_contract_version
        );
        let descriptor = self
            .bridge
            .request(|response| WorkerCommand::OpenTarget { response })
            .map_err(worker_gone)??;

        let mut state = self.state();
        let target = TargetHandle(state.allocate_handle());
        state.target = Some(target);
        state.descriptor = descriptor;
        Ok(target)
    }

    fn delete_target(&self, target: TargetHandle) {
        {
            let mut state = self.state();
            if state.target != Some(target) {
                return;
            }
            state.target = None;
            state.interfaces.clear();
            state.unchecked_pipes.clear();
        }

        if let Err(e) = self
            .bridge
            .request(|response| WorkerCommand::CloseTarget { response })
        {
            debug!("Target {:?} closed without worker: {}", target, e);
        }
    }

    fn select_configuration(
        &self,
        target: TargetHandle,
        _selection: ConfigSelection,
    ) -> Result<(), UsbError> {
        if self.state().target != Some(target) {
            return Err(UsbError::InvalidParam);
        }

        let layout = self
            .bridge
            .request(|response| WorkerCommand::ReadConfiguration { response })
            .map_err(worker_gone)??;

        let mut state = self.state();
        let mut interfaces = Vec::with_capacity(layout.len());
        for interface in layout {
            let handle = InterfaceHandle(state.allocate_handle());
            let default_pipes = interface.pipes_for(0).unwrap_or_default().to_vec();
            let pipes = state.allocate_pipes(&default_pipes);
            interfaces.push(InterfaceState {
                handle,
                layout: interface,
                current: 0,
                pipes,
            });
        }

        debug!("Selected configuration with {} interfaces", interfaces.len());
        state.interfaces = interfaces;
        Ok(())
    }

    fn interface_count(&self, _target: TargetHandle) -> u8 {
        u8::try_from(self.state().interfaces.len()).unwrap_or(u8::MAX)
    }

    fn interface(&self, _target: TargetHandle, index: u8) -> Option<InterfaceHandle> {
        self.state()
            .interfaces
            .get(usize::from(index))
            .map(|i| i.handle)
    }

    fn select_setting(&self, interface: InterfaceHandle, alt_setting: u8) -> Result<(), UsbError> {
        let (number, pipes) = {
            let state = self.state();
            let iface = state.interface(interface).ok_or(UsbError::NotFound)?;
            let pipes = iface
                .layout
                .pipes_for(alt_setting)
                .ok_or(UsbError::InvalidParam)?
                .to_vec();
            (iface.layout.number, pipes)
        };

        self.bridge
            .request(|response| WorkerCommand::SetAltSetting {
                interface_number: number,
                alt_setting,
                response,
            })
            .map_err(worker_gone)??;

        let mut state = self.state();
        let pipes = state.allocate_pipes(&pipes);
        if let Some(iface) = state.interfaces.iter_mut().find(|i| i.handle == interface) {
            iface.current = alt_setting;
            iface.pipes = pipes;
        }
        Ok(())
    }

    fn current_setting(&self, interface: InterfaceHandle) -> Option<u8> {
        let number = self.state().interface(interface)?.layout.number;
        let setup = SetupPacket {
            request_type: GET_INTERFACE_REQUEST_TYPE,
            request: REQUEST_GET_INTERFACE,
            value: 0,
            index: u16::from(number),
            length: 1,
        };

        match self.control_in(setup, 1) {
            Ok(data) => data.first().copied(),
            Err(e) => {
                debug!("GET_INTERFACE on interface {} failed: {}", number, e);
                None
            }
        }
    }

    fn configured_pipe_count(&self, interface: InterfaceHandle) -> u8 {
        self.state()
            .interface(interface)
            .map_or(0, |i| u8::try_from(i.pipes.len()).unwrap_or(u8::MAX))
    }

    fn configured_pipe(
        &self,
        interface: InterfaceHandle,
        index: u8,
    ) -> Option<(PipeHandle, PipeInfo)> {
        self.state()
            .interface(interface)
            .and_then(|i| i.pipes.get(usize::from(index)).copied())
    }

    fn disable_max_packet_size_check(&self, pipe: PipeHandle) {
        // libusb never checks transfer sizes; only recorded
        self.state().unchecked_pipes.insert(pipe);
    }

    fn device_descriptor(&self, _target: TargetHandle) -> DeviceDescriptor {
        self.state().descriptor
    }

    fn allocate_urb(&self, _target: TargetHandle) -> Result<UrbHandle, UsbError> {
        let mut state = self.state();
        let urb = UrbHandle(state.allocate_handle());
        state.urbs.insert(urb);
        Ok(urb)
    }

    fn free_urb(&self, urb: UrbHandle) {
        self.state().urbs.remove(&urb);
    }

    fn send_urb_synchronously(
        &self,
        _target: TargetHandle,
        urb: UrbHandle,
        setup: &SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError> {
        if !self.state().urbs.contains(&urb) {
            return Err(UsbError::InvalidParam);
        }
        if !setup.is_in() {
            return Err(UsbError::InvalidParam);
        }

        let data = self.control_in(*setup, buffer.len())?;
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn format_pipe_read(
        &self,
        pipe: PipeHandle,
        request: &mut Request,
        buffer: BytesMut,
    ) -> Result<(), UsbError> {
        let info = self.state().pipe_info(pipe).ok_or(UsbError::InvalidParam)?;
        if !info.is_in() {
            return Err(UsbError::InvalidParam);
        }
        request.attach_transfer(Transfer::Read { pipe, buffer });
        Ok(())
    }

    fn format_pipe_write(
        &self,
        pipe: PipeHandle,
        request: &mut Request,
        buffer: BytesMut,
    ) -> Result<(), UsbError> {
        let info = self.state().pipe_info(pipe).ok_or(UsbError::InvalidParam)?;
        if info.is_in() {
            return Err(UsbError::InvalidParam);
        }
        request.attach_transfer(Transfer::Write { pipe, buffer });
        Ok(())
    }

    fn format_control_transfer(
        &self,
        target: TargetHandle,
        request: &mut Request,
        setup: SetupPacket,
        data: BytesMut,
        offset: Option<TransferOffset>,
    ) -> Result<(), UsbError> {
        if offset.is_some_and(|o| o.range(data.len()).is_none()) {
            return Err(UsbError::InvalidParam);
        }
        request.attach_transfer(Transfer::Control {
            target,
            setup,
            data,
            offset,
        });
        Ok(())
    }

    fn send(&self, io_target: IoTarget, request: InFlightRequest) -> Result<(), SendError> {
        let endpoint = match io_target {
            IoTarget::Device(_) => None,
            IoTarget::Pipe(pipe) => match self.state().pipe_info(pipe) {
                Some(info) => Some(info),
                None => {
                    return Err(SendError {
                        request,
                        error: UsbError::InvalidParam,
                    });
                }
            },
        };

        self.bridge
            .submit(Submission { endpoint, request })
            .map_err(|submission| {
                warn!("USB worker gone, request {:?} not queued", submission.request.id());
                SendError {
                    request: submission.request,
                    error: UsbError::NoDevice,
                }
            })
    }

    fn abort_pipe_synchronously(
        &self,
        pipe: PipeHandle,
        request: Option<RequestId>,
    ) -> Result<(), UsbError> {
        let info = self.state().pipe_info(pipe).ok_or(UsbError::InvalidParam)?;
        let cancelled = self
            .bridge
            .request(|response| WorkerCommand::Abort {
                endpoint_address: info.endpoint_address,
                response,
            })
            .map_err(worker_gone)?;

        debug!(
            "Abort on endpoint {:#04x} (request {:?}) cancelled {} transfers",
            info.endpoint_address, request, cancelled
        );
        Ok(())
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = self.bridge.send_command(WorkerCommand::Shutdown) {
                debug!("USB worker already stopped: {}", e);
            }
            if handle.join().is_err() {
                warn!("USB worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for RusbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("RusbTransport")
            .field("target", &state.target)
            .field("interfaces", &state.interfaces.len())
            .field("live_urbs", &state.urbs.len())
            .field("unchecked_pipes", &state.unchecked_pipes.len())
            .finish()
    }
}
