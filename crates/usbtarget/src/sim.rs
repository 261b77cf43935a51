//! Simulated USB stack
//!
//! [`SimulatedTransport`] implements [`Transport`] against an in-memory
//! device model. It backs the crate's tests and the probe's `--simulate`
//! mode. Transfers stay queued until the test completes them with
//! [`SimulatedTransport::complete_next`], unless auto-completion is on, in
//! which case writes to an OUT endpoint are looped back to reads of the IN
//! endpoint with the same number.
//!
//! Failures are injected through [`SimulatedTransport::faults`].

use crate::request::{InFlightRequest, Request, Transfer, TransferOffset};
use crate::transport::{
    ConfigSelection, InterfaceHandle, IoTarget, PipeHandle, SendError, TargetHandle, Transport,
    UrbHandle,
};
use bytes::BytesMut;
use protocol::{
    CONFIGURATION_DESCRIPTOR_LEN, ConfigurationDescriptorHeader, DescriptorType, DeviceDescriptor,
    PipeInfo, PipeType, REQUEST_GET_DESCRIPTOR, RequestId, SetupPacket, UsbError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

const INTERFACE_DESCRIPTOR_LEN: usize = 9;
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
const DEFAULT_MAXIMUM_TRANSFER_SIZE: u32 = 64 * 1024;

/// Bulk pipe with the default maximum transfer size
pub fn bulk_pipe(endpoint_address: u8, max_packet_size: u16) -> PipeInfo {
    pipe(endpoint_address, PipeType::Bulk, max_packet_size, 0)
}

/// Interrupt pipe polled every `interval` frames
pub fn interrupt_pipe(endpoint_address: u8, max_packet_size: u16, interval: u8) -> PipeInfo {
    pipe(endpoint_address, PipeType::Interrupt, max_packet_size, interval)
}

/// Isochronous pipe serviced every `interval` frames
pub fn isochronous_pipe(endpoint_address: u8, max_packet_size: u16, interval: u8) -> PipeInfo {
    pipe(
        endpoint_address,
        PipeType::Isochronous,
        max_packet_size,
        interval,
    )
}

fn pipe(endpoint_address: u8, pipe_type: PipeType, max_packet_size: u16, interval: u8) -> PipeInfo {
    PipeInfo {
        endpoint_address,
        pipe_type,
        max_packet_size,
        interval,
        maximum_transfer_size: DEFAULT_MAXIMUM_TRANSFER_SIZE,
    }
}

fn pipe_type_attributes(pipe_type: PipeType) -> u8 {
    match pipe_type {
        PipeType::Control => 0,
        PipeType::Isochronous => 1,
        PipeType::Bulk => 2,
        PipeType::Interrupt => 3,
    }
}

/// In-memory model of a device with one configuration
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub device_descriptor: DeviceDescriptor,
    /// Pipes of every alternate setting, per interface
    pub interfaces: Vec<Vec<Vec<PipeInfo>>>,
    /// Raw configuration descriptor, replacing the generated one
    pub configuration_override: Option<Vec<u8>>,
}

impl SimulatedDevice {
    pub fn new(device_descriptor: DeviceDescriptor) -> Self {
        Self {
            device_descriptor,
            interfaces: Vec::new(),
            configuration_override: None,
        }
    }

    /// Add an interface; `alt_settings[n]` lists the pipes of setting `n`
    pub fn with_interface(mut self, alt_settings: Vec<Vec<PipeInfo>>) -> Self {
        self.interfaces.push(alt_settings);
        self
    }

    /// Serve `bytes` as configuration descriptor 0
    pub fn with_configuration_descriptor(mut self, bytes: Vec<u8>) -> Self {
        self.configuration_override = Some(bytes);
        self
    }

    /// Bulk-only mass storage device: one interface, bulk IN 0x81 and OUT 0x02
    pub fn mass_storage() -> Self {
        Self::new(DeviceDescriptor {
            usb_version: 0x0200,
            max_packet_size0: 64,
            vendor_id: 0x0781,
            product_id: 0x5567,
            device_version: 0x0100,
            manufacturer_index: 1,
            product_index: 2,
            serial_number_index: 3,
            num_configurations: 1,
            ..Default::default()
        })
        .with_interface(vec![vec![bulk_pipe(0x81, 512), bulk_pipe(0x02, 512)]])
    }

    /// USB audio device whose streaming interface switches bandwidth
    ///
    /// Interface 0 is audio control with an interrupt pipe 0x83. Interface 1
    /// streams: setting 0 has no pipes, setting 1 an isochronous OUT 0x01,
    /// setting 2 a larger OUT 0x01 plus the feedback IN 0x82.
    pub fn alt_switching_audio() -> Self {
        Self::new(DeviceDescriptor {
            usb_version: 0x0200,
            max_packet_size0: 64,
            vendor_id: 0x0d8c,
            product_id: 0x0014,
            device_version: 0x0100,
            product_index: 1,
            num_configurations: 1,
            ..Default::default()
        })
        .with_interface(vec![vec![interrupt_pipe(0x83, 16, 4)]])
        .with_interface(vec![
            Vec::new(),
            vec![isochronous_pipe(0x01, 192, 1)],
            vec![isochronous_pipe(0x01, 384, 1), isochronous_pipe(0x82, 3, 1)],
        ])
    }

    /// Configuration descriptor 0 as the device would return it
    pub fn configuration_descriptor(&self) -> Vec<u8> {
        if let Some(bytes) = &self.configuration_override {
            return bytes.clone();
        }

        let mut body = Vec::new();
        for (number, alt_settings) in self.interfaces.iter().enumerate() {
            for (alt, pipes) in alt_settings.iter().enumerate() {
                body.extend_from_slice(&[
                    INTERFACE_DESCRIPTOR_LEN as u8,
                    DescriptorType::Interface as u8,
                    number as u8,
                    alt as u8,
                    pipes.len() as u8,
                    0xff,
                    0x00,
                    0x00,
                    0x00,
                ]);
                for info in pipes {
                    let [lo, hi] = info.max_packet_size.to_le_bytes();
                    body.extend_from_slice(&[
                        ENDPOINT_DESCRIPTOR_LEN as u8,
                        DescriptorType::Endpoint as u8,
                        info.endpoint_address,
                        pipe_type_attributes(info.pipe_type),
                        lo,
                        hi,
                        info.interval,
                    ]);
                }
            }
        }

        let header = ConfigurationDescriptorHeader {
            total_length: (CONFIGURATION_DESCRIPTOR_LEN + body.len()) as u16,
            num_interfaces: self.interfaces.len() as u8,
            configuration_value: 1,
            configuration_index: 0,
            attributes: 0x80,
            max_power: 50,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&body);
        bytes
    }
}

/// Failures the simulated stack reports on demand
///
/// Every fault stays armed until it is cleared.
#[derive(Debug, Default)]
pub struct SimFaults {
    pub create_target: Option<UsbError>,
    pub select_configuration: Option<UsbError>,
    /// Report this many interfaces instead of the model's count
    pub interface_count: Option<u8>,
    pub allocate_urb: Option<UsbError>,
    pub send_urb: Option<UsbError>,
    /// Copy the descriptor into the buffer before failing `send_urb`
    pub send_urb_writes_data: bool,
    pub format: Option<UsbError>,
    pub send: Option<UsbError>,
    pub select_setting: Option<UsbError>,
    /// Switch the hardware to the requested setting before failing
    pub select_applies_before_failing: bool,
    /// Abort returns without completing anything
    pub abort_leaves_pending: bool,
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub targets_created: u32,
    pub targets_deleted: u32,
    pub urbs_allocated: u32,
    pub urbs_freed: u32,
    pub interface_lookups: u32,
    /// Calls to `select_setting`, failed ones included
    pub select_settings: u32,
    pub aborts: u32,
    pub last_contract_version: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Read,
    Write,
    Control,
}

/// A request accepted by `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request_id: RequestId,
    pub io_target: IoTarget,
    pub kind: SubmissionKind,
    pub length: usize,
    pub setup: Option<SetupPacket>,
}

#[derive(Debug)]
struct SimInterface {
    handle: InterfaceHandle,
    current: u8,
    pipes: Vec<(PipeHandle, PipeInfo)>,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u64,
    live_targets: HashSet<TargetHandle>,
    interfaces: Vec<SimInterface>,
    live_urbs: HashSet<UrbHandle>,
    unchecked_pipes: HashSet<PipeHandle>,
    pending: VecDeque<(IoTarget, InFlightRequest)>,
    submissions: Vec<Submission>,
    loopback: HashMap<u8, VecDeque<u8>>,
    auto_complete: bool,
    stats: SimStats,
}

impl SimState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn interface_mut(&mut self, handle: InterfaceHandle) -> Option<&mut SimInterface> {
        self.interfaces.iter_mut().find(|i| i.handle == handle)
    }

    fn pipe_info(&self, pipe: PipeHandle) -> Option<PipeInfo> {
        self.interfaces
            .iter()
            .flat_map(|i| i.pipes.iter())
            .find(|(handle, _)| *handle == pipe)
            .map(|(_, info)| *info)
    }
}

/// [`Transport`] over a [`SimulatedDevice`]
#[derive(Debug)]
pub struct SimulatedTransport {
    device: SimulatedDevice,
    state: Mutex<SimState>,
    faults: Mutex<SimFaults>,
}

impl SimulatedTransport {
    pub fn new(device: SimulatedDevice) -> Self {
        Self {
            device,
            state: Mutex::new(SimState::default()),
            faults: Mutex::new(SimFaults::default()),
        }
    }

    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    /// Fault injection switches
    pub fn faults(&self) -> MutexGuard<'_, SimFaults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete transfers as soon as they are sent
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    pub fn stats(&self) -> SimStats {
        self.state().stats
    }

    pub fn live_urbs(&self) -> usize {
        self.state().live_urbs.len()
    }

    pub fn live_targets(&self) -> usize {
        self.state().live_targets.len()
    }

    pub fn packet_size_check_disabled(&self, pipe: PipeHandle) -> bool {
        self.state().unchecked_pipes.contains(&pipe)
    }

    /// Every request accepted by `send`, oldest first
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// Requests sent and not yet completed
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Complete the oldest pending transfer on `pipe`
    ///
    /// For reads `Ok(data)` is what the device returns; for writes it is
    /// ignored and the whole buffer counts as written. Returns false if
    /// nothing was pending on the pipe.
    pub fn complete_next(&self, pipe: PipeHandle, result: Result<Vec<u8>, UsbError>) -> bool {
        self.complete_first(IoTarget::Pipe(pipe), result)
    }

    /// Complete the oldest pending control transfer on `target`
    pub fn complete_next_control(
        &self,
        target: TargetHandle,
        result: Result<Vec<u8>, UsbError>,
    ) -> bool {
        self.complete_first(IoTarget::Device(target), result)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete_first(&self, io_target: IoTarget, result: Result<Vec<u8>, UsbError>) -> bool {
        let request = {
            let mut state = self.state();
            let Some(position) = state.pending.iter().position(|(t, _)| *t == io_target) else {
                return false;
            };
            state.pending.remove(position).map(|(_, request)| request)
        };

        match request {
            Some(request) => {
                finish(request, result);
                true
            }
            None => false,
        }
    }

    /// Answer a standard control-IN request from the device model
    fn control_in_response(&self, setup: &SetupPacket) -> Result<Vec<u8>, UsbError> {
        if setup.request != REQUEST_GET_DESCRIPTOR {
            return Err(UsbError::Pipe);
        }

        let descriptor_index = (setup.value & 0xff) as u8;
        match DescriptorType::from_u8((setup.value >> 8) as u8) {
            Some(DescriptorType::Device) => Ok(self.device.device_descriptor.to_bytes().to_vec()),
            Some(DescriptorType::Configuration) if descriptor_index == 0 => {
                Ok(self.device.configuration_descriptor())
            }
            _ => Err(UsbError::Pipe),
        }
    }

    /// Complete `request` right away, looping OUT data back to IN reads
    fn auto_complete(&self, io_target: IoTarget, mut request: InFlightRequest) {
        let result = match request.transfer_mut() {
            Transfer::Write { pipe, buffer } => {
                let mut state = self.state();
                if let Some(info) = state.pipe_info(*pipe) {
                    state
                        .loopback
                        .entry(info.endpoint_address & 0x0f)
                        .or_default()
                        .extend(buffer.iter().copied());
                }
                Ok(buffer.len())
            }
            Transfer::Read { pipe, buffer } => {
                let mut state = self.state();
                let number = state.pipe_info(*pipe).map(|i| i.endpoint_address & 0x0f);
                let queued = number.and_then(|n| state.loopback.get_mut(&n));
                let mut len = 0;
                if let Some(queued) = queued {
                    len = queued.len().min(buffer.len());
                    for (dst, src) in buffer.iter_mut().zip(queued.drain(..len)) {
                        *dst = src;
                    }
                }
                Ok(len)
            }
            Transfer::Control {
                setup,
                data,
                offset,
                ..
            } => {
                let window = control_window(data, *offset);
                if setup.is_in() {
                    self.control_in_response(setup).map(|response| {
                        let len = response.len().min(window.len()).min(usize::from(setup.length));
                        window[..len].copy_from_slice(&response[..len]);
                        len
                    })
                } else {
                    Ok(usize::from(setup.length).min(window.len()))
                }
            }
        };

        trace!("Auto-completing {:?} on {:?}: {:?}", request.id(), io_target, result);
        request.complete(result);
    }
}

fn control_window(data: &mut BytesMut, offset: Option<TransferOffset>) -> &mut [u8] {
    let len = data.len();
    match offset.and_then(|o| o.range(len)) {
        Some(range) => &mut data[range],
        None => &mut data[..],
    }
}

fn finish(mut request: InFlightRequest, result: Result<Vec<u8>, UsbError>) {
    let status = result.map(|data| match request.transfer_mut() {
        Transfer::Write { buffer, .. } => buffer.len(),
        Transfer::Read { buffer, .. } => {
            let len = data.len().min(buffer.len());
            buffer[..len].copy_from_slice(&data[..len]);
            len
        }
        Transfer::Control { data: buffer, offset, .. } => {
            let window = control_window(buffer, *offset);
            let len = data.len().min(window.len());
            window[..len].copy_from_slice(&data[..len]);
            len
        }
    });
    request.complete(status);
}

impl Transport for SimulatedTransport {
    fn create_target(&self, client_contract_version: u32) -> Result<TargetHandle, UsbError> {
        if let Some(e) = self.faults().create_target.clone() {
            return Err(e);
        }

        let mut state = self.state();
        let target = TargetHandle(state.allocate_handle());
        state.live_targets.insert(target);
        state.stats.targets_created += 1;
        state.stats.last_contract_version = Some(client_contract_version);
        Ok(target)
    }

    fn delete_target(&self, target: TargetHandle) {
        let mut state = self.state();
        if state.live_targets.remove(&target) {
            state.stats.targets_deleted += 1;
        }
    }

    fn select_configuration(
        &self,
        _target: TargetHandle,
        _selection: ConfigSelection,
    ) -> Result<(), UsbError> {
        if let Some(e) = self.faults().select_configuration.clone() {
            return Err(e);
        }

        let mut state = self.state();
        let mut interfaces = Vec::with_capacity(self.device.interfaces.len());
        for alt_settings in &self.device.interfaces {
            let handle = InterfaceHandle(state.allocate_handle());
            let default_pipes = alt_settings.first().cloned().unwrap_or_default();
            let pipes = default_pipes
                .into_iter()
                .map(|info| (PipeHandle(state.allocate_handle()), info))
                .collect();
            interfaces.push(SimInterface {
                handle,
                current: 0,
                pipes,
            });
        }
        state.interfaces = interfaces;
        Ok(())
    }

    fn interface_count(&self, _target: TargetHandle) -> u8 {
        if let Some(count) = self.faults().interface_count {
            return count;
        }
        self.state().interfaces.len() as u8
    }

    fn interface(&self, _target: TargetHandle, index: u8) -> Option<InterfaceHandle> {
        let mut state = self.state();
        state.stats.interface_lookups += 1;
        state.interfaces.get(usize::from(index)).map(|i| i.handle)
    }

    fn select_setting(&self, interface: InterfaceHandle, alt_setting: u8) -> Result<(), UsbError> {
        let fault = {
            let faults = self.faults();
            faults
                .select_setting
                .clone()
                .map(|e| (e, faults.select_applies_before_failing))
        };

        let mut state = self.state();
        state.stats.select_settings += 1;
        let number = state
            .interfaces
            .iter()
            .position(|i| i.handle == interface)
            .ok_or(UsbError::NotFound)?;
        let settings = &self.device.interfaces[number];
        let pipes = settings
            .get(usize::from(alt_setting))
            .cloned()
            .ok_or(UsbError::InvalidParam)?;

        if let Some((error, applies)) = fault {
            if applies {
                if let Some(sim) = state.interface_mut(interface) {
                    sim.current = alt_setting;
                }
            }
            return Err(error);
        }

        let pipes = pipes
            .into_iter()
            .map(|info| (PipeHandle(state.allocate_handle()), info))
            .collect();
        if let Some(sim) = state.interface_mut(interface) {
            sim.current = alt_setting;
            sim.pipes = pipes;
        }
        Ok(())
    }

    fn current_setting(&self, interface: InterfaceHandle) -> Option<u8> {
        self.state()
            .interfaces
            .iter()
            .find(|i| i.handle == interface)
            .map(|i| i.current)
    }

    fn configured_pipe_count(&self, interface: InterfaceHandle) -> u8 {
        self.state()
            .interfaces
            .iter()
            .find(|i| i.handle == interface)
            .map_or(0, |i| i.pipes.len() as u8)
    }

    fn configured_pipe(
        &self,
        interface: InterfaceHandle,
        index: u8,
    ) -> Option<(PipeHandle, PipeInfo)> {
        self.state()
            .interfaces
            .iter()
            .find(|i| i.handle == interface)
            .and_then(|i| i.pipes.get(usize::from(index)).copied())
    }

    fn disable_max_packet_size_check(&self, pipe: PipeHandle) {
        self.state().unchecked_pipes.insert(pipe);
    }

    fn device_descriptor(&self, _target: TargetHandle) -> DeviceDescriptor {
        self.device.device_descriptor
    }

    fn allocate_urb(&self, _target: TargetHandle) -> Result<UrbHandle, UsbError> {
        if let Some(e) = self.faults().allocate_urb.clone() {
            return Err(e);
        }

        let mut state = self.state();
        let urb = UrbHandle(state.allocate_handle());
        state.live_urbs.insert(urb);
        state.stats.urbs_allocated += 1;
        Ok(urb)
    }

    fn free_urb(&self, urb: UrbHandle) {
        let mut state = self.state();
        if state.live_urbs.remove(&urb) {
            state.stats.urbs_freed += 1;
        }
    }

    fn send_urb_synchronously(
        &self,
        _target: TargetHandle,
        urb: UrbHandle,
        setup: &SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError> {
        if !self.state().live_urbs.contains(&urb) {
            return Err(UsbError::InvalidParam);
        }

        let (fault, writes_data) = {
            let faults = self.faults();
            (faults.send_urb.clone(), faults.send_urb_writes_data)
        };
        if let Some(e) = &fault {
            if !writes_data {
                return Err(e.clone());
            }
        }

        let response = self.control_in_response(setup)?;
        let len = response
            .len()
            .min(buffer.len())
            .min(usize::from(setup.length));
        buffer[..len].copy_from_slice(&response[..len]);

        match fault {
            Some(e) => Err(e),
            None => Ok(len),
        }
    }

    fn format_pipe_read(
        &self,
        pipe: PipeHandle,
        request: &mut Request,
        buffer: BytesMut,
    ) -> Result<(), UsbError> {
        if let Some(e) = self.faults().format.clone() {
            return Err(e);
        }
        if self.state().pipe_info(pipe).is_none() {
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
        if let Some(e) = self.faults().format.clone() {
            return Err(e);
        }
        if self.state().pipe_info(pipe).is_none() {
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
        if let Some(e) = self.faults().format.clone() {
            return Err(e);
        }
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
        if let Some(error) = self.faults().send.clone() {
            return Err(SendError { request, error });
        }

        let (kind, setup) = match request.transfer() {
            Transfer::Read { .. } => (SubmissionKind::Read, None),
            Transfer::Write { .. } => (SubmissionKind::Write, None),
            Transfer::Control { setup, .. } => (SubmissionKind::Control, Some(*setup)),
        };

        let auto_complete = {
            let mut state = self.state();
            state.submissions.push(Submission {
                request_id: request.id(),
                io_target,
                kind,
                length: request.transfer().buffer().len(),
                setup,
            });
            state.auto_complete
        };

        if auto_complete {
            self.auto_complete(io_target, request);
        } else {
            self.state().pending.push_back((io_target, request));
        }
        Ok(())
    }

    fn abort_pipe_synchronously(
        &self,
        pipe: PipeHandle,
        _request: Option<RequestId>,
    ) -> Result<(), UsbError> {
        let leave_pending = self.faults().abort_leaves_pending;

        let aborted: Vec<InFlightRequest> = {
            let mut state = self.state();
            state.stats.aborts += 1;
            if leave_pending {
                return Ok(());
            }
            let (aborted, kept) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|(t, _)| *t == IoTarget::Pipe(pipe));
            state.pending = kept;
            aborted.into_iter().map(|(_, request)| request).collect()
        };

        for request in aborted {
            request.complete(Err(UsbError::Cancelled));
        }
        Ok(())
    }
}
