//! USB transfer execution
//!
//! Runs queued requests against a libusb device handle with rusb's
//! synchronous API and maps rusb errors to transport status codes.

use protocol::{PipeInfo, PipeType, SetupPacket, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};
use usbtarget::{InFlightRequest, Transfer, TransferOffset};

/// Execute a queued request and complete it
///
/// `endpoint` is the pipe a read or write runs on; control transfers go to
/// the default pipe and ignore it.
pub fn execute_transfer(
    handle: &DeviceHandle<Context>,
    endpoint: Option<PipeInfo>,
    mut request: InFlightRequest,
    timeout: Duration,
) {
    let result = match (request.transfer_mut(), endpoint) {
        (
            Transfer::Control {
                setup,
                data,
                offset,
                ..
            },
            _,
        ) => execute_control_transfer(handle, setup, data_window(data, *offset), timeout),
        (Transfer::Read { buffer, .. }, Some(info)) => {
            execute_read(handle, &info, buffer, timeout)
        }
        (Transfer::Write { buffer, .. }, Some(info)) => {
            execute_write(handle, &info, buffer, timeout)
        }
        (_, None) => Err(UsbError::InvalidParam),
    };

    request.complete(result);
}

/// Run a control-IN request, returning what the device sent
pub fn execute_control_in(
    handle: &DeviceHandle<Context>,
    setup: &SetupPacket,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, UsbError> {
    let mut buffer = vec![0u8; length.min(usize::from(setup.length))];
    let len = handle
        .read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            timeout,
        )
        .map_err(map_rusb_error)?;
    buffer.truncate(len);
    Ok(buffer)
}

fn data_window(data: &mut [u8], offset: Option<TransferOffset>) -> &mut [u8] {
    let len = data.len();
    match offset.and_then(|o| o.range(len)) {
        Some(range) => &mut data[range],
        None => data,
    }
}

/// Execute a control transfer on the default pipe
///
/// Direction comes from bit 7 of bmRequestType. At most wLength bytes of
/// `data` take part.
fn execute_control_transfer(
    handle: &DeviceHandle<Context>,
    setup: &SetupPacket,
    data: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    let len = data.len().min(usize::from(setup.length));
    let data = &mut data[..len];

    let result = if setup.is_in() {
        handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )
    } else {
        handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )
    };

    result.map_err(|e| {
        warn!("Control transfer failed: {}", e);
        map_rusb_error(e)
    })
}

/// Execute an IN transfer on a bulk or interrupt pipe
fn execute_read(
    handle: &DeviceHandle<Context>,
    info: &PipeInfo,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    debug!(
        "{:?} read: endpoint={:#x}, len={}, timeout={}ms",
        info.pipe_type,
        info.endpoint_address,
        buffer.len(),
        timeout.as_millis()
    );

    let result = match info.pipe_type {
        PipeType::Bulk => handle.read_bulk(info.endpoint_address, buffer, timeout),
        PipeType::Interrupt => handle.read_interrupt(info.endpoint_address, buffer, timeout),
        PipeType::Isochronous | PipeType::Control => return Err(unsupported(info)),
    };

    result.map_err(|e| {
        warn!("Read on endpoint {:#x} failed: {}", info.endpoint_address, e);
        map_rusb_error(e)
    })
}

/// Execute an OUT transfer on a bulk or interrupt pipe
fn execute_write(
    handle: &DeviceHandle<Context>,
    info: &PipeInfo,
    buffer: &[u8],
    timeout: Duration,
) -> Result<usize, UsbError> {
    debug!(
        "{:?} write: endpoint={:#x}, len={}, timeout={}ms",
        info.pipe_type,
        info.endpoint_address,
        buffer.len(),
        timeout.as_millis()
    );

    let result = match info.pipe_type {
        PipeType::Bulk => handle.write_bulk(info.endpoint_address, buffer, timeout),
        PipeType::Interrupt => handle.write_interrupt(info.endpoint_address, buffer, timeout),
        PipeType::Isochronous | PipeType::Control => return Err(unsupported(info)),
    };

    result.map_err(|e| {
        warn!("Write on endpoint {:#x} failed: {}", info.endpoint_address, e);
        map_rusb_error(e)
    })
}

fn unsupported(info: &PipeInfo) -> UsbError {
    UsbError::Other {
        message: format!(
            "{:?} transfers on endpoint {:#x} are not supported by the synchronous backend",
            info.pipe_type, info.endpoint_address
        ),
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NoMem => UsbError::NoMemory,
        rusb::Error::Interrupted => UsbError::Cancelled,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
