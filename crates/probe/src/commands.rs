//! Probe subcommands
//!
//! Each command drives a [`UsbTargetDevice`] the way the dispatch layer
//! would, then prints the result as text or JSON.

use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use protocol::{
    CONFIGURATION_DESCRIPTOR_LEN, ConfigurationDescriptorHeader, DeviceDescriptor, RequestId,
    SetupPacket,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use usbtarget::{Completion, InterfaceSnapshot, Request, TargetError, UsbTargetDevice};

use crate::usb::DeviceSummary;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn new_request() -> (Request, usbtarget::CompletionFuture) {
    Request::new(RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)))
}

/// Text or JSON output
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            let rendered =
                serde_json::to_string_pretty(value).context("Failed to serialize output")?;
            println!("{}", rendered);
        } else {
            text(value);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Description {
    device: DeviceDescriptor,
    configuration: ConfigurationDescriptorHeader,
    configuration_length: usize,
    interfaces: Vec<InterfaceSnapshot>,
}

#[derive(Debug, Serialize)]
struct TransferReport {
    request_id: u64,
    endpoint: Option<u8>,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

impl TransferReport {
    fn from_completion(completion: Completion, endpoint: Option<u8>, include_data: bool) -> Result<Self> {
        let length = completion
            .status
            .clone()
            .with_context(|| format!("Request {:?} failed", completion.request_id))?;
        let data = include_data.then(|| to_hex(completion.data()));

        Ok(Self {
            request_id: completion.request_id.0,
            endpoint,
            length,
            data,
        })
    }

    fn print(&self) {
        let target = match self.endpoint {
            Some(endpoint) => format!("endpoint {:#04x}", endpoint),
            None => "default pipe".to_string(),
        };
        println!("{} bytes on {}", self.length, target);
        if let Some(data) = &self.data {
            println!("  {}", data);
        }
    }
}

/// Print attached devices
pub fn list(devices: &[DeviceSummary], output: Output) -> Result<()> {
    output.emit(&devices, |devices| {
        if devices.is_empty() {
            println!("No USB devices found.");
            return;
        }

        println!("Found {} USB device(s):\n", devices.len());
        for device in devices.iter() {
            println!(
                "  {:04x}:{:04x} - {} {}",
                device.vendor_id,
                device.product_id,
                device
                    .manufacturer
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03} Speed: {}",
                device.bus_number, device.device_address, device.speed
            );
            if let Some(serial) = &device.serial_number {
                println!("      Serial: {}", serial);
            }
            println!();
        }
    })
}

/// Fetch configuration descriptor `index`, growing the buffer once if needed
pub fn read_configuration_descriptor(device: &UsbTargetDevice, index: u8) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; CONFIGURATION_DESCRIPTOR_LEN];
    let length = match device.configuration_descriptor(index, &mut buffer) {
        Ok(length) => length,
        Err(TargetError::BufferTooSmall { required }) => {
            debug!("Configuration descriptor needs {} bytes", required);
            buffer.resize(required, 0);
            device
                .configuration_descriptor(index, &mut buffer)
                .context("Failed to read configuration descriptor")?
        }
        Err(e) => return Err(e).context("Failed to read configuration descriptor"),
    };
    buffer.truncate(length);
    Ok(buffer)
}

/// Print device and configuration descriptors and the current pipes
pub fn describe(device: &UsbTargetDevice, output: Output) -> Result<()> {
    let bytes = read_configuration_descriptor(device, 0)?;
    let configuration = ConfigurationDescriptorHeader::parse(&bytes)
        .context("Device returned a malformed configuration descriptor")?;

    let description = Description {
        device: device.device_descriptor(),
        configuration,
        configuration_length: bytes.len(),
        interfaces: device.endpoints(),
    };

    output.emit(&description, |d| {
        println!(
            "Device {:04x}:{:04x}, USB {:x}.{:02x}, class {:#04x}",
            d.device.vendor_id,
            d.device.product_id,
            d.device.usb_version >> 8,
            d.device.usb_version & 0xff,
            d.device.class
        );
        println!(
            "Configuration {}: {} interface(s), {} bytes, {} mA{}{}",
            d.configuration.configuration_value,
            d.configuration.num_interfaces,
            d.configuration_length,
            d.configuration.max_power_ma(),
            if d.configuration.self_powered() {
                ", self-powered"
            } else {
                ""
            },
            if d.configuration.remote_wakeup() {
                ", remote wakeup"
            } else {
                ""
            }
        );
        for interface in &d.interfaces {
            println!("  Interface {}: {:?}", interface.index, interface.alt_setting);
            for pipe in &interface.pipes {
                println!(
                    "    Endpoint {:#04x} {:?} {} max packet {} interval {}",
                    pipe.endpoint_address,
                    pipe.pipe_type,
                    if pipe.is_in() { "IN" } else { "OUT" },
                    pipe.max_packet_size,
                    pipe.interval
                );
            }
        }
    })
}

/// Read `length` bytes from an IN endpoint
pub fn read(device: &UsbTargetDevice, endpoint: u8, length: usize, output: Output) -> Result<()> {
    let (request, completion) = new_request();
    device.read_pipe_async(request, endpoint, BytesMut::zeroed(length));

    let report = TransferReport::from_completion(completion.wait_blocking(), Some(endpoint), true)?;
    output.emit(&report, TransferReport::print)
}

/// Write bytes to an OUT endpoint
pub fn write(device: &UsbTargetDevice, endpoint: u8, data: &[u8], output: Output) -> Result<()> {
    let (request, completion) = new_request();
    device.write_pipe_async(request, endpoint, BytesMut::from(data));

    let report = TransferReport::from_completion(completion.wait_blocking(), Some(endpoint), false)?;
    output.emit(&report, TransferReport::print)
}

/// Control transfer on the default pipe
///
/// Direction follows bit 7 of `setup.request_type`: IN transfers read
/// wLength bytes, OUT transfers send `data`.
pub fn control(
    device: &UsbTargetDevice,
    setup: SetupPacket,
    data: &[u8],
    output: Output,
) -> Result<()> {
    let buffer = if setup.is_in() {
        BytesMut::zeroed(usize::from(setup.length))
    } else {
        if data.len() != usize::from(setup.length) {
            bail!(
                "wLength is {} but {} data bytes were given",
                setup.length,
                data.len()
            );
        }
        BytesMut::from(data)
    };

    let (mut request, completion) = new_request();
    device
        .control_transfer_async(&mut request, setup, buffer, None)
        .context("Control transfer was not sent")?;
    drop(request);

    let report = TransferReport::from_completion(completion.wait_blocking(), None, setup.is_in())?;
    output.emit(&report, TransferReport::print)
}

/// Select an alternate setting and print the interface's new pipes
pub fn set_alt(
    device: &UsbTargetDevice,
    interface: u8,
    alt_setting: u8,
    output: Output,
) -> Result<()> {
    let result = device.set_interface_alt_setting(interface, alt_setting);
    let snapshot = device
        .interface(interface)
        .map(|i| i.snapshot())
        .ok_or_else(|| anyhow!("Interface {} does not exist", interface))?;

    result.with_context(|| {
        format!(
            "Failed to select setting {} on interface {} (now {:?})",
            alt_setting, interface, snapshot.alt_setting
        )
    })?;

    output.emit(&snapshot, |s| {
        println!(
            "Interface {} on {:?} with {} pipe(s)",
            s.index,
            s.alt_setting,
            s.pipes.len()
        );
        for pipe in &s.pipes {
            println!("  Endpoint {:#04x} {:?}", pipe.endpoint_address, pipe.pipe_type);
        }
    })
}

/// Parse hex bytes, allowing whitespace and an optional 0x prefix
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("Hex data '{}' contains non-hex character '{}'", input, bad);
    }
    if digits.len() % 2 != 0 {
        bail!("Hex data '{}' has an odd number of digits", input);
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).map_err(|_| anyhow!("Invalid hex byte '{}'", pair))
        })
        .collect()
}

/// Parse a number given in decimal or 0x-prefixed hex
pub fn parse_number<T>(input: &str) -> Result<T, String>
where
    T: TryFrom<u64>,
{
    let value = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", input, e))?;

    T::try_from(value).map_err(|_| format!("{} is out of range", input))
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
