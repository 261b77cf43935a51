//! USB device access over libusb
//!
//! [`UsbDevice`] wraps the rusb device the probe drives: it opens it,
//! detaches kernel drivers and claims every interface of the active
//! configuration, and reads the endpoint layout the transport exposes as
//! pipes.

use crate::usb::bridge::InterfaceLayout;
use crate::usb::transfers::map_rusb_error;
use protocol::{DeviceDescriptor, PipeInfo, PipeType, UsbError};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use serde::Serialize;
use tracing::{debug, warn};

/// Hub class code; hubs are skipped when no filter is given
const CLASS_HUB: u8 = 0x09;

/// libusb does not bound a single transfer; report a generous limit
const MAXIMUM_TRANSFER_SIZE: u32 = 1024 * 1024;

/// One line of `list` output
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub speed: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Opened USB device with claimed interfaces
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: rusb::DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    claimed_interfaces: Vec<u8>,
}

impl UsbDevice {
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        Ok(Self {
            device,
            descriptor,
            handle: None,
            claimed_interfaces: Vec::new(),
        })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    /// Device descriptor in wire-model form
    pub fn descriptor(&self) -> DeviceDescriptor {
        convert_descriptor(&self.descriptor)
    }

    /// Open the device for transfers
    ///
    /// Kernel drivers are detached from, and the probe claims, every
    /// interface of the active configuration.
    pub fn open(&mut self) -> Result<(), UsbError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        debug!(
            "Opened device on bus {:03} address {:03}",
            self.bus_number(),
            self.device_address()
        );

        let config = self.device.active_config_descriptor().map_err(|e| {
            warn!("Failed to get active config descriptor: {}", e);
            map_rusb_error(e)
        })?;

        for interface in config.interfaces() {
            let interface_number = interface.number();

            match handle.kernel_driver_active(interface_number) {
                Ok(true) => {
                    debug!(
                        "Detaching kernel driver from interface {}",
                        interface_number
                    );
                    if let Err(e) = handle.detach_kernel_driver(interface_number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface_number, e
                        );
                    }
                }
                Ok(false) => {
                    debug!("No kernel driver active on interface {}", interface_number);
                }
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface_number, e
                    );
                }
            }

            if let Err(e) = handle.claim_interface(interface_number) {
                warn!("Failed to claim interface {}: {}", interface_number, e);
                self.handle = Some(handle);
                self.close();
                return Err(map_rusb_error(e));
            }

            debug!("Claimed interface {}", interface_number);
            self.claimed_interfaces.push(interface_number);
        }

        self.handle = Some(handle);
        Ok(())
    }

    /// Release claimed interfaces and hand them back to the kernel
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            for interface in &self.claimed_interfaces {
                if let Err(e) = handle.release_interface(*interface) {
                    warn!("Failed to release interface {}: {}", interface, e);
                }

                if let Err(e) = handle.attach_kernel_driver(*interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            }
            self.claimed_interfaces.clear();

            debug!("Closed device");
        }
    }

    pub fn handle(&self) -> Option<&DeviceHandle<Context>> {
        self.handle.as_ref()
    }

    /// Endpoint layout of every interface in the active configuration
    pub fn interface_layout(&self) -> Result<Vec<InterfaceLayout>, UsbError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;

        let layout = config
            .interfaces()
            .map(|interface| InterfaceLayout {
                number: interface.number(),
                alt_settings: interface
                    .descriptors()
                    .map(|setting| {
                        let pipes = setting
                            .endpoint_descriptors()
                            .map(|endpoint| PipeInfo {
                                endpoint_address: endpoint.address(),
                                pipe_type: map_transfer_type(endpoint.transfer_type()),
                                max_packet_size: endpoint.max_packet_size(),
                                interval: endpoint.interval(),
                                maximum_transfer_size: MAXIMUM_TRANSFER_SIZE,
                            })
                            .collect();
                        (setting.setting_number(), pipes)
                    })
                    .collect(),
            })
            .collect();

        Ok(layout)
    }

    /// Summary for `list`, with string descriptors when the device can be opened
    pub fn summary(&self) -> DeviceSummary {
        let (manufacturer, product, serial_number) = self
            .device
            .open()
            .ok()
            .map(|handle| self.read_string_descriptors(&handle))
            .unwrap_or((None, None, None));

        DeviceSummary {
            bus_number: self.bus_number(),
            device_address: self.device_address(),
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            class: self.descriptor.class_code(),
            speed: format!("{:?}", self.device.speed()),
            manufacturer,
            product,
            serial_number,
        }
    }

    fn read_string_descriptors(
        &self,
        handle: &DeviceHandle<Context>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        let manufacturer = self
            .descriptor
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        let product = self
            .descriptor
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        let serial_number = self
            .descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        (manufacturer, product, serial_number)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Every device on the system
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>, rusb::Error> {
    let devices = context.devices()?;
    let mut summaries = Vec::new();
    for device in devices.iter() {
        match UsbDevice::new(device) {
            Ok(device) => summaries.push(device.summary()),
            Err(e) => warn!("Failed to read device descriptor: {}", e),
        }
    }
    Ok(summaries)
}

/// First device matching `filter`, or the first non-hub device without one
pub fn find_device(context: &Context, filter: Option<&str>) -> Result<UsbDevice, rusb::Error> {
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        let selected = match filter {
            Some(filter) => {
                matches_filter(descriptor.vendor_id(), descriptor.product_id(), filter)
            }
            None => descriptor.class_code() != CLASS_HUB,
        };

        if selected {
            debug!(
                "Selected device {:04x}:{:04x} on bus {:03} address {:03}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                device.bus_number(),
                device.address()
            );
            return UsbDevice::new(device);
        }
    }

    Err(rusb::Error::NotFound)
}

/// Check a VID/PID pair against a "0xVID:0xPID" filter, `*` matching anything
pub fn matches_filter(vid: u16, pid: u16, filter: &str) -> bool {
    let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
        return false;
    };

    let part_matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(
                pattern.trim_start_matches("0x").trim_start_matches("0X"),
                16,
            )
            .map(|v| v == value)
            .unwrap_or(false)
    };

    part_matches(filter_vid, vid) && part_matches(filter_pid, pid)
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> PipeType {
    match transfer_type {
        rusb::TransferType::Control => PipeType::Control,
        rusb::TransferType::Isochronous => PipeType::Isochronous,
        rusb::TransferType::Bulk => PipeType::Bulk,
        rusb::TransferType::Interrupt => PipeType::Interrupt,
    }
}

fn version_to_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

fn convert_descriptor(descriptor: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: version_to_bcd(descriptor.usb_version()),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        max_packet_size0: descriptor.max_packet_size(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_version: version_to_bcd(descriptor.device_version()),
        manufacturer_index: descriptor.manufacturer_string_index().unwrap_or(0),
        product_index: descriptor.product_string_index().unwrap_or(0),
        serial_number_index: descriptor.serial_number_string_index().unwrap_or(0),
        num_configurations: descriptor.num_configurations(),
    }
}
