//! Standard USB descriptors
//!
//! Only the fixed-layout descriptors the target layer needs are modelled:
//! the device descriptor and the 9-byte configuration descriptor header.
//! Everything that follows the header (interface, endpoint and class
//! descriptors) is carried as opaque bytes.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// bRequest value of GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// bRequest value of SET_INTERFACE
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

/// Size of the standard device descriptor
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Size of the configuration descriptor header
pub const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;

/// Standard descriptor types (bDescriptorType)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
}

impl DescriptorType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(DescriptorType::Device),
            0x02 => Some(DescriptorType::Configuration),
            0x03 => Some(DescriptorType::String),
            0x04 => Some(DescriptorType::Interface),
            0x05 => Some(DescriptorType::Endpoint),
            _ => None,
        }
    }
}

/// Standard USB device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// bcdUSB
    pub usb_version: u16,
    /// bDeviceClass
    pub class: u8,
    /// bDeviceSubClass
    pub subclass: u8,
    /// bDeviceProtocol
    pub protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size0: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    /// iManufacturer
    pub manufacturer_index: u8,
    /// iProduct
    pub product_index: u8,
    /// iSerialNumber
    pub serial_number_index: u8,
    /// bNumConfigurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse the 18-byte wire form
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DEVICE_DESCRIPTOR_LEN, DescriptorType::Device)?;

        Ok(Self {
            usb_version: LittleEndian::read_u16(&bytes[2..4]),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            device_version: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Encode into the 18-byte wire form
    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let mut buf = [0u8; DEVICE_DESCRIPTOR_LEN];
        buf[0] = DEVICE_DESCRIPTOR_LEN as u8;
        buf[1] = DescriptorType::Device as u8;
        LittleEndian::write_u16(&mut buf[2..4], self.usb_version);
        buf[4] = self.class;
        buf[5] = self.subclass;
        buf[6] = self.protocol;
        buf[7] = self.max_packet_size0;
        LittleEndian::write_u16(&mut buf[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut buf[10..12], self.product_id);
        LittleEndian::write_u16(&mut buf[12..14], self.device_version);
        buf[14] = self.manufacturer_index;
        buf[15] = self.product_index;
        buf[16] = self.serial_number_index;
        buf[17] = self.num_configurations;
        buf
    }
}

/// Configuration descriptor header (first 9 bytes of a configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigurationDescriptorHeader {
    /// wTotalLength: header plus every interface/endpoint/class descriptor
    pub total_length: u16,
    /// bNumInterfaces
    pub num_interfaces: u8,
    /// bConfigurationValue
    pub configuration_value: u8,
    /// iConfiguration
    pub configuration_index: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower, in 2 mA units
    pub max_power: u8,
}

impl ConfigurationDescriptorHeader {
    /// Parse the header from the start of a configuration descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(
            bytes,
            CONFIGURATION_DESCRIPTOR_LEN,
            DescriptorType::Configuration,
        )?;

        Ok(Self {
            total_length: LittleEndian::read_u16(&bytes[2..4]),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            configuration_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }

    /// Encode into the 9-byte wire form
    pub fn to_bytes(&self) -> [u8; CONFIGURATION_DESCRIPTOR_LEN] {
        let mut buf = [0u8; CONFIGURATION_DESCRIPTOR_LEN];
        buf[0] = CONFIGURATION_DESCRIPTOR_LEN as u8;
        buf[1] = DescriptorType::Configuration as u8;
        LittleEndian::write_u16(&mut buf[2..4], self.total_length);
        buf[4] = self.num_interfaces;
        buf[5] = self.configuration_value;
        buf[6] = self.configuration_index;
        buf[7] = self.attributes;
        buf[8] = self.max_power;
        buf
    }

    /// Self-powered bit of bmAttributes
    pub fn self_powered(&self) -> bool {
        (self.attributes & 0x40) != 0
    }

    /// Remote-wakeup bit of bmAttributes
    pub fn remote_wakeup(&self) -> bool {
        (self.attributes & 0x20) != 0
    }

    /// Maximum power draw in milliamps
    pub fn max_power_ma(&self) -> u16 {
        u16::from(self.max_power) * 2
    }
}

/// Read wTotalLength from a (possibly partial) configuration descriptor
///
/// Returns 0 when fewer than 4 bytes are present, which callers treat the
/// same as a device that reported an empty configuration.
pub fn configuration_total_length(bytes: &[u8]) -> u16 {
    if bytes.len() < 4 {
        return 0;
    }
    LittleEndian::read_u16(&bytes[2..4])
}

fn check_header(bytes: &[u8], needed: usize, expected: DescriptorType) -> Result<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: bytes.len(),
        });
    }
    if bytes[1] != expected as u8 {
        return Err(ProtocolError::UnexpectedDescriptorType {
            expected: expected as u8,
            found: bytes[1],
        });
    }
    if (bytes[0] as usize) < needed {
        return Err(ProtocolError::InvalidLength {
            length: bytes[0],
            minimum: needed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYBOARD_DEVICE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x08, 0x6d, 0x04, 0x2b, 0xc5, 0x10, 0x01, 0x01,
        0x02, 0x00, 0x01,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&KEYBOARD_DEVICE).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.vendor_id, 0x046d);
        assert_eq!(desc.product_id, 0xc52b);
        assert_eq!(desc.device_version, 0x0110);
        assert_eq!(desc.max_packet_size0, 8);
        assert_eq!(desc.manufacturer_index, 1);
        assert_eq!(desc.product_index, 2);
        assert_eq!(desc.serial_number_index, 0);
        assert_eq!(desc.num_configurations, 1);
        assert_eq!(desc.to_bytes(), KEYBOARD_DEVICE);
    }

    #[test]
    fn test_parse_device_descriptor_wrong_type() {
        let mut bytes = KEYBOARD_DEVICE;
        bytes[1] = 0x02;
        let err = DeviceDescriptor::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedDescriptorType {
                expected: 0x01,
                found: 0x02
            }
        ));
    }

    #[test]
    fn test_parse_configuration_header() {
        let bytes = [0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xa0, 0x32];
        let header = ConfigurationDescriptorHeader::parse(&bytes).unwrap();
        assert_eq!(header.total_length, 0x22);
        assert_eq!(header.num_interfaces, 1);
        assert_eq!(header.configuration_value, 1);
        assert!(!header.self_powered());
        assert!(header.remote_wakeup());
        assert_eq!(header.max_power_ma(), 100);
        assert_eq!(header.to_bytes(), bytes);
    }

    #[test]
    fn test_configuration_header_too_short() {
        let err = ConfigurationDescriptorHeader::parse(&[0x09, 0x02, 0x22]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: 9,
                available: 3
            }
        ));
    }

    #[test]
    fn test_configuration_total_length() {
        assert_eq!(configuration_total_length(&[0x09, 0x02, 0x20, 0x01]), 0x0120);
        assert_eq!(configuration_total_length(&[0x09, 0x02]), 0);
        assert_eq!(configuration_total_length(&[0u8; 9]), 0);
    }

    #[test]
    fn test_descriptor_type_from_u8() {
        assert_eq!(
            DescriptorType::from_u8(0x02),
            Some(DescriptorType::Configuration)
        );
        assert_eq!(DescriptorType::from_u8(0x21), None);
    }
}
