//! Property tests for the two-phase configuration descriptor query

use proptest::prelude::*;
use protocol::DescriptorType;
use std::sync::Arc;
use usbtarget::sim::{SimulatedDevice, SimulatedTransport};
use usbtarget::{TargetError, TargetOptions, UsbTargetDevice};

fn descriptor_of_length(total_length: u16) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();
    bytes[0] = 9;
    bytes[1] = DescriptorType::Configuration as u8;
    bytes[2..4].copy_from_slice(&total_length.to_le_bytes());
    bytes
}

fn device_serving(descriptor: Vec<u8>) -> (Arc<SimulatedTransport>, UsbTargetDevice) {
    let sim = Arc::new(SimulatedTransport::new(
        SimulatedDevice::mass_storage().with_configuration_descriptor(descriptor),
    ));
    let device = UsbTargetDevice::create(sim.clone(), &TargetOptions::default()).unwrap();
    (sim, device)
}

proptest! {
    #[test]
    fn prop_two_phase_query(total_length in 9u16..600, buffer_len in 0usize..700) {
        let descriptor = descriptor_of_length(total_length);
        let (sim, device) = device_serving(descriptor.clone());
        let total = usize::from(total_length);

        let mut buffer = vec![0xee; buffer_len];
        let result = device.configuration_descriptor(0, &mut buffer);

        if buffer_len < total {
            prop_assert_eq!(result, Err(TargetError::BufferTooSmall { required: total }));
            prop_assert!(buffer.iter().all(|&b| b == 0xee));
        } else {
            prop_assert_eq!(result, Ok(total));
            prop_assert_eq!(&buffer[..total], &descriptor[..]);
            prop_assert!(buffer[total..].iter().all(|&b| b == 0));
        }
        prop_assert_eq!(sim.live_urbs(), 0);
    }

    #[test]
    fn prop_zero_length_never_touches_buffer(buffer_len in 0usize..128) {
        let (_sim, device) = device_serving(descriptor_of_length(9).into_iter()
            .enumerate()
            .map(|(i, b)| if i == 2 || i == 3 { 0 } else { b })
            .collect());

        let mut buffer = vec![0xee; buffer_len];
        prop_assert_eq!(
            device.configuration_descriptor(0, &mut buffer),
            Err(TargetError::InvalidConfigurationDescriptor)
        );
        prop_assert!(buffer.iter().all(|&b| b == 0xee));
    }
}
