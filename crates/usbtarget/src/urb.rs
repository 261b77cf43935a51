//! Synchronous descriptor requests
//!
//! A [`TransferDescriptorBuilder`] owns one transport-allocated URB for the
//! duration of a single descriptor query and frees it on drop, whichever
//! way the query ends.

use crate::error::{Result, TargetError};
use crate::transport::{TargetHandle, Transport, UrbHandle};
use protocol::{DescriptorType, SetupPacket};
use tracing::{error, trace};

/// Scoped URB used to issue GET_DESCRIPTOR requests
pub struct TransferDescriptorBuilder<'t> {
    transport: &'t dyn Transport,
    target: TargetHandle,
    urb: UrbHandle,
    setup: Option<SetupPacket>,
}

impl<'t> TransferDescriptorBuilder<'t> {
    /// Allocate a URB against `target`
    pub fn create(transport: &'t dyn Transport, target: TargetHandle) -> Result<Self> {
        let urb = transport.allocate_urb(target).map_err(|e| {
            error!("Cannot create URB: {}", e);
            TargetError::from(e)
        })?;

        trace!("Allocated {:?} on {:?}", urb, target);
        Ok(Self {
            transport,
            target,
            urb,
            setup: None,
        })
    }

    /// Populate the URB as GET_DESCRIPTOR(`descriptor_type`, `index`)
    ///
    /// The device writes at most `buffer.len()` bytes into `buffer`; pass a
    /// sub-slice to request fewer. Nothing is sent until
    /// [`PreparedDescriptorRequest::send_synchronously`].
    pub fn build_descriptor_request<'a>(
        &'a mut self,
        descriptor_type: DescriptorType,
        index: u8,
        buffer: &'a mut [u8],
    ) -> PreparedDescriptorRequest<'a, 't> {
        self.setup = Some(SetupPacket::get_descriptor(
            descriptor_type,
            index,
            buffer.len(),
        ));
        PreparedDescriptorRequest {
            builder: self,
            buffer,
        }
    }

    /// Setup packet currently built into the URB
    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }
}

impl Drop for TransferDescriptorBuilder<'_> {
    fn drop(&mut self) {
        trace!("Releasing {:?}", self.urb);
        self.transport.free_urb(self.urb);
    }
}

/// A built descriptor request waiting to be sent
pub struct PreparedDescriptorRequest<'a, 't> {
    builder: &'a mut TransferDescriptorBuilder<'t>,
    buffer: &'a mut [u8],
}

impl PreparedDescriptorRequest<'_, '_> {
    /// Submit the URB and block until the device answers
    ///
    /// Returns the number of bytes the device wrote. Transport failures are
    /// logged and returned unchanged.
    pub fn send_synchronously(self) -> Result<usize> {
        let builder = self.builder;
        let Some(setup) = builder.setup else {
            return Err(TargetError::InvalidParameter(
                "URB has no request built into it".to_string(),
            ));
        };

        builder
            .transport
            .send_urb_synchronously(builder.target, builder.urb, &setup, self.buffer)
            .map_err(|e| {
                error!("Cannot send URB: {}", e);
                TargetError::from(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDevice, SimulatedTransport};
    use protocol::UsbError;

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new(SimulatedDevice::mass_storage())
    }

    #[test]
    fn test_urb_freed_on_drop() {
        let transport = transport();
        let target = transport.create_target(0x602).unwrap();
        {
            let _urb = TransferDescriptorBuilder::create(&transport, target).unwrap();
            assert_eq!(transport.live_urbs(), 1);
        }
        assert_eq!(transport.live_urbs(), 0);
        assert_eq!(transport.stats().urbs_allocated, 1);
    }

    #[test]
    fn test_allocation_failure_is_resource_exhausted() {
        let transport = transport();
        let target = transport.create_target(0x602).unwrap();
        transport.faults().allocate_urb = Some(UsbError::NoMemory);

        let result = TransferDescriptorBuilder::create(&transport, target);
        assert!(matches!(result, Err(TargetError::ResourceExhausted)));
        assert_eq!(transport.live_urbs(), 0);
    }

    #[test]
    fn test_build_and_send_descriptor_request() {
        let transport = transport();
        let target = transport.create_target(0x602).unwrap();
        let mut urb = TransferDescriptorBuilder::create(&transport, target).unwrap();

        let mut header = [0u8; 9];
        let len = urb
            .build_descriptor_request(DescriptorType::Configuration, 0, &mut header)
            .send_synchronously()
            .unwrap();

        assert_eq!(len, 9);
        assert_eq!(header[1], 0x02);
        let setup = urb.setup().unwrap();
        assert_eq!(setup.value, 0x0200);
        assert_eq!(setup.length, 9);
    }

    #[test]
    fn test_send_failure_propagates_and_still_frees() {
        let transport = transport();
        let target = transport.create_target(0x602).unwrap();
        transport.faults().send_urb = Some(UsbError::Pipe);

        {
            let mut urb = TransferDescriptorBuilder::create(&transport, target).unwrap();
            let mut buffer = [0u8; 18];
            let err = urb
                .build_descriptor_request(DescriptorType::Device, 0, &mut buffer)
                .send_synchronously()
                .unwrap_err();
            assert_eq!(err, TargetError::Transport(UsbError::Pipe));
        }
        assert_eq!(transport.live_urbs(), 0);
    }
}
