//! Endpoint channels
//!
//! An [`EndpointChannel`] wraps one configured pipe of an interface's
//! current alternate setting. It formats and submits asynchronous reads
//! and writes, aborts the pipe synchronously, and counts transfers still
//! in flight so the owning interface can drain it before reconfiguring.

use crate::error::{Result, TargetError};
use crate::request::Request;
use crate::transport::{InterfaceHandle, IoTarget, PipeHandle, Transport};
use bytes::BytesMut;
use protocol::{PipeInfo, UsbError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Count of transfers submitted on a pipe and not yet completed
#[derive(Debug, Default)]
pub(crate) struct PipeActivity {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl PipeActivity {
    fn begin(self: &Arc<Self>) -> ActivityGuard {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        ActivityGuard(Arc::clone(self))
    }

    fn outstanding(&self) -> usize {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until nothing is in flight; false if `timeout` ran out first
    fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |outstanding| *outstanding > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == 0
    }
}

/// Held by an in-flight request; marks its pipe busy until dropped
#[derive(Debug)]
pub(crate) struct ActivityGuard(Arc<PipeActivity>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut outstanding = self
            .0
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.0.idle.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// One configured pipe of an interface
#[derive(Debug)]
pub struct EndpointChannel {
    interface: InterfaceHandle,
    pipe: PipeHandle,
    info: PipeInfo,
    activity: Arc<PipeActivity>,
}

impl EndpointChannel {
    /// Bind to the `pipe_index`-th configured pipe of `interface`
    ///
    /// # Panics
    ///
    /// If the transport has no such pipe. Callers only ask for indices
    /// below the configured pipe count the transport just reported.
    pub(crate) fn create(
        transport: &dyn Transport,
        interface: InterfaceHandle,
        pipe_index: u8,
    ) -> Self {
        let (pipe, info) = transport
            .configured_pipe(interface, pipe_index)
            .unwrap_or_else(|| {
                panic!(
                    "{:?} reported pipe {} but returned no handle for it",
                    interface, pipe_index
                )
            });

        // Redirected traffic is not bound by the descriptor's wMaxPacketSize
        transport.disable_max_packet_size_check(pipe);

        debug!(
            "Created channel for endpoint {:#04x} ({:?}, max packet {})",
            info.endpoint_address, info.pipe_type, info.max_packet_size
        );

        Self {
            interface,
            pipe,
            info,
            activity: Arc::default(),
        }
    }

    pub fn endpoint_address(&self) -> u8 {
        self.info.endpoint_address
    }

    pub fn info(&self) -> &PipeInfo {
        &self.info
    }

    pub fn pipe_handle(&self) -> PipeHandle {
        self.pipe
    }

    pub fn interface_handle(&self) -> InterfaceHandle {
        self.interface
    }

    /// Transfers submitted on this pipe that have not completed yet
    pub fn outstanding(&self) -> usize {
        self.activity.outstanding()
    }

    /// Read from the pipe into `buffer`
    ///
    /// The request always completes: asynchronously once the transfer
    /// finishes, or before this returns if it could not be formatted or
    /// sent.
    pub fn read_async(&self, transport: &dyn Transport, request: Request, buffer: BytesMut) {
        self.submit(transport, request, buffer, Direction::Read);
    }

    /// Write `buffer` to the pipe
    ///
    /// Same completion rules as [`read_async`](Self::read_async).
    pub fn write_async(&self, transport: &dyn Transport, request: Request, buffer: BytesMut) {
        self.submit(transport, request, buffer, Direction::Write);
    }

    /// Abort every transfer in flight on the pipe and wait for them
    pub fn abort(&self, transport: &dyn Transport, request: Option<&Request>) -> Result<()> {
        transport
            .abort_pipe_synchronously(self.pipe, request.map(Request::id))
            .map_err(|e| {
                error!(
                    "Abort of endpoint {:#04x} failed: {}",
                    self.endpoint_address(),
                    e
                );
                TargetError::from(e)
            })
    }

    /// Abort whatever is in flight ahead of a reconfiguration
    ///
    /// Does nothing when the pipe is idle.
    pub(crate) fn begin_drain(&self, transport: &dyn Transport) {
        let outstanding = self.outstanding();
        if outstanding == 0 {
            return;
        }

        debug!(
            "Draining {} transfers on endpoint {:#04x}",
            outstanding,
            self.endpoint_address()
        );
        if let Err(e) = self.abort(transport, None) {
            warn!(
                "Abort during drain of endpoint {:#04x} failed: {}",
                self.endpoint_address(),
                e
            );
        }
    }

    /// Wait for aborted transfers to complete
    ///
    /// Returns the number still outstanding if they did not drain in time.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> std::result::Result<(), usize> {
        if self.activity.wait_idle(timeout) {
            Ok(())
        } else {
            Err(self.outstanding())
        }
    }

    fn submit(
        &self,
        transport: &dyn Transport,
        mut request: Request,
        buffer: BytesMut,
        direction: Direction,
    ) {
        let formatted: std::result::Result<(), UsbError> = match direction {
            Direction::Read => transport.format_pipe_read(self.pipe, &mut request, buffer),
            Direction::Write => transport.format_pipe_write(self.pipe, &mut request, buffer),
        };

        if let Err(e) = formatted {
            error!(
                "Format {:?} on endpoint {:#04x} failed: {}",
                direction,
                self.endpoint_address(),
                e
            );
            request.complete(Err(TargetError::from(e)));
            return;
        }

        trace!(
            "Submitting {:?} {:?} on endpoint {:#04x}",
            direction,
            request.id(),
            self.endpoint_address()
        );

        // A request left undetached by a failed send completes with the
        // send status when it goes out of scope below
        if let Err(e) = request.send_with_completion(
            transport,
            IoTarget::Pipe(self.pipe),
            Some(self.activity.begin()),
        ) {
            error!(
                "Send {:?} on endpoint {:#04x} failed: {}",
                direction,
                self.endpoint_address(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDevice, SimulatedTransport};
    use crate::transport::ConfigSelection;
    use protocol::RequestId;

    fn first_channel(transport: &SimulatedTransport) -> EndpointChannel {
        let target = transport.create_target(0x602).unwrap();
        transport
            .select_configuration(target, ConfigSelection::AllInterfacesDefaultSettings)
            .unwrap();
        let interface = transport.interface(target, 0).unwrap();
        transport.select_setting(interface, 0).unwrap();
        EndpointChannel::create(transport, interface, 0)
    }

    #[test]
    fn test_create_disables_packet_size_check() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);
        assert_eq!(channel.endpoint_address(), 0x81);
        assert!(transport.packet_size_check_disabled(channel.pipe_handle()));
    }

    #[test]
    fn test_format_failure_completes_synchronously() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);
        transport.faults().format = Some(UsbError::InvalidParam);

        let (request, mut completion) = Request::new(RequestId(1));
        channel.write_async(&transport, request, BytesMut::zeroed(64));

        let done = completion.try_take().expect("completed before returning");
        assert_eq!(done.status, Err(TargetError::Transport(UsbError::InvalidParam)));
        assert!(transport.submissions().is_empty());
        assert_eq!(channel.outstanding(), 0);
    }

    #[test]
    fn test_send_failure_completes_once_with_send_status() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);
        transport.faults().send = Some(UsbError::NoDevice);

        let (request, mut completion) = Request::new(RequestId(2));
        channel.read_async(&transport, request, BytesMut::zeroed(512));

        let done = completion.try_take().unwrap();
        assert_eq!(done.status, Err(TargetError::Transport(UsbError::NoDevice)));
        assert!(completion.try_take().is_none());
        assert_eq!(channel.outstanding(), 0);
    }

    #[test]
    fn test_read_completes_asynchronously() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);

        let (request, mut completion) = Request::new(RequestId(3));
        channel.read_async(&transport, request, BytesMut::zeroed(512));
        assert!(completion.try_take().is_none());
        assert_eq!(channel.outstanding(), 1);

        assert!(transport.complete_next(channel.pipe_handle(), Ok(b"hello".to_vec())));
        let done = completion.try_take().unwrap();
        assert_eq!(done.data(), b"hello");
        assert_eq!(channel.outstanding(), 0);
    }

    #[test]
    fn test_drain_aborts_outstanding() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);

        let (request, mut completion) = Request::new(RequestId(4));
        channel.read_async(&transport, request, BytesMut::zeroed(512));
        assert_eq!(channel.outstanding(), 1);

        channel.begin_drain(&transport);
        assert_eq!(channel.wait_drained(Duration::from_millis(100)), Ok(()));
        assert_eq!(
            completion.try_take().unwrap().status,
            Err(TargetError::Transport(UsbError::Cancelled))
        );
    }

    #[test]
    fn test_drain_times_out_when_abort_does_not_drain() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);
        transport.faults().abort_leaves_pending = true;

        let (request, _completion) = Request::new(RequestId(5));
        channel.read_async(&transport, request, BytesMut::zeroed(512));

        channel.begin_drain(&transport);
        assert_eq!(channel.wait_drained(Duration::from_millis(20)), Err(1));
    }

    #[test]
    fn test_idle_pipe_drain_skips_abort() {
        let transport = SimulatedTransport::new(SimulatedDevice::mass_storage());
        let channel = first_channel(&transport);

        channel.begin_drain(&transport);
        assert_eq!(channel.wait_drained(Duration::ZERO), Ok(()));
        assert_eq!(transport.stats().aborts, 0);
    }
}
