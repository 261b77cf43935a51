//! Functional interfaces
//!
//! A [`FunctionalInterface`] owns the endpoint channels of one USB
//! interface's current alternate setting. Selecting a new setting drains
//! and destroys the old channels before the new ones are built, all under
//! the interface's write lock, so lookups never observe a half-built set.

use crate::error::{Result, TargetError};
use crate::pipe::EndpointChannel;
use crate::transport::{InterfaceHandle, TargetHandle, Transport};
use protocol::PipeInfo;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Alternate-setting state of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltSetting {
    /// The setting was selected and the pipes match it
    Selected(u8),
    /// A select failed and the hardware may be on either setting
    ///
    /// The pipes still describe the last setting that was selected
    /// successfully. `reported` is what the transport says the hardware
    /// is on, when it can tell.
    Indeterminate { requested: u8, reported: Option<u8> },
}

/// Current setting and pipes of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub index: u8,
    pub alt_setting: AltSetting,
    pub pipes: Vec<PipeInfo>,
}

#[derive(Debug)]
struct InterfaceState {
    alt_setting: AltSetting,
    pipes: Vec<Arc<EndpointChannel>>,
}

/// One interface of the selected configuration
#[derive(Debug)]
pub struct FunctionalInterface {
    index: u8,
    target: TargetHandle,
    interface: InterfaceHandle,
    quiesce_timeout: Duration,
    state: RwLock<InterfaceState>,
}

/// A channel found by endpoint address, with the interface's read lock held
///
/// Keeps a reconfiguration from replacing the channel while a transfer is
/// being submitted on it. Never held past the submitting call.
pub(crate) struct PipeRef<'a> {
    guard: RwLockReadGuard<'a, InterfaceState>,
    position: usize,
}

impl PipeRef<'_> {
    pub(crate) fn channel(&self) -> Arc<EndpointChannel> {
        Arc::clone(&self.guard.pipes[self.position])
    }
}

impl Deref for PipeRef<'_> {
    type Target = EndpointChannel;

    fn deref(&self) -> &EndpointChannel {
        &self.guard.pipes[self.position]
    }
}

impl std::fmt::Debug for PipeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeRef").field(&**self).finish()
    }
}

impl FunctionalInterface {
    /// Resolve interface `index` of `target` and select alternate setting 0
    ///
    /// # Panics
    ///
    /// If the transport has no handle for `index`; callers only pass
    /// indices below the interface count the transport reported.
    pub(crate) fn create(
        transport: &dyn Transport,
        target: TargetHandle,
        index: u8,
        quiesce_timeout: Duration,
    ) -> Result<Self> {
        let interface = transport.interface(target, index).unwrap_or_else(|| {
            panic!(
                "{:?} reported interface {} but returned no handle for it",
                target, index
            )
        });

        let this = Self {
            index,
            target,
            interface,
            quiesce_timeout,
            state: RwLock::new(InterfaceState {
                alt_setting: AltSetting::Selected(0),
                pipes: Vec::new(),
            }),
        };

        this.set_alt_setting(transport, 0)?;
        Ok(this)
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn handle(&self) -> InterfaceHandle {
        self.interface
    }

    pub fn target(&self) -> TargetHandle {
        self.target
    }

    pub fn alt_setting(&self) -> AltSetting {
        self.read_state().alt_setting
    }

    /// Number of pipes in the current alternate setting
    pub fn pipe_count(&self) -> usize {
        self.read_state().pipes.len()
    }

    pub fn endpoints(&self) -> Vec<PipeInfo> {
        self.read_state().pipes.iter().map(|p| *p.info()).collect()
    }

    pub fn snapshot(&self) -> InterfaceSnapshot {
        let state = self.read_state();
        InterfaceSnapshot {
            index: self.index,
            alt_setting: state.alt_setting,
            pipes: state.pipes.iter().map(|p| *p.info()).collect(),
        }
    }

    /// Switch the interface to `alt_setting` and rebuild its pipes
    ///
    /// Every pipe with transfers in flight is aborted, then all of them
    /// get one shared quiesce timeout to drain. If any pipe is still busy
    /// when it runs out, `Busy` is returned and the setting and pipes are
    /// unchanged, but the aborted transfers stay aborted. A failed select
    /// leaves the pipes as they were and the setting indeterminate unless
    /// the transport confirms the hardware stayed put.
    pub fn set_alt_setting(&self, transport: &dyn Transport, alt_setting: u8) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for pipe in &state.pipes {
            pipe.begin_drain(transport);
        }

        let deadline = Instant::now() + self.quiesce_timeout;
        let mut outstanding = 0;
        for pipe in &state.pipes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(left) = pipe.wait_drained(remaining) {
                error!(
                    "Interface {}: {} transfers on endpoint {:#04x} did not drain",
                    self.index,
                    left,
                    pipe.endpoint_address()
                );
                outstanding += left;
            }
        }
        if outstanding > 0 {
            return Err(TargetError::Busy {
                interface: self.index,
                outstanding,
            });
        }

        if let Err(e) = transport.select_setting(self.interface, alt_setting) {
            error!(
                "Interface {}: select setting {} failed: {}",
                self.index, alt_setting, e
            );
            state.alt_setting = self.settle_after_failure(transport, state.alt_setting, alt_setting);
            return Err(TargetError::from(e));
        }

        // Old channels are gone before any new one exists
        state.pipes.clear();
        state.alt_setting = AltSetting::Selected(alt_setting);

        let count = transport.configured_pipe_count(self.interface);
        if count == 0 {
            debug!(
                "Interface {}: setting {} has no pipes",
                self.index, alt_setting
            );
            return Ok(());
        }

        let mut pipes = Vec::new();
        if pipes.try_reserve_exact(usize::from(count)).is_err() {
            error!(
                "Interface {}: failed to allocate {} pipes",
                self.index, count
            );
            return Err(TargetError::ResourceExhausted);
        }

        for pipe_index in 0..count {
            pipes.push(Arc::new(EndpointChannel::create(
                transport,
                self.interface,
                pipe_index,
            )));
        }
        state.pipes = pipes;

        debug!(
            "Interface {}: setting {} selected with {} pipes",
            self.index, alt_setting, count
        );
        Ok(())
    }

    /// First channel (in pipe index order) with the given endpoint address
    ///
    /// The returned handle does not pin the interface: a later
    /// reconfiguration drops the channel from the interface, and I/O on
    /// the stale handle fails at the transport.
    pub fn find_pipe_by_endpoint_address(
        &self,
        endpoint_address: u8,
    ) -> Option<Arc<EndpointChannel>> {
        self.lock_pipe(endpoint_address).map(|pipe| pipe.channel())
    }

    /// Like [`find_pipe_by_endpoint_address`](Self::find_pipe_by_endpoint_address),
    /// holding the read lock for the life of the result
    pub(crate) fn lock_pipe(&self, endpoint_address: u8) -> Option<PipeRef<'_>> {
        let guard = self.read_state();
        let position = guard
            .pipes
            .iter()
            .position(|p| p.endpoint_address() == endpoint_address)?;
        Some(PipeRef { guard, position })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, InterfaceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle_after_failure(
        &self,
        transport: &dyn Transport,
        previous: AltSetting,
        requested: u8,
    ) -> AltSetting {
        let reported = transport.current_setting(self.interface);
        match (previous, reported) {
            (AltSetting::Selected(prev), Some(current)) if prev == current => previous,
            _ => {
                warn!(
                    "Interface {}: setting indeterminate after failed select of {} (hardware reports {:?})",
                    self.index, requested, reported
                );
                AltSetting::Indeterminate {
                    requested,
                    reported,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::sim::{SimulatedDevice, SimulatedTransport};
    use crate::transport::ConfigSelection;
    use bytes::BytesMut;
    use protocol::{RequestId, UsbError};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn setup(device: SimulatedDevice) -> (SimulatedTransport, TargetHandle) {
        let transport = SimulatedTransport::new(device);
        let target = transport.create_target(0x602).unwrap();
        transport
            .select_configuration(target, ConfigSelection::AllInterfacesDefaultSettings)
            .unwrap();
        (transport, target)
    }

    #[test]
    fn test_create_selects_setting_zero() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();

        assert_eq!(iface.alt_setting(), AltSetting::Selected(0));
        assert_eq!(iface.pipe_count(), 0);
    }

    #[test]
    fn test_rebuild_matches_reported_pipe_count() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();

        iface.set_alt_setting(&transport, 2).unwrap();
        assert_eq!(iface.alt_setting(), AltSetting::Selected(2));
        assert_eq!(
            iface.pipe_count(),
            usize::from(transport.configured_pipe_count(iface.handle()))
        );
        assert_eq!(
            iface
                .endpoints()
                .iter()
                .map(|p| p.endpoint_address)
                .collect::<Vec<_>>(),
            vec![0x01, 0x82]
        );
    }

    #[test]
    fn test_old_channels_unreachable_after_rebuild() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 1).unwrap();

        let old = Arc::downgrade(&iface.find_pipe_by_endpoint_address(0x01).unwrap());
        iface.set_alt_setting(&transport, 2).unwrap();

        assert!(old.upgrade().is_none());
        let new = iface.find_pipe_by_endpoint_address(0x01).unwrap();
        assert_ne!(new.info().max_packet_size, 0);
    }

    #[test]
    fn test_zero_pipe_setting_clears_channels() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 1).unwrap();
        assert_eq!(iface.pipe_count(), 1);

        iface.set_alt_setting(&transport, 0).unwrap();
        assert_eq!(iface.pipe_count(), 0);
        assert!(iface.find_pipe_by_endpoint_address(0x01).is_none());
    }

    #[test]
    fn test_failed_select_keeps_pipes() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 1).unwrap();

        transport.faults().select_setting = Some(UsbError::Pipe);
        let err = iface.set_alt_setting(&transport, 2).unwrap_err();

        assert_eq!(err, TargetError::Transport(UsbError::Pipe));
        assert_eq!(iface.pipe_count(), 1);
        // Simulated hardware stayed on setting 1 and says so
        assert_eq!(iface.alt_setting(), AltSetting::Selected(1));
    }

    #[test]
    fn test_failed_select_that_moved_hardware_is_indeterminate() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 1).unwrap();

        transport.faults().select_setting = Some(UsbError::Io);
        transport.faults().select_applies_before_failing = true;
        iface.set_alt_setting(&transport, 2).unwrap_err();

        assert_eq!(
            iface.alt_setting(),
            AltSetting::Indeterminate {
                requested: 2,
                reported: Some(2)
            }
        );
        assert_eq!(iface.pipe_count(), 1);
    }

    #[test]
    fn test_reconfigure_drains_in_flight_reads() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 2).unwrap();

        let (request, mut completion) = Request::new(RequestId(1));
        iface
            .find_pipe_by_endpoint_address(0x82)
            .unwrap()
            .read_async(&transport, request, BytesMut::zeroed(64));
        assert!(completion.try_take().is_none());

        iface.set_alt_setting(&transport, 0).unwrap();
        assert_eq!(
            completion.try_take().unwrap().status,
            Err(TargetError::Transport(UsbError::Cancelled))
        );
    }

    #[test]
    fn test_reconfigure_refused_when_drain_times_out() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 2).unwrap();
        transport.faults().abort_leaves_pending = true;

        let (request, _completion) = Request::new(RequestId(2));
        iface
            .find_pipe_by_endpoint_address(0x82)
            .unwrap()
            .read_async(&transport, request, BytesMut::zeroed(64));

        let err = iface.set_alt_setting(&transport, 0).unwrap_err();
        assert_eq!(
            err,
            TargetError::Busy {
                interface: 1,
                outstanding: 1
            }
        );
        assert_eq!(iface.alt_setting(), AltSetting::Selected(2));
        assert_eq!(iface.pipe_count(), 2);
    }

    #[test]
    fn test_busy_drain_aborts_every_pipe_first() {
        let (transport, target) = setup(SimulatedDevice::alt_switching_audio());
        let iface = FunctionalInterface::create(&transport, target, 1, TIMEOUT).unwrap();
        iface.set_alt_setting(&transport, 2).unwrap();
        transport.faults().abort_leaves_pending = true;

        let (write, _write_completion) = Request::new(RequestId(3));
        iface
            .find_pipe_by_endpoint_address(0x01)
            .unwrap()
            .write_async(&transport, write, BytesMut::from(&b"data"[..]));
        let (read, _read_completion) = Request::new(RequestId(4));
        iface
            .find_pipe_by_endpoint_address(0x82)
            .unwrap()
            .read_async(&transport, read, BytesMut::zeroed(64));

        let aborts_before = transport.stats().aborts;
        let err = iface.set_alt_setting(&transport, 0).unwrap_err();

        // The first stuck pipe does not stop the second from being aborted
        assert_eq!(transport.stats().aborts - aborts_before, 2);
        assert_eq!(
            err,
            TargetError::Busy {
                interface: 1,
                outstanding: 2
            }
        );
        assert_eq!(iface.alt_setting(), AltSetting::Selected(2));
        assert_eq!(iface.pipe_count(), 2);
    }
}
