//! USB worker thread
//!
//! Dedicated thread that owns the libusb device handle. Transport callers
//! reach it through the channel bridge; queued transfers run one at a time
//! with rusb's synchronous API, and commands are picked up between
//! transfers so an abort can cancel whatever is still queued.

use crate::usb::bridge::{Submission, UsbWorker, WorkerCommand};
use crate::usb::device::UsbDevice;
use crate::usb::transfers::{execute_control_in, execute_transfer, map_rusb_error};
use protocol::UsbError;
use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// USB worker thread state
pub struct UsbWorkerThread {
    device: UsbDevice,
    worker: UsbWorker,
    /// Transfers waiting to run, in submission order
    queue: VecDeque<Submission>,
    timeout: Duration,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, device: UsbDevice, timeout: Duration) -> Self {
        Self {
            device,
            worker,
            queue: VecDeque::new(),
            timeout,
        }
    }

    /// Run until Shutdown is received or every bridge handle is dropped
    ///
    /// With nothing queued the thread blocks on the command channel.
    /// Otherwise it drains pending commands first, then runs one transfer.
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            let command = if self.queue.is_empty() {
                match self.worker.recv_command() {
                    Ok(cmd) => Some(cmd),
                    Err(e) => {
                        debug!("Command channel closed: {}", e);
                        break;
                    }
                }
            } else {
                self.worker.try_recv_command()
            };

            match command {
                Some(WorkerCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => self.run_next_transfer(),
            }
        }

        self.cancel_queued(None);
        self.device.close();
        info!("USB worker thread stopped");
    }

    /// Handle a command from a transport caller
    fn handle_command(&mut self, cmd: WorkerCommand) {
        // Wrap in catch_unwind to prevent panics from crashing the USB thread
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::OpenTarget { response } => {
                let result = self.device.open().map(|()| self.device.descriptor());
                debug!("Open target: {:?}", result.as_ref().map(|_| ()));
                let _ = response.send(result);
            }

            WorkerCommand::CloseTarget { response } => {
                let cancelled = self.cancel_queued(None);
                debug!("Closing target, cancelled {} queued transfers", cancelled);
                self.device.close();
                let _ = response.send(());
            }

            WorkerCommand::ReadConfiguration { response } => {
                let _ = response.send(self.device.interface_layout());
            }

            WorkerCommand::SetAltSetting {
                interface_number,
                alt_setting,
                response,
            } => {
                debug!(
                    "Selecting alternate setting {} on interface {}",
                    alt_setting, interface_number
                );
                let result = match self.device.handle() {
                    Some(handle) => handle
                        .set_alternate_setting(interface_number, alt_setting)
                        .map_err(map_rusb_error),
                    None => Err(UsbError::NoDevice),
                };
                let _ = response.send(result);
            }

            WorkerCommand::ControlIn {
                setup,
                length,
                response,
            } => {
                let result = match self.device.handle() {
                    Some(handle) => execute_control_in(handle, &setup, length, self.timeout),
                    None => Err(UsbError::NoDevice),
                };
                let _ = response.send(result);
            }

            WorkerCommand::Submit(submission) => {
                self.queue.push_back(submission);
            }

            WorkerCommand::Abort {
                endpoint_address,
                response,
            } => {
                let cancelled = self.cancel_queued(Some(endpoint_address));
                debug!(
                    "Aborted {} queued transfers on endpoint {:#04x}",
                    cancelled, endpoint_address
                );
                let _ = response.send(cancelled);
            }

            WorkerCommand::Shutdown => {
                // Handled in the run loop
            }
        }
    }

    fn run_next_transfer(&mut self) {
        let Some(Submission { endpoint, request }) = self.queue.pop_front() else {
            return;
        };

        match self.device.handle() {
            Some(handle) => execute_transfer(handle, endpoint, request, self.timeout),
            None => {
                warn!("Transfer {:?} submitted with the device closed", request.id());
                request.complete(Err(UsbError::NoDevice));
            }
        }
    }

    /// Cancel queued transfers on `endpoint_address`, or all of them
    fn cancel_queued(&mut self, endpoint_address: Option<u8>) -> usize {
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.queue)
                .into_iter()
                .partition(|s| match endpoint_address {
                    Some(address) => s
                        .endpoint
                        .is_some_and(|info| info.endpoint_address == address),
                    None => true,
                });
        self.queue = kept;

        let count = cancelled.len();
        for submission in cancelled {
            submission.request.complete(Err(UsbError::Cancelled));
        }
        count
    }
}

/// Spawn the USB worker thread
///
/// The thread runs until a Shutdown command is received or the bridge is
/// dropped.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    device: UsbDevice,
    timeout: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(worker, device, timeout).run())
}
