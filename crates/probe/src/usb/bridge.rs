//! Channel bridge between transport callers and the USB worker thread
//!
//! `Transport` methods are synchronous and may be called from any thread.
//! They reach the worker through a bounded async-channel and, when they
//! need an answer, wait on a tokio oneshot the worker replies on.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceDescriptor, PipeInfo, SetupPacket, UsbError};
use tokio::sync::oneshot;
use usbtarget::InFlightRequest;

/// Endpoint layout of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    /// bInterfaceNumber
    pub number: u8,
    /// `(bAlternateSetting, pipes)` for every alternate setting
    pub alt_settings: Vec<(u8, Vec<PipeInfo>)>,
}

impl InterfaceLayout {
    pub fn pipes_for(&self, alt_setting: u8) -> Option<&[PipeInfo]> {
        self.alt_settings
            .iter()
            .find(|(setting, _)| *setting == alt_setting)
            .map(|(_, pipes)| pipes.as_slice())
    }
}

/// A formatted request queued for execution
#[derive(Debug)]
pub struct Submission {
    /// Pipe the transfer runs on, `None` for the default control pipe
    pub endpoint: Option<PipeInfo>,
    pub request: InFlightRequest,
}

/// Commands from transport callers to the USB thread
#[derive(Debug)]
pub enum WorkerCommand {
    /// Open the device and claim its interfaces
    OpenTarget {
        response: oneshot::Sender<Result<DeviceDescriptor, UsbError>>,
    },

    /// Cancel queued transfers, release interfaces and close the device
    CloseTarget { response: oneshot::Sender<()> },

    /// Read the endpoint layout of the active configuration
    ReadConfiguration {
        response: oneshot::Sender<Result<Vec<InterfaceLayout>, UsbError>>,
    },

    /// SET_INTERFACE on an interface
    SetAltSetting {
        interface_number: u8,
        alt_setting: u8,
        response: oneshot::Sender<Result<(), UsbError>>,
    },

    /// Run a control-IN request synchronously
    ControlIn {
        setup: SetupPacket,
        length: usize,
        response: oneshot::Sender<Result<Vec<u8>, UsbError>>,
    },

    /// Queue a transfer; its request completes when the worker runs it
    Submit(Submission),

    /// Cancel every queued transfer on an endpoint, replying with the count
    Abort {
        endpoint_address: u8,
        response: oneshot::Sender<usize>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Caller-side handle
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<WorkerCommand>,
}

impl UsbBridge {
    /// Send a command to the USB thread (blocking)
    pub fn send_command(&self, cmd: WorkerCommand) -> common::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Send a command built around a reply channel and wait for the reply
    ///
    /// Must not be called from inside an async runtime.
    pub fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> common::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(make(tx))?;
        rx.blocking_recv()
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Queue a transfer, handing it back if the worker is gone
    pub fn submit(&self, submission: Submission) -> Result<(), Submission> {
        self.cmd_tx
            .send_blocking(WorkerCommand::Submit(submission))
            .map_err(|e| match e.into_inner() {
                WorkerCommand::Submit(submission) => submission,
                _ => unreachable!("only Submit is sent here"),
            })
    }
}

/// Handle for the USB thread
pub struct UsbWorker {
    cmd_rx: Receiver<WorkerCommand>,
}

impl UsbWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> common::Result<WorkerCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<WorkerCommand> {
        self.cmd_rx.try_recv().ok()
    }
}

/// Create the channel bridge
///
/// Returns (UsbBridge for callers, UsbWorker for the USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    (UsbBridge { cmd_tx }, UsbWorker { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let (bridge, worker) = create_usb_bridge();

        let handle = std::thread::spawn(move || match worker.recv_command().unwrap() {
            WorkerCommand::Abort {
                endpoint_address,
                response,
            } => {
                let _ = response.send(usize::from(endpoint_address));
            }
            other => panic!("unexpected command {:?}", other),
        });

        let cancelled = bridge
            .request(|response| WorkerCommand::Abort {
                endpoint_address: 3,
                response,
            })
            .unwrap();
        assert_eq!(cancelled, 3);
        handle.join().unwrap();
    }

    #[test]
    fn test_request_fails_when_worker_gone() {
        let (bridge, worker) = create_usb_bridge();
        drop(worker);

        let result = bridge.request(|response| WorkerCommand::CloseTarget { response });
        assert!(matches!(result, Err(common::Error::Channel(_))));
    }
}
