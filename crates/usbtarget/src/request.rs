//! Request wrapper and completion channel
//!
//! A [`Request`] is the dispatch layer's handle on one I/O operation. It
//! is completed exactly once: either synchronously by the target layer
//! (lookup or formatting failure), by the transport after an asynchronous
//! send, or on drop with whatever terminal status it carries. The other
//! end of the completion channel is a [`CompletionFuture`].

use crate::error::{Result, TargetError};
use crate::pipe::ActivityGuard;
use crate::transport::{IoTarget, PipeHandle, SendError, TargetHandle, Transport};
use bytes::BytesMut;
use protocol::{RequestId, SetupPacket, UsbError};
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// Region of a control transfer's data buffer actually transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOffset {
    pub offset: usize,
    pub length: usize,
}

impl TransferOffset {
    /// Byte range within a buffer of `buffer_len` bytes, if it fits
    pub fn range(&self, buffer_len: usize) -> Option<Range<usize>> {
        let end = self.offset.checked_add(self.length)?;
        (end <= buffer_len).then_some(self.offset..end)
    }
}

/// A transfer a request has been formatted for
#[derive(Debug)]
pub enum Transfer {
    Read {
        pipe: PipeHandle,
        buffer: BytesMut,
    },
    Write {
        pipe: PipeHandle,
        buffer: BytesMut,
    },
    Control {
        target: TargetHandle,
        setup: SetupPacket,
        data: BytesMut,
        offset: Option<TransferOffset>,
    },
}

impl Transfer {
    /// Pipe this transfer runs on, `None` for the default control pipe
    pub fn pipe(&self) -> Option<PipeHandle> {
        match self {
            Transfer::Read { pipe, .. } | Transfer::Write { pipe, .. } => Some(*pipe),
            Transfer::Control { .. } => None,
        }
    }

    pub fn buffer(&self) -> &BytesMut {
        match self {
            Transfer::Read { buffer, .. } | Transfer::Write { buffer, .. } => buffer,
            Transfer::Control { data, .. } => data,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        match self {
            Transfer::Read { buffer, .. } | Transfer::Write { buffer, .. } => buffer,
            Transfer::Control { data, .. } => data,
        }
    }

    /// Buffer and the offset the transferred bytes start at
    fn into_parts(self) -> (BytesMut, usize) {
        match self {
            Transfer::Read { buffer, .. } | Transfer::Write { buffer, .. } => (buffer, 0),
            Transfer::Control { data, offset, .. } => {
                let start = offset
                    .and_then(|o| o.range(data.len()))
                    .map_or(0, |range| range.start);
                (data, start)
            }
        }
    }
}

/// Final outcome of a request
#[derive(Debug)]
pub struct Completion {
    pub request_id: RequestId,
    /// Bytes transferred, or the failure
    pub status: Result<usize>,
    /// The transfer buffer, handed back once the transport is done with it
    pub buffer: Option<BytesMut>,
    /// Where in `buffer` the transferred bytes start
    pub data_offset: usize,
}

impl Completion {
    fn cancelled(request_id: RequestId) -> Self {
        Self {
            request_id,
            status: Err(TargetError::Cancelled),
            buffer: None,
            data_offset: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// Transferred bytes for a successful completion, empty otherwise
    pub fn data(&self) -> &[u8] {
        match (&self.status, &self.buffer) {
            (Ok(len), Some(buffer)) => {
                let start = self.data_offset.min(buffer.len());
                let end = start.saturating_add(*len).min(buffer.len());
                &buffer[start..end]
            }
            _ => &[],
        }
    }
}

/// Resolves once the request it was created with completes
///
/// If the completion side disappears without reporting (transport torn
/// down with the request queued) the future resolves as `Cancelled`.
#[derive(Debug)]
pub struct CompletionFuture {
    request_id: RequestId,
    rx: Option<oneshot::Receiver<Completion>>,
}

impl CompletionFuture {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Take the completion if it has already arrived
    ///
    /// Returns `None` while the request is still pending, and after the
    /// completion has been taken once.
    pub fn try_take(&mut self) -> Option<Completion> {
        let rx = self.rx.as_mut()?;
        let completion = match rx.try_recv() {
            Ok(completion) => completion,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Completion::cancelled(self.request_id),
        };
        self.rx = None;
        Some(completion)
    }

    /// Block the current thread until the request completes
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait_blocking(mut self) -> Completion {
        match self.rx.take() {
            Some(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Completion::cancelled(self.request_id)),
            None => Completion::cancelled(self.request_id),
        }
    }
}

impl Future for CompletionFuture {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let request_id = self.request_id;
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Completion::cancelled(request_id));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(result) => {
                self.rx = None;
                Poll::Ready(result.unwrap_or_else(|_| Completion::cancelled(request_id)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Pending {
    completion: oneshot::Sender<Completion>,
    transfer: Option<Transfer>,
}

/// Caller-side wrapper around one I/O request
///
/// Until it is detached by a successful send, the wrapper owns the
/// request. Dropping an owned request completes it with its terminal
/// status (`Cancelled` if none was set).
pub struct Request {
    id: RequestId,
    pending: Option<Pending>,
    status: Option<TargetError>,
    detached: bool,
}

impl Request {
    /// Create a request and the future its completion is delivered to
    pub fn new(id: RequestId) -> (Self, CompletionFuture) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id,
            pending: Some(Pending {
                completion: tx,
                transfer: None,
            }),
            status: None,
            detached: false,
        };
        let future = CompletionFuture {
            request_id: id,
            rx: Some(rx),
        };
        (request, future)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Set the status the request completes with when released
    pub fn set_status(&mut self, status: TargetError) {
        self.status = Some(status);
    }

    pub fn status(&self) -> Option<&TargetError> {
        self.status.as_ref()
    }

    /// True once ownership has moved to the completion machinery
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Record the transfer this request was formatted for
    ///
    /// Called by transports from their `format_*` methods. Formatting a
    /// detached request has no effect.
    pub fn attach_transfer(&mut self, transfer: Transfer) {
        if let Some(pending) = self.pending.as_mut() {
            pending.transfer = Some(transfer);
        }
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.pending.as_ref().and_then(|p| p.transfer.as_ref())
    }

    /// Complete the request now
    pub fn complete(mut self, status: Result<usize>) {
        self.finish(status);
    }

    /// Send the formatted request to `io_target`
    ///
    /// On success the request is detached and the transport owns its
    /// completion. On failure the request stays with the caller carrying
    /// the send failure as its terminal status.
    pub(crate) fn send_with_completion(
        &mut self,
        transport: &dyn Transport,
        io_target: IoTarget,
        activity: Option<ActivityGuard>,
    ) -> Result<()> {
        let mut pending = self.pending.take().ok_or_else(|| {
            TargetError::InvalidParameter("request already detached".to_string())
        })?;

        let Some(transfer) = pending.transfer.take() else {
            self.pending = Some(pending);
            return Err(TargetError::InvalidParameter(
                "request has not been formatted".to_string(),
            ));
        };

        let in_flight = InFlightRequest {
            id: self.id,
            transfer,
            completion: pending.completion,
            activity,
        };

        match transport.send(io_target, in_flight) {
            Ok(()) => {
                trace!("Request {:?} detached to {:?}", self.id, io_target);
                self.detached = true;
                Ok(())
            }
            Err(SendError { request, error }) => {
                self.pending = Some(Pending {
                    completion: request.completion,
                    transfer: Some(request.transfer),
                });
                let error = TargetError::from(error);
                self.status = Some(error.clone());
                Err(error)
            }
        }
    }

    fn finish(&mut self, status: Result<usize>) {
        if let Some(pending) = self.pending.take() {
            trace!("Completing request {:?}: {:?}", self.id, status);
            let (buffer, data_offset) = match pending.transfer.map(Transfer::into_parts) {
                Some((buffer, offset)) => (Some(buffer), offset),
                None => (None, 0),
            };
            let _ = pending.completion.send(Completion {
                request_id: self.id,
                status,
                buffer,
                data_offset,
            });
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        let status = self.status.take().unwrap_or(TargetError::Cancelled);
        self.finish(Err(status));
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("detached", &self.detached)
            .field("formatted", &self.transfer().is_some())
            .finish()
    }
}

/// A request owned by the transport while it is in flight
///
/// Dropping it without calling [`complete`](Self::complete) resolves the
/// caller's future as `Cancelled`.
#[derive(Debug)]
pub struct InFlightRequest {
    id: RequestId,
    transfer: Transfer,
    completion: oneshot::Sender<Completion>,
    activity: Option<ActivityGuard>,
}

impl InFlightRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut Transfer {
        &mut self.transfer
    }

    /// Deliver the transport's result to the request's owner
    pub fn complete(self, status: std::result::Result<usize, UsbError>) {
        let InFlightRequest {
            id,
            transfer,
            completion,
            activity,
        } = self;

        trace!("Request {:?} finished: {:?}", id, status);
        let (buffer, data_offset) = transfer.into_parts();
        let _ = completion.send(Completion {
            request_id: id,
            status: status.map_err(TargetError::from),
            buffer: Some(buffer),
            data_offset,
        });
        // Pipe counts as busy until the owner can observe the completion
        drop(activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_offset_range() {
        let offset = TransferOffset {
            offset: 4,
            length: 8,
        };
        assert_eq!(offset.range(12), Some(4..12));
        assert_eq!(offset.range(11), None);

        let overflow = TransferOffset {
            offset: usize::MAX,
            length: 1,
        };
        assert_eq!(overflow.range(usize::MAX), None);
    }

    #[test]
    fn test_complete_delivers_status() {
        let (request, mut completion) = Request::new(RequestId(7));
        assert!(completion.try_take().is_none());

        request.complete(Ok(0));
        let done = completion.try_take().expect("completed synchronously");
        assert_eq!(done.request_id, RequestId(7));
        assert_eq!(done.status, Ok(0));
        assert!(completion.try_take().is_none());
    }

    #[test]
    fn test_drop_completes_with_terminal_status() {
        let (mut request, mut completion) = Request::new(RequestId(1));
        request.set_status(TargetError::NotFound { endpoint: 0x81 });
        drop(request);

        let done = completion.try_take().unwrap();
        assert_eq!(done.status, Err(TargetError::NotFound { endpoint: 0x81 }));
    }

    #[test]
    fn test_drop_without_status_is_cancelled() {
        let (request, mut completion) = Request::new(RequestId(2));
        drop(request);
        assert_eq!(
            completion.try_take().unwrap().status,
            Err(TargetError::Cancelled)
        );
    }

    #[test]
    fn test_completion_data_truncated_to_length() {
        let buffer = BytesMut::from(&b"abcdef"[..]);
        let completion = Completion {
            request_id: RequestId(3),
            status: Ok(3),
            buffer: Some(buffer),
            data_offset: 0,
        };
        assert_eq!(completion.data(), b"abc");
        assert!(completion.is_success());
    }

    #[test]
    fn test_completion_data_starts_at_control_offset() {
        let (mut request, mut completion) = Request::new(RequestId(6));
        request.attach_transfer(Transfer::Control {
            target: TargetHandle(1),
            setup: SetupPacket::get_descriptor(protocol::DescriptorType::Device, 0, 3),
            data: BytesMut::from(&b"xxxxabcyy"[..]),
            offset: Some(TransferOffset {
                offset: 4,
                length: 3,
            }),
        });

        request.complete(Ok(3));
        let done = completion.try_take().unwrap();
        assert_eq!(done.data_offset, 4);
        assert_eq!(done.data(), b"abc");
    }

    #[test]
    fn test_attach_transfer_returns_buffer_on_completion() {
        let (mut request, mut completion) = Request::new(RequestId(4));
        request.attach_transfer(Transfer::Read {
            pipe: PipeHandle(9),
            buffer: BytesMut::zeroed(16),
        });
        assert_eq!(request.transfer().and_then(Transfer::pipe), Some(PipeHandle(9)));

        request.complete(Err(TargetError::Cancelled));
        let done = completion.try_take().unwrap();
        assert_eq!(done.buffer.map(|b| b.len()), Some(16));
    }

    #[tokio::test]
    async fn test_future_resolves_cancelled_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<Completion>();
        let future = CompletionFuture {
            request_id: RequestId(5),
            rx: Some(rx),
        };
        drop(tx);

        let done = future.await;
        assert_eq!(done.status, Err(TargetError::Cancelled));
    }
}
