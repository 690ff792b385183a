use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::handler::PendingOperation;
use crate::http::status::StatusCode;
use crate::http::wake::{DataTrigger, WorkerWaker};
use crate::http::wire::Wire;
use crate::http::writer::{self, CHUNK_TERMINATOR, Framing, ResponseHead};

/// Lifecycle of one request/response exchange.
///
/// Transitions only move forward: `Initialized` to `Started` when the first
/// bytes are queued, `Started` to `Finished` on the last send or on any of
/// the failure paths. A reply never leaves `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// No bytes queued yet; headers and status are still changeable.
    Initialized,
    /// The response head is on the wire. `output_ready` is false exactly
    /// while a write is in flight. `cancelled` records a cancellation that
    /// arrived mid-write and is waiting for the wire to drain.
    Started { output_ready: bool, cancelled: bool },
    /// Terminal. No further output of any kind.
    Finished { reason: FinishReason },
}

/// Why a reply reached `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The handler completed the response.
    Completed,
    /// Cancelled before completion; the client got the cancellation notice
    /// or a truncated stream.
    Cancelled,
    /// Failed mid-flight via the error path.
    Aborted,
    /// The socket was gone; nothing more could be written.
    ConnectionLost,
}

/// Contract violations surfaced by [`Reply`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("Reply has already started")]
    AlreadyStarted,
    #[error("Request has already been finished")]
    AlreadyFinished,
    #[error("Pending operation is not assigned")]
    NotAssigned,
    #[error("Request has not been postponed")]
    NotPostponed,
    #[error("Request has already been postponed")]
    AlreadyPostponed,
    #[error("Request that has already started can't be postponed")]
    CannotBePostponed,
    #[error("Output is not in ready state")]
    OutputNotReady,
    #[error("Request handling can not be started after connection was closed")]
    ConnectionClosed,
}

/// Per-request output channel and terminal-state machine.
///
/// A `Reply` is the only place response bytes and terminal state are
/// managed. It queues serialized frames onto its connection's [`Wire`] and
/// guarantees that exactly one terminal outcome is produced no matter how
/// the request ends: handler completion, handler failure, cancellation or
/// connection loss.
///
/// Replies live on one worker thread. The only cross-thread surface is the
/// [`DataTrigger`] handed to asynchronous operations, which may be signalled
/// from anywhere.
pub struct Reply {
    id: u64,
    state: ReplyState,
    postponed: bool,
    chunked: bool,
    content_type: Option<String>,
    content_length: Option<u64>,
    keep_alive: bool,
    op: Option<Box<dyn PendingOperation>>,
    wire: Rc<Wire>,
    data_ready: Arc<DataTrigger>,
}

impl Reply {
    pub fn new(id: u64, keep_alive: bool, wire: Rc<Wire>, waker: WorkerWaker) -> Self {
        Self {
            id,
            state: ReplyState::Initialized,
            postponed: false,
            chunked: false,
            content_type: None,
            content_length: None,
            keep_alive,
            op: None,
            wire,
            data_ready: DataTrigger::new(waker),
        }
    }

    /// Declares the response body length. Valid only before the first send.
    pub fn set_content_length(&mut self, content_length: u64) -> Result<(), ReplyError> {
        match self.state {
            ReplyState::Initialized => {
                self.content_length = Some(content_length);
                Ok(())
            }
            _ => Err(ReplyError::AlreadyStarted),
        }
    }

    /// Declares the response content type. Valid only before the first send.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> Result<(), ReplyError> {
        match self.state {
            ReplyState::Initialized => {
                self.content_type = Some(content_type.into());
                Ok(())
            }
            _ => Err(ReplyError::AlreadyStarted),
        }
    }

    /// Hands the reply its asynchronous operation. The reply owns the
    /// operation until it is torn down.
    pub fn assign_pending_operation(&mut self, op: Box<dyn PendingOperation>) {
        self.op = Some(op);
    }

    pub fn pending_operation_mut(
        &mut self,
    ) -> Result<&mut (dyn PendingOperation + 'static), ReplyError> {
        self.op.as_deref_mut().ok_or(ReplyError::NotAssigned)
    }

    /// Marks that completion will happen asynchronously. Required before
    /// peek or cancel may be forwarded to the pending operation.
    pub fn set_postponed(&mut self) {
        self.postponed = true;
    }

    pub fn is_postponed(&self) -> bool {
        self.postponed
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ReplyState::Finished { .. })
    }

    pub fn is_output_ready(&self) -> bool {
        match self.state {
            ReplyState::Initialized => true,
            ReplyState::Started { output_ready, .. } => output_ready,
            ReplyState::Finished { .. } => false,
        }
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Cross-thread completion handle for this reply. An asynchronous
    /// operation signals it from any thread to get the owning worker to
    /// peek this reply.
    pub fn data_ready(&self) -> Arc<DataTrigger> {
        Arc::clone(&self.data_ready)
    }

    pub fn check_reset_data_triggered(&self) -> bool {
        self.data_ready.check_reset()
    }

    /// Appends response output.
    ///
    /// The first send opens the stream: with a declared content length the
    /// body is written raw, otherwise the response switches to chunked
    /// framing. `is_last` finishes the reply. Only one send may be in
    /// flight; further sends before the write completes fail with
    /// `OutputNotReady`. Sending an empty payload with `is_last` false is
    /// a no-op.
    pub fn send(&mut self, payload: &[u8], is_last: bool) -> Result<(), ReplyError> {
        self.do_send(payload, is_last, StatusCode::Ok)
    }

    /// Sends `payload` as the complete 200 response body.
    pub fn send_ok(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.do_send(payload, true, StatusCode::Ok)
    }

    /// Sends `payload` as the complete 202 response body.
    pub fn send_accepted(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.do_send(payload, true, StatusCode::Accepted)
    }

    pub fn send_bad_request(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::BadRequest, payload)
    }

    pub fn send_unauthorized(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::Unauthorized, payload)
    }

    pub fn send_not_found(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::NotFound, payload)
    }

    pub fn send_conflict(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::Conflict, payload)
    }

    pub fn send_internal_error(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::InternalServerError, payload)
    }

    pub fn send_bad_gateway(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::BadGateway, payload)
    }

    pub fn send_unavailable(&mut self, payload: &[u8]) -> Result<(), ReplyError> {
        self.send_error_response(StatusCode::ServiceUnavailable, payload)
    }

    /// Forwards to the pending operation's peek. Any failure from the
    /// asynchronous logic is absorbed into the unified [`Reply::error`]
    /// path rather than propagated.
    pub fn peek_pending(&mut self) {
        if let Err(e) = self.try_peek() {
            self.error(&format!("{e:#}"));
        }
    }

    /// Forwards a best-effort cancel to the pending operation and drives
    /// this reply toward its single terminal notice. Idempotent.
    pub fn cancel_pending(&mut self) -> Result<(), ReplyError> {
        if !self.postponed {
            return Err(ReplyError::NotPostponed);
        }
        self.do_cancel();
        Ok(())
    }

    /// Unified failure path. While `Initialized` the client gets a 503
    /// carrying `what`; once `Started` the stream is torn down abruptly.
    /// Any pending operation is cancelled.
    pub fn error(&mut self, what: &str) {
        tracing::error!(reply = self.id, "request failed: {what}");

        match self.state {
            ReplyState::Initialized => {
                if self.wire.is_closed() {
                    self.finish_connection_lost();
                } else {
                    self.emit_error_body(
                        StatusCode::ServiceUnavailable,
                        what.as_bytes(),
                        FinishReason::Aborted,
                    );
                }
            }
            ReplyState::Started { output_ready: true, .. } => {
                if self.wire.is_closed() {
                    self.finish_connection_lost();
                } else {
                    self.emit_abort(FinishReason::Aborted);
                }
            }
            ReplyState::Started { output_ready: false, .. } => {
                // A write is in flight; the abort goes out when it drains.
                self.state = ReplyState::Started { output_ready: false, cancelled: true };
            }
            ReplyState::Finished { .. } => {}
        }

        if let Some(op) = self.op.as_mut() {
            op.cancel();
        }
    }

    /// Called by the connection when this reply's last queued write hit the
    /// socket. Returns whether the pending operation should be peeked.
    pub fn on_write_ready(&mut self) -> bool {
        match self.state {
            ReplyState::Started { output_ready: false, cancelled: true } => {
                self.state = ReplyState::Started { output_ready: true, cancelled: true };
                self.emit_abort(FinishReason::Cancelled);
                false
            }
            ReplyState::Started { output_ready: false, cancelled: false } => {
                self.state = ReplyState::Started { output_ready: true, cancelled: false };
                self.postponed
            }
            _ => false,
        }
    }

    /// Invokes the pending operation's start with this reply as the sink.
    pub(crate) fn start_pending(&mut self) -> anyhow::Result<()> {
        let mut op = match self.op.take() {
            Some(op) => op,
            None => return Err(ReplyError::NotAssigned.into()),
        };
        let res = op.start(self);
        self.op = Some(op);
        res
    }

    fn try_peek(&mut self) -> anyhow::Result<()> {
        if !self.postponed {
            return Err(ReplyError::NotPostponed.into());
        }
        let mut op = match self.op.take() {
            Some(op) => op,
            None => return Err(ReplyError::NotAssigned.into()),
        };
        let res = op.peek(self, true);
        self.op = Some(op);
        res
    }

    fn do_send(&mut self, payload: &[u8], is_last: bool, status: StatusCode) -> Result<(), ReplyError> {
        if payload.is_empty() && !is_last {
            return Ok(());
        }

        if self.wire.is_closed() {
            if !payload.is_empty() {
                tracing::error!(
                    reply = self.id,
                    bytes = payload.len(),
                    is_last,
                    "attempt to send on a closed connection"
                );
            }
            if is_last {
                self.finish_connection_lost();
            } else {
                self.do_cancel();
            }
            return Ok(());
        }

        match self.state {
            ReplyState::Initialized => {
                self.open_stream(payload, is_last, status);
                Ok(())
            }
            ReplyState::Started { output_ready: true, cancelled: false } => {
                self.push_body(payload, is_last);
                Ok(())
            }
            ReplyState::Started { output_ready: true, cancelled: true } => {
                // Cancelled while the stream was mid-write; the first
                // chance to act on it tears the stream down.
                self.emit_abort(FinishReason::Cancelled);
                Ok(())
            }
            ReplyState::Started { output_ready: false, .. } => Err(ReplyError::OutputNotReady),
            ReplyState::Finished { .. } => Err(ReplyError::AlreadyFinished),
        }
    }

    fn send_error_response(&mut self, status: StatusCode, payload: &[u8]) -> Result<(), ReplyError> {
        if self.wire.is_closed() {
            self.finish_connection_lost();
            return Ok(());
        }

        match self.state {
            ReplyState::Initialized => {
                self.emit_error_body(status, payload, FinishReason::Completed);
                Ok(())
            }
            ReplyState::Started { output_ready: true, .. } => {
                // The head is out; the error can only surface as a broken
                // stream.
                self.emit_abort(FinishReason::Aborted);
                Ok(())
            }
            ReplyState::Started { output_ready: false, .. } => Err(ReplyError::OutputNotReady),
            ReplyState::Finished { .. } => Err(ReplyError::AlreadyFinished),
        }
    }

    fn do_cancel(&mut self) {
        match self.state {
            ReplyState::Finished { .. } => return,
            ReplyState::Started { cancelled: true, .. } => {
                // Notice already deferred; a dead socket is the only thing
                // that changes the outcome now.
                if self.wire.is_closed() {
                    self.finish_connection_lost();
                }
                return;
            }
            _ => {}
        }

        if self.wire.is_closed() {
            self.finish_connection_lost();
        } else {
            match self.state {
                ReplyState::Initialized => {
                    self.emit_error_body(
                        StatusCode::ServiceUnavailable,
                        b"Request has been cancelled",
                        FinishReason::Cancelled,
                    );
                }
                ReplyState::Started { output_ready: true, .. } => {
                    self.emit_abort(FinishReason::Cancelled);
                }
                ReplyState::Started { output_ready: false, .. } => {
                    self.state = ReplyState::Started { output_ready: false, cancelled: true };
                }
                ReplyState::Finished { .. } => {}
            }
        }

        if let Some(op) = self.op.as_mut() {
            op.cancel();
        }
    }

    fn open_stream(&mut self, payload: &[u8], is_last: bool, status: StatusCode) {
        let framing = match (is_last, self.content_length) {
            (_, Some(declared)) => Framing::ContentLength(declared),
            (true, None) => Framing::ContentLength(payload.len() as u64),
            (false, None) => {
                self.chunked = true;
                Framing::Chunked
            }
        };

        let head = ResponseHead {
            status,
            content_type: self.content_type.as_deref(),
            framing,
            keep_alive: self.keep_alive,
        };

        let mut bytes = writer::serialize_head(&head);
        if self.chunked {
            bytes.extend_from_slice(&writer::serialize_chunk(payload));
            if is_last {
                bytes.extend_from_slice(CHUNK_TERMINATOR);
            }
        } else {
            bytes.extend_from_slice(payload);
        }

        self.push_frame(bytes, is_last);
    }

    fn push_body(&mut self, payload: &[u8], is_last: bool) {
        let bytes = if self.chunked {
            let mut framed = writer::serialize_chunk(payload);
            if is_last {
                framed.extend_from_slice(CHUNK_TERMINATOR);
            }
            framed
        } else {
            payload.to_vec()
        };

        self.push_frame(bytes, is_last);
    }

    fn push_frame(&mut self, bytes: Vec<u8>, is_last: bool) {
        let close_after = is_last && !self.keep_alive;
        self.wire.push_data(self.id, Bytes::from(bytes), close_after);

        if is_last {
            self.finish(FinishReason::Completed);
        } else {
            self.state = ReplyState::Started { output_ready: false, cancelled: false };
        }
    }

    fn emit_error_body(&mut self, status: StatusCode, payload: &[u8], reason: FinishReason) {
        let head = ResponseHead {
            status,
            content_type: self.content_type.as_deref().or(Some("text/plain")),
            framing: Framing::ContentLength(payload.len() as u64),
            keep_alive: self.keep_alive,
        };

        let mut bytes = writer::serialize_head(&head);
        bytes.extend_from_slice(payload);
        self.wire.push_data(self.id, Bytes::from(bytes), !self.keep_alive);
        self.finish(reason);
    }

    fn emit_abort(&mut self, reason: FinishReason) {
        self.wire.push_abort(self.id);
        self.finish(reason);
    }

    fn finish_connection_lost(&mut self) {
        self.finish(FinishReason::ConnectionLost);
        // Book-keeping on the owning worker has to converge even though no
        // write completion will ever arrive for this reply.
        self.data_ready.signal();
    }

    fn finish(&mut self, reason: FinishReason) {
        if !matches!(self.state, ReplyState::Finished { .. }) {
            self.state = ReplyState::Finished { reason };
        }
    }
}

// The boxed operation has no useful rendering; show the lifecycle fields.
impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("postponed", &self.postponed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(wire: &Rc<Wire>) -> Reply {
        Reply::new(1, true, Rc::clone(wire), WorkerWaker::new())
    }

    #[test]
    fn first_send_opens_chunked_stream() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.send(b"part one", false).unwrap();

        assert_eq!(
            r.state(),
            ReplyState::Started { output_ready: false, cancelled: false }
        );
        assert_eq!(wire.pending_frames(), 1);
    }

    #[test]
    fn empty_non_final_send_is_a_no_op() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.send(b"", false).unwrap();

        assert_eq!(r.state(), ReplyState::Initialized);
        assert_eq!(wire.pending_frames(), 0);
    }

    #[test]
    fn headers_are_frozen_once_started() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.set_content_type("application/json").unwrap();
        r.send_ok(b"{}").unwrap();

        assert_eq!(r.set_content_type("text/plain"), Err(ReplyError::AlreadyStarted));
        assert_eq!(r.set_content_length(2), Err(ReplyError::AlreadyStarted));
    }

    #[test]
    fn send_while_write_in_flight_is_rejected() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.send(b"first", false).unwrap();

        assert_eq!(r.send(b"second", false), Err(ReplyError::OutputNotReady));
        assert!(!r.on_write_ready());
        r.send(b"second", false).unwrap();
    }

    #[test]
    fn send_after_finished_is_a_violation() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.send_ok(b"done").unwrap();

        assert_eq!(r.send(b"more", false), Err(ReplyError::AlreadyFinished));
        assert_eq!(r.send_not_found(b"nope"), Err(ReplyError::AlreadyFinished));
    }

    #[test]
    fn send_on_closed_wire_finalizes_without_error() {
        let wire = Wire::new();
        let mut r = reply(&wire);
        wire.mark_closed();

        r.send_ok(b"anything").unwrap();

        assert_eq!(
            r.state(),
            ReplyState::Finished { reason: FinishReason::ConnectionLost }
        );
        assert_eq!(wire.pending_frames(), 0);
    }

    #[test]
    fn error_before_start_sends_service_unavailable() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.error("backend exploded");

        assert!(r.is_finished());
        assert_eq!(wire.pending_frames(), 1);
    }

    #[test]
    fn debug_render_names_id_and_state() {
        let wire = Wire::new();
        let r = reply(&wire);

        let rendered = format!("{r:?}");
        assert!(rendered.contains("id: 1"));
        assert!(rendered.contains("Initialized"));
    }

    #[test]
    fn error_mid_write_defers_the_abort() {
        let wire = Wire::new();
        let mut r = reply(&wire);

        r.send(b"head", false).unwrap();
        while wire.pop().is_some() {}

        r.error("backend exploded");
        assert_eq!(
            r.state(),
            ReplyState::Started { output_ready: false, cancelled: true }
        );
        assert_eq!(wire.pending_frames(), 0);

        // The abort frame goes out once the in-flight write drains.
        assert!(!r.on_write_ready());
        assert!(r.is_finished());
        assert_eq!(wire.pending_frames(), 1);
    }
}
