use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::Notify;

/// One queued write for the connection socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Id of the reply that produced the frame, echoed back on completion.
    pub reply_id: u64,
    pub kind: FrameKind,
}

#[derive(Debug)]
pub enum FrameKind {
    /// Serialized response bytes. `close_after` tears the socket down once
    /// the frame is on the wire.
    Data { bytes: Bytes, close_after: bool },
    /// Close the socket without any further bytes. Used to abandon a
    /// partially written chunked response.
    Abort,
}

/// Outbound side of one client connection.
///
/// Replies push frames in completion order; the connection's writer task
/// drains them onto the socket one at a time and reports each written
/// frame back to the connection. Shared as `Rc` within a worker and never
/// crosses threads.
pub struct Wire {
    closed: Cell<bool>,
    draining: Cell<bool>,
    frames: RefCell<VecDeque<OutboundFrame>>,
    flush: Notify,
    closed_notify: Notify,
}

impl Wire {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            closed: Cell::new(false),
            draining: Cell::new(false),
            frames: RefCell::new(VecDeque::new()),
            flush: Notify::new(),
            closed_notify: Notify::new(),
        })
    }

    pub fn push_data(&self, reply_id: u64, bytes: Bytes, close_after: bool) {
        self.frames.borrow_mut().push_back(OutboundFrame {
            reply_id,
            kind: FrameKind::Data { bytes, close_after },
        });
        self.flush.notify_one();
    }

    pub fn push_abort(&self, reply_id: u64) {
        self.frames.borrow_mut().push_back(OutboundFrame {
            reply_id,
            kind: FrameKind::Abort,
        });
        self.flush.notify_one();
    }

    pub fn pop(&self) -> Option<OutboundFrame> {
        self.frames.borrow_mut().pop_front()
    }

    /// Waits until a frame is pushed or the wire state changes. The writer
    /// task re-checks the queue after each return.
    pub async fn outbound(&self) {
        self.flush.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Marks the socket dead. Idempotent; wakes the writer task and every
    /// close watcher so each can wind down.
    pub fn mark_closed(&self) {
        if !self.closed.replace(true) {
            self.flush.notify_one();
            self.closed_notify.notify_waiters();
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    /// Tells the writer task to exit once the queue is empty instead of
    /// waiting for more frames.
    pub fn mark_draining(&self) {
        self.draining.set(true);
        self.flush.notify_one();
    }

    /// Resolves once the wire is marked closed. A close that already
    /// happened resolves the call immediately; a close while waiting
    /// releases every watcher, both the read loop and a writer parked on
    /// an unresponsive socket.
    pub async fn closed_signal(&self) {
        if self.closed.get() {
            return;
        }
        self.closed_notify.notified().await;
    }

    #[cfg(test)]
    pub fn pending_frames(&self) -> usize {
        self.frames.borrow().len()
    }
}
