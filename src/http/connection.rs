use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::handler::PendingOperation;
use crate::http::reply::{Reply, ReplyError, ReplyState};
use crate::http::wire::Wire;

/// Process-wide count of requests currently admitted or backlogged.
///
/// Owned by the daemon and handed to every connection; shutdown readiness
/// and resource gating read it from any thread.
#[derive(Clone, Default)]
pub struct ActiveRequests(Arc<AtomicUsize>);

impl ActiveRequests {
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decr(&self, n: usize) {
        self.0.fetch_sub(n, Ordering::SeqCst);
    }
}

/// Outcome of admitting a postponed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Entered the pending set; its operation was started.
    Admitted,
    /// Queued in the backlog; starts later when pending capacity opens.
    Backlogged,
    /// Both tiers full; a 503 was sent and no request state was created.
    Rejected,
}

/// Per-socket admission controller.
///
/// Owns every postponed [`Reply`] on one connection in two bounded tiers: a
/// `pending` set of requests being actively serviced (at most
/// `max_pending`) and a FIFO `backlog` of admitted-but-not-started requests
/// (at most `max_backlog`). Anything beyond both caps is rejected on the
/// spot with a 503.
///
/// A connection lives on one worker thread and is only ever driven from
/// that thread.
pub struct Connection {
    max_pending: usize,
    max_backlog: usize,
    closed: bool,
    pending: Vec<Reply>,
    backlog: VecDeque<Reply>,
    wire: Rc<Wire>,
    active_requests: ActiveRequests,
}

impl Connection {
    pub fn new(
        max_pending: usize,
        max_backlog: usize,
        wire: Rc<Wire>,
        active_requests: ActiveRequests,
    ) -> Self {
        Self {
            max_pending,
            max_backlog,
            closed: false,
            pending: Vec::new(),
            backlog: VecDeque::new(),
            wire,
            active_requests,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Takes ownership of a reply whose handler chose to complete
    /// asynchronously and runs it through admission.
    ///
    /// The reply must still be `Initialized` and not yet postponed. On a
    /// validation failure the reply is handed back untouched so the caller
    /// can fail it through the usual error path.
    pub fn postpone(
        &mut self,
        mut reply: Reply,
        op: Box<dyn PendingOperation>,
    ) -> Result<Admission, (Reply, ReplyError)> {
        match reply.state() {
            ReplyState::Initialized => {
                if reply.is_postponed() {
                    return Err((reply, ReplyError::AlreadyPostponed));
                }
            }
            ReplyState::Started { .. } => return Err((reply, ReplyError::CannotBePostponed)),
            ReplyState::Finished { .. } => return Err((reply, ReplyError::AlreadyFinished)),
        }

        reply.set_postponed();
        Ok(self.register_pending(reply, op))
    }

    /// Sweeps the pending set.
    ///
    /// Peeks every pending reply whose data-ready trigger fired, or all of
    /// them when `only_if_signaled` is false. Finished replies are then
    /// unregistered and backlogged requests promoted into the freed
    /// capacity in arrival order.
    pub fn peek_async(&mut self, only_if_signaled: bool) {
        for reply in self.pending.iter_mut() {
            if !only_if_signaled || reply.check_reset_data_triggered() {
                reply.peek_pending();
            }
        }
        self.maintain_finished();
        self.maintain_backlog();
    }

    /// Reacts to one of this connection's frames reaching the socket.
    ///
    /// Reopens the reply's output gate, lets a postponed reply flush more
    /// data right away, and promotes from the backlog if the write freed
    /// pending capacity.
    pub fn on_write_done(&mut self, reply_id: u64) {
        if let Some(reply) = self.pending.iter_mut().find(|r| r.id() == reply_id) {
            if reply.on_write_ready() {
                reply.peek_pending();
            }
        }
        self.maintain_finished();
        self.maintain_backlog();
    }

    /// The socket is gone. Cancels everything silently; no further bytes
    /// can be delivered.
    pub fn on_closed_connection(&mut self) {
        self.closed = true;
        self.wire.mark_closed();
        self.cancel_all();
    }

    /// The connection is about to be torn down while the socket still
    /// works, e.g. on server drain. Cancels everything with a best-effort
    /// cancellation notice to the client.
    pub fn on_before_closed_connection(&mut self) {
        tracing::info!(
            pending = self.pending.len(),
            backlog = self.backlog.len(),
            "cancelling requests before connection close"
        );
        self.closed = true;
        self.cancel_all();
    }

    fn register_pending(&mut self, mut reply: Reply, op: Box<dyn PendingOperation>) -> Admission {
        if self.pending.len() < self.max_pending {
            self.active_requests.incr();
            reply.assign_pending_operation(op);
            self.pending.push(reply);

            let closed = self.closed;
            let idx = self.pending.len() - 1;
            Self::postponed_start(&mut self.pending[idx], closed);
            if self.pending[idx].is_finished() {
                tracing::trace!("postponed request drained during start");
                self.pending.pop();
                self.active_requests.decr(1);
            }
            Admission::Admitted
        } else if self.backlog.len() < self.max_backlog {
            self.active_requests.incr();
            reply.assign_pending_operation(op);
            self.backlog.push_back(reply);
            Admission::Backlogged
        } else {
            tracing::warn!(
                pending = self.pending.len(),
                backlog = self.backlog.len(),
                "request rejected, admission queues are full"
            );
            if let Err(e) = reply.send_unavailable(b"Too many pending requests") {
                tracing::error!("failed to send rejection notice: {e}");
            }
            Admission::Rejected
        }
    }

    fn postponed_start(reply: &mut Reply, closed: bool) {
        if !reply.is_postponed() {
            reply.error(&ReplyError::NotPostponed.to_string());
            return;
        }
        if closed {
            reply.error(&ReplyError::ConnectionClosed.to_string());
            return;
        }
        if let Err(e) = reply.start_pending() {
            reply.error(&format!("{e:#}"));
        }
    }

    /// Unregisters every finished reply. Dropping the reply also drops its
    /// pending operation.
    fn maintain_finished(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|reply| !reply.is_finished());
        let removed = before - self.pending.len();
        if removed > 0 {
            self.active_requests.decr(removed);
        }
    }

    /// Promotes backlogged requests into free pending capacity, oldest
    /// first. A promotion that drains during start is collected by the
    /// next sweep.
    fn maintain_backlog(&mut self) {
        if self.closed {
            return;
        }
        while self.pending.len() < self.max_pending {
            let Some(reply) = self.backlog.pop_front() else {
                break;
            };
            self.pending.push(reply);
            let idx = self.pending.len() - 1;
            Self::postponed_start(&mut self.pending[idx], false);
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_backlog();
        self.maintain_finished();
        for reply in self.pending.iter_mut() {
            if !reply.is_finished() {
                if let Err(e) = reply.cancel_pending() {
                    reply.error(&e.to_string());
                }
                reply.peek_pending();
            }
        }
        // Replies whose cancel had to wait for an in-flight write finish
        // later, through their write completion.
        self.maintain_finished();
    }

    fn cancel_backlog(&mut self) {
        let cnt = self.backlog.len();
        if cnt > 0 {
            for reply in self.backlog.iter_mut() {
                if let Err(e) = reply.cancel_pending() {
                    reply.error(&e.to_string());
                }
            }
            self.backlog.clear();
            self.active_requests.decr(cnt);
        }
    }
}
