//! Request handler and pending-operation contracts
//!
//! These two traits are the only coupling between the transport layer and
//! business logic. A handler either finishes its reply before returning or
//! hands back a pending operation for the connection to postpone.

use anyhow::Result;

use crate::http::reply::Reply;
use crate::http::request::Request;

/// What a handler produced: `None` when the reply was completed (or an
/// error path will complete it), `Some(op)` when the request must be
/// postponed and resumed later through the returned operation.
pub type HandlerOutcome = Option<Box<dyn PendingOperation>>;

/// Routes are shared by every worker thread, so handlers must be `Send`
/// and `Sync`. The replies they receive are not: a handler runs on the
/// worker that owns the connection and must not stash the reply anywhere.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &mut Request, reply: &mut Reply) -> Result<HandlerOutcome>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Reply) -> Result<HandlerOutcome> + Send + Sync,
{
    fn handle(&self, request: &mut Request, reply: &mut Reply) -> Result<HandlerOutcome> {
        self(request, reply)
    }
}

/// An external unit of asynchronous work owned by a postponed reply.
///
/// All three methods are invoked on the worker thread that owns the reply.
/// Work running on other threads reports progress only through the reply's
/// data-ready trigger (see [`Reply::data_ready`]); the next `peek` then
/// picks the result up. Resources are released when the operation is
/// dropped together with its reply.
pub trait PendingOperation {
    /// Begins the asynchronous chain. Called once, right after admission.
    fn start(&mut self, reply: &mut Reply) -> Result<()>;

    /// Non-blocking progress check, safe to call repeatedly. `need_wait`
    /// tells the operation whether the caller can tolerate it blocking
    /// briefly on nearly-complete work.
    fn peek(&mut self, reply: &mut Reply, need_wait: bool) -> Result<()>;

    /// Best-effort abort of outstanding work. Must be idempotent.
    fn cancel(&mut self);
}
