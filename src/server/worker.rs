use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::Instant;

use crate::http::connection::{ActiveRequests, Connection};
use crate::http::parser::{self, ParseError};
use crate::http::reply::Reply;
use crate::http::request::Request;
use crate::http::wake::WorkerWaker;
use crate::http::wire::{FrameKind, Wire};
use crate::server::router::Router;

/// Hard cap on unconsumed request bytes buffered per connection.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// After the drain grace expires, queued cancellation notices get this long
/// to reach the socket before the remaining wires are closed outright.
const DRAIN_CLOSE_WINDOW: Duration = Duration::from_secs(1);

/// Per-worker knobs, lifted from the lifecycle section of the config.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub max_pending: usize,
    pub max_backlog: usize,
    pub sweep_interval: Duration,
    pub drain_grace: Duration,
}

/// Handle to one worker thread.
///
/// Each worker runs a single-threaded reactor on its own OS thread and
/// owns a disjoint set of connections; no connection is ever touched from
/// two threads. Accepted sockets are handed over through a bounded intake
/// channel. Dropping the handle closes the intake and joins the thread,
/// which drains its connections first.
pub struct Worker {
    id: usize,
    intake: Option<mpsc::Sender<std::net::TcpStream>>,
    live_connections: Arc<AtomicUsize>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        id: usize,
        router: Arc<Router>,
        settings: WorkerSettings,
        active_requests: ActiveRequests,
    ) -> anyhow::Result<Self> {
        let (intake_tx, intake_rx) = mpsc::channel(128);
        let live_connections = Arc::new(AtomicUsize::new(0));
        let live = Arc::clone(&live_connections);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build worker runtime")?;

        let thread = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(
                    &runtime,
                    worker_main(id, router, settings, active_requests, live, intake_rx),
                );
            })
            .context("failed to spawn worker thread")?;

        Ok(Self {
            id,
            intake: Some(intake_tx),
            live_connections,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Live-connection counter for this worker, readable from any thread.
    pub fn live_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_connections)
    }

    /// Hands an accepted socket to this worker. Fails if the worker's
    /// intake is full or the worker has already shut down.
    pub fn submit(&self, socket: std::net::TcpStream) -> anyhow::Result<()> {
        match &self.intake {
            Some(intake) => intake
                .try_send(socket)
                .map_err(|e| anyhow::anyhow!("worker {} refused a connection: {e}", self.id)),
            None => Err(anyhow::anyhow!("worker {} is shut down", self.id)),
        }
    }

    /// Closes the intake so the worker starts draining its connections.
    /// The thread itself is joined on drop.
    pub fn begin_shutdown(&mut self) {
        self.intake.take();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.intake.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

/// Shared-nothing state of one worker thread. Everything here is
/// single-threaded; only the waker inside is reachable from outside.
struct Shard {
    worker_id: usize,
    router: Arc<Router>,
    settings: WorkerSettings,
    waker: WorkerWaker,
    active_requests: ActiveRequests,
    live_connections: Arc<AtomicUsize>,
    next_conn_id: Cell<u64>,
    conns: RefCell<HashMap<u64, ConnEntry>>,
}

struct ConnEntry {
    conn: Rc<RefCell<Connection>>,
    wire: Rc<Wire>,
}

async fn worker_main(
    id: usize,
    router: Arc<Router>,
    settings: WorkerSettings,
    active_requests: ActiveRequests,
    live_connections: Arc<AtomicUsize>,
    mut intake: mpsc::Receiver<std::net::TcpStream>,
) {
    tracing::debug!(worker = id, "worker started");

    let shard = Rc::new(Shard {
        worker_id: id,
        router,
        settings,
        waker: WorkerWaker::new(),
        active_requests,
        live_connections,
        next_conn_id: Cell::new(0),
        conns: RefCell::new(HashMap::new()),
    });

    let mut sweep = tokio::time::interval(settings.sweep_interval);
    let mut intake_open = true;
    let mut drain_deadline = None;
    let mut close_deadline = None;

    loop {
        tokio::select! {
            accepted = intake.recv(), if intake_open => match accepted {
                Some(socket) => shard.on_new_connection(socket),
                None => {
                    intake_open = false;
                    drain_deadline = Some(Instant::now() + settings.drain_grace);
                }
            },
            _ = shard.waker.awoken() => shard.on_async_work(),
            _ = sweep.tick() => shard.on_timer(),
        }

        if !intake_open {
            if shard.conns.borrow().is_empty() {
                break;
            }
            if drain_deadline.is_some_and(|d| Instant::now() >= d) {
                drain_deadline = None;
                shard.begin_drain();
                close_deadline = Some(Instant::now() + DRAIN_CLOSE_WINDOW);
            }
            if close_deadline.is_some_and(|d| Instant::now() >= d) {
                close_deadline = None;
                shard.force_close();
            }
        }
    }

    tracing::debug!(worker = id, "worker stopped");
}

impl Shard {
    /// Adopts an accepted socket into this worker's reactor and starts
    /// serving it.
    fn on_new_connection(self: &Rc<Self>, socket: std::net::TcpStream) {
        let stream = match TcpStream::from_std(socket) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(worker = self.worker_id, "failed to adopt accepted socket: {e}");
                return;
            }
        };

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);

        let wire = Wire::new();
        let conn = Rc::new(RefCell::new(Connection::new(
            self.settings.max_pending,
            self.settings.max_backlog,
            Rc::clone(&wire),
            self.active_requests.clone(),
        )));

        self.conns.borrow_mut().insert(
            conn_id,
            ConnEntry { conn: Rc::clone(&conn), wire: Rc::clone(&wire) },
        );
        self.live_connections.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = self.worker_id, conn = conn_id, "connection opened");

        let shard = Rc::clone(self);
        tokio::task::spawn_local(async move {
            if let Err(e) =
                serve_connection(&shard, conn_id, &conn, Rc::clone(&wire), stream).await
            {
                tracing::debug!(worker = shard.worker_id, conn = conn_id, "connection ended: {e:#}");
            }
            conn.borrow_mut().on_closed_connection();
            shard.conns.borrow_mut().remove(&conn_id);
            shard.live_connections.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(worker = shard.worker_id, conn = conn_id, "connection closed");
            // Lets the reactor loop notice an empty shard during shutdown.
            shard.waker.wake();
        });
    }

    /// Wake-triggered sweep: peek only the replies whose data-ready
    /// trigger fired.
    fn on_async_work(&self) {
        for conn in self.collect_conns() {
            conn.borrow_mut().peek_async(true);
        }
    }

    /// Periodic sweep, the backstop against any missed wake: peek every
    /// pending reply unconditionally.
    fn on_timer(&self) {
        for conn in self.collect_conns() {
            conn.borrow_mut().peek_async(false);
        }
    }

    /// Cancels every remaining connection after the drain grace expired.
    fn begin_drain(&self) {
        let entries: Vec<_> = self
            .conns
            .borrow()
            .values()
            .map(|e| (Rc::clone(&e.conn), Rc::clone(&e.wire)))
            .collect();
        tracing::info!(
            worker = self.worker_id,
            conns = entries.len(),
            "drain grace expired, cancelling remaining connections"
        );
        for (conn, wire) in entries {
            conn.borrow_mut().on_before_closed_connection();
            wire.mark_draining();
        }
    }

    /// Hard-closes every wire still open after the notice flush window. A
    /// writer parked on an unresponsive peer abandons its write and the
    /// connection tears down.
    fn force_close(&self) {
        let wires: Vec<_> = self.conns.borrow().values().map(|e| Rc::clone(&e.wire)).collect();
        if wires.is_empty() {
            return;
        }
        tracing::warn!(
            worker = self.worker_id,
            conns = wires.len(),
            "clients unresponsive after drain, closing sockets"
        );
        for wire in wires {
            wire.mark_closed();
        }
    }

    fn collect_conns(&self) -> Vec<Rc<RefCell<Connection>>> {
        self.conns.borrow().values().map(|e| Rc::clone(&e.conn)).collect()
    }
}

/// Reads, parses and dispatches requests on one socket until it closes.
///
/// Response bytes flow through the connection's wire and a dedicated
/// writer task, so slow clients never block the reactor.
async fn serve_connection(
    shard: &Rc<Shard>,
    conn_id: u64,
    conn: &Rc<RefCell<Connection>>,
    wire: Rc<Wire>,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();

    let writer = tokio::task::spawn_local(write_loop(
        Rc::clone(&wire),
        Rc::clone(conn),
        write_half,
    ));

    let mut buffer = BytesMut::with_capacity(4096);
    let mut next_reply_id: u64 = 1;
    let mut result = Ok(());

    'serve: loop {
        tokio::select! {
            read = read_half.read_buf(&mut buffer) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        result = Err(e).context("socket read failed");
                        break 'serve;
                    }
                };
                if n == 0 {
                    break 'serve;
                }

                loop {
                    match parser::parse_http_request(&buffer) {
                        Ok((mut request, consumed)) => {
                            buffer.advance(consumed);
                            let reply_id = next_reply_id;
                            next_reply_id += 1;
                            dispatch(shard, conn, &wire, &mut request, reply_id);
                        }
                        Err(ParseError::Incomplete) => {
                            if buffer.len() > MAX_REQUEST_BYTES {
                                refuse_request(shard, &wire, next_reply_id, "Request too large");
                                break 'serve;
                            }
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(
                                worker = shard.worker_id,
                                conn = conn_id,
                                "malformed request: {e}"
                            );
                            refuse_request(shard, &wire, next_reply_id, &format!("Malformed request: {e}"));
                            break 'serve;
                        }
                    }
                }
            }
            _ = wire.closed_signal() => break 'serve,
        }
    }

    wire.mark_closed();
    if let Err(e) = writer.await {
        tracing::error!(worker = shard.worker_id, conn = conn_id, "writer task failed: {e}");
    }
    result
}

/// Answers 400 for input the parser refused. The reply closes the
/// connection behind it.
fn refuse_request(shard: &Rc<Shard>, wire: &Rc<Wire>, reply_id: u64, what: &str) {
    let mut reply = Reply::new(reply_id, false, Rc::clone(wire), shard.waker.clone());
    if let Err(e) = reply.send_bad_request(what.as_bytes()) {
        tracing::debug!("could not send 400: {e}");
    }
}

fn dispatch(
    shard: &Rc<Shard>,
    conn: &Rc<RefCell<Connection>>,
    wire: &Rc<Wire>,
    request: &mut Request,
    reply_id: u64,
) {
    let mut reply = Reply::new(reply_id, request.keep_alive(), Rc::clone(wire), shard.waker.clone());

    let handler = match shard.router.resolve(request.route_path()) {
        Some(handler) => Arc::clone(handler),
        None => {
            if let Err(e) = reply.send_not_found(b"Not found") {
                tracing::debug!("could not send 404: {e}");
            }
            return;
        }
    };

    match handler.handle(request, &mut reply) {
        Ok(Some(op)) => {
            if let Err((mut reply, err)) = conn.borrow_mut().postpone(reply, op) {
                fail_dispatch(&mut reply, &err.to_string());
            }
        }
        Ok(None) => {
            if !reply.is_finished() {
                fail_dispatch(&mut reply, "Unfinished request hasn't been scheduled (postponed)");
            }
        }
        Err(e) => fail_dispatch(&mut reply, &format!("{e:#}")),
    }
}

/// A handler broke its contract or failed outright. While the reply is
/// still untouched this turns into a 503 with the failure message; once
/// output started the connection is dropped instead.
fn fail_dispatch(reply: &mut Reply, what: &str) {
    tracing::error!(reply = reply.id(), "handler failed: {what}");
    reply.error(what);
}

/// Drains the wire's frame queue onto the socket, reporting each written
/// frame back to the connection. Exits on abort frames, write failures,
/// close-after frames, a close landing mid-write, or once the wire is
/// closed or draining and empty.
async fn write_loop(wire: Rc<Wire>, conn: Rc<RefCell<Connection>>, mut write_half: OwnedWriteHalf) {
    loop {
        match wire.pop() {
            None => {
                if wire.is_closed() || wire.is_draining() {
                    break;
                }
                wire.outbound().await;
            }
            Some(frame) => match frame.kind {
                FrameKind::Data { bytes, close_after } => {
                    // A peer that stops reading parks this write on a full
                    // kernel buffer; a close must still get through.
                    let written = tokio::select! {
                        res = write_half.write_all(&bytes) => match res {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::debug!(reply = frame.reply_id, "socket write failed: {e}");
                                false
                            }
                        },
                        _ = wire.closed_signal() => false,
                    };
                    if !written {
                        break;
                    }
                    conn.borrow_mut().on_write_done(frame.reply_id);
                    if close_after {
                        break;
                    }
                }
                FrameKind::Abort => break,
            },
        }
    }
    wire.mark_closed();
}
