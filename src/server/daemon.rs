use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::config::Config;
use crate::http::connection::ActiveRequests;
use crate::server::router::Router;
use crate::server::worker::{Worker, WorkerSettings};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Daemon lifecycle. Moves strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotStarted,
    Listening,
    Draining,
    Stopped,
}

impl DaemonState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DaemonState::NotStarted,
            1 => DaemonState::Listening,
            2 => DaemonState::Draining,
            _ => DaemonState::Stopped,
        }
    }
}

/// Process-wide listener.
///
/// Owns the accept socket, the worker threads and the shared request
/// counter. Accepted connections are sharded round-robin across workers;
/// each worker serves its shard on its own thread with its own routing
/// table copy. [`Daemon::run`] drives the accept loop until
/// [`Daemon::stop_listening`] is called, then drains the workers.
pub struct Daemon {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AtomicU8,
    stop: Notify,
    active_requests: ActiveRequests,
    worker_live: Vec<Arc<AtomicUsize>>,
    workers: Mutex<Option<Vec<Worker>>>,
}

impl Daemon {
    /// Binds the listen address and spawns the worker threads.
    pub async fn bind(config: Config, router: Arc<Router>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.server.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
        let local_addr = listener.local_addr().context("listener has no local address")?;

        let active_requests = ActiveRequests::new();
        let settings = WorkerSettings {
            max_pending: config.lifecycle.max_pending,
            max_backlog: config.lifecycle.max_backlog,
            sweep_interval: Duration::from_millis(config.lifecycle.sweep_interval_ms),
            drain_grace: Duration::from_millis(config.lifecycle.drain_grace_ms),
        };

        let mut workers = Vec::with_capacity(config.server.workers);
        let mut worker_live = Vec::with_capacity(config.server.workers);
        for id in 0..config.server.workers {
            let worker = Worker::spawn(id, Arc::clone(&router), settings, active_requests.clone())?;
            worker_live.push(worker.live_connections());
            workers.push(worker);
        }

        info!(workers = workers.len(), routes = router.len(), "daemon bound to {}", local_addr);

        Ok(Self {
            config,
            listener,
            local_addr,
            state: AtomicU8::new(DaemonState::NotStarted as u8),
            stop: Notify::new(),
            active_requests,
            worker_live,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Accepts connections until [`Daemon::stop_listening`] fires, then
    /// drains and joins the workers.
    ///
    /// `on_watchdog` runs about once a second on the accept task, with the
    /// first call immediately after startup; it is the hook for periodic
    /// health reporting against [`Daemon::num_of_connections`] and
    /// [`Daemon::active_requests`].
    pub async fn run<F>(&self, mut on_watchdog: F) -> anyhow::Result<()>
    where
        F: FnMut(&Daemon),
    {
        let workers = match self.workers.lock().await.take() {
            Some(workers) => workers,
            None => anyhow::bail!("daemon can only be run once"),
        };

        self.state.store(DaemonState::Listening as u8, Ordering::SeqCst);
        info!("Listening on {}", self.local_addr);

        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        let mut next_worker = 0usize;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                            continue;
                        }
                    };

                    if self.num_of_connections() >= self.config.server.max_connections {
                        tracing::warn!(%peer, "connection limit reached, dropping connection");
                        continue;
                    }

                    let socket = match stream.into_std() {
                        Ok(socket) => socket,
                        Err(e) => {
                            tracing::error!("failed to detach accepted socket: {e}");
                            continue;
                        }
                    };

                    let worker = &workers[next_worker % workers.len()];
                    next_worker = next_worker.wrapping_add(1);
                    tracing::debug!(%peer, worker = worker.id(), "accepted connection");
                    if let Err(e) = worker.submit(socket) {
                        tracing::warn!("{e:#}");
                    }
                }
                _ = self.stop.notified() => break,
                _ = watchdog.tick() => on_watchdog(self),
            }
        }

        self.state.store(DaemonState::Draining as u8, Ordering::SeqCst);
        info!(
            connections = self.num_of_connections(),
            active_requests = self.active_requests.get(),
            "draining workers"
        );

        // Worker teardown joins OS threads, which must not block the
        // runtime's async workers. Closing every intake first lets the
        // shards drain concurrently instead of one join at a time.
        tokio::task::spawn_blocking(move || {
            let mut workers = workers;
            for worker in &mut workers {
                worker.begin_shutdown();
            }
            drop(workers);
        })
        .await
        .context("worker shutdown task failed")?;

        self.state.store(DaemonState::Stopped as u8, Ordering::SeqCst);
        info!("daemon stopped");
        Ok(())
    }

    /// Stops accepting new connections. In-flight work keeps draining;
    /// [`Daemon::run`] returns once the workers are done. Callable from
    /// any task or thread, any number of times.
    pub fn stop_listening(&self) {
        let _ = self.state.compare_exchange(
            DaemonState::Listening as u8,
            DaemonState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.stop.notify_one();
    }

    /// Aggregate live-connection count across all workers.
    pub fn num_of_connections(&self) -> usize {
        self.worker_live.iter().map(|w| w.load(Ordering::SeqCst)).sum()
    }

    /// Requests currently admitted or backlogged across the process.
    pub fn active_requests(&self) -> usize {
        self.active_requests.get()
    }

    pub fn state(&self) -> DaemonState {
        DaemonState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The actually bound address, useful when the config asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
