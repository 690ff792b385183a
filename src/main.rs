use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use portcullis::config::Config;
use portcullis::handler::{HandlerOutcome, PendingOperation};
use portcullis::http::reply::Reply;
use portcullis::http::request::Request;
use portcullis::server::daemon::Daemon;
use portcullis::server::router::Router;

/// Demo operation that completes on another thread after a delay.
struct DelayOp {
    delay: Duration,
    done: Arc<AtomicBool>,
}

impl PendingOperation for DelayOp {
    fn start(&mut self, reply: &mut Reply) -> anyhow::Result<()> {
        let done = Arc::clone(&self.done);
        let trigger = reply.data_ready();
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            done.store(true, Ordering::SeqCst);
            trigger.signal();
        });
        Ok(())
    }

    fn peek(&mut self, reply: &mut Reply, _need_wait: bool) -> anyhow::Result<()> {
        if self.done.load(Ordering::SeqCst) && !reply.is_finished() {
            reply.send_ok(b"done\n")?;
        }
        Ok(())
    }

    fn cancel(&mut self) {}
}

fn hello(request: &mut Request, reply: &mut Reply) -> anyhow::Result<HandlerOutcome> {
    let name = request.param("name").unwrap_or_else(|| "world".to_string());
    reply.set_content_type("text/plain")?;
    reply.send_ok(format!("Hello, {name}!\n").as_bytes())?;
    Ok(None)
}

fn delay(request: &mut Request, _reply: &mut Reply) -> anyhow::Result<HandlerOutcome> {
    let ms = request
        .param("ms")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(50);
    Ok(Some(Box::new(DelayOp {
        delay: Duration::from_millis(ms),
        done: Arc::new(AtomicBool::new(false)),
    })))
}

fn fail(_request: &mut Request, _reply: &mut Reply) -> anyhow::Result<HandlerOutcome> {
    Err(anyhow::anyhow!("simulated backend failure"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = Config::load()?;

    let router = Arc::new(
        Router::new()
            .add("/hello", hello)
            .add("/delay", delay)
            .add("/fail", fail),
    );

    let daemon = Daemon::bind(config, router).await?;

    let run = daemon.run(|d| {
        tracing::debug!(
            connections = d.num_of_connections(),
            active_requests = d.active_requests(),
            "watchdog"
        );
    });
    tokio::pin!(run);

    tokio::select! {
        res = &mut run => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            daemon.stop_listening();
            run.await?;
        }
    }

    Ok(())
}
