use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Server-level settings: where to listen and how wide to scale.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the daemon binds, e.g. "127.0.0.1:8080".
    pub listen_addr: String,
    /// Number of worker threads, each running its own reactor.
    pub workers: usize,
    /// Process-wide cap on simultaneously served connections.
    pub max_connections: usize,
}

/// Request-lifecycle settings, applied per connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Requests serviced concurrently on one connection.
    pub max_pending: usize,
    /// Requests queued behind the pending set before rejection kicks in.
    pub max_backlog: usize,
    /// Period of the worker sweep that backstops missed wake signals.
    pub sweep_interval_ms: u64,
    /// How long shutdown waits for connections before cancelling them.
    pub drain_grace_ms: u64,
}

/// Full daemon configuration.
///
/// Loaded from a YAML file with per-field defaults, then overridden by
/// `PORTCULLIS_*` environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            workers: 4,
            max_connections: 4096,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_pending: 16,
            max_backlog: 1024,
            sweep_interval_ms: 200,
            drain_grace_ms: 5000,
        }
    }
}

impl Config {
    /// Loads the file named by `CONFIG_PATH` (default `config.yaml`),
    /// falling back to built-in defaults when the file is absent, then
    /// applies environment overrides and validates the result.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&path).exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {path}"))?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(addr) = std::env::var("PORTCULLIS_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(v) = env_parse("PORTCULLIS_WORKERS")? {
            self.server.workers = v;
        }
        if let Some(v) = env_parse("PORTCULLIS_MAX_CONNECTIONS")? {
            self.server.max_connections = v;
        }
        if let Some(v) = env_parse("PORTCULLIS_MAX_PENDING")? {
            self.lifecycle.max_pending = v;
        }
        if let Some(v) = env_parse("PORTCULLIS_MAX_BACKLOG")? {
            self.lifecycle.max_backlog = v;
        }
        if let Some(v) = env_parse("PORTCULLIS_SWEEP_INTERVAL_MS")? {
            self.lifecycle.sweep_interval_ms = v;
        }
        if let Some(v) = env_parse("PORTCULLIS_DRAIN_GRACE_MS")? {
            self.lifecycle.drain_grace_ms = v;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.workers == 0 {
            anyhow::bail!("server.workers must be at least 1");
        }
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be at least 1");
        }
        if self.lifecycle.max_pending == 0 {
            anyhow::bail!("lifecycle.max_pending must be at least 1");
        }
        if self.lifecycle.max_backlog == 0 {
            anyhow::bail!("lifecycle.max_backlog must be at least 1");
        }
        if self.lifecycle.sweep_interval_ms == 0 {
            anyhow::bail!("lifecycle.sweep_interval_ms must be at least 1");
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(anyhow::anyhow!("{name} must be a number, got {raw:?}: {e}")),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_defaults_per_field() {
        let cfg: Config = serde_yaml::from_str(
            "server:\n  workers: 2\nlifecycle:\n  max_pending: 3\n",
        )
        .unwrap();

        assert_eq!(cfg.server.workers, 2);
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(cfg.lifecycle.max_pending, 3);
        assert_eq!(cfg.lifecycle.max_backlog, 1024);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg: Config = serde_yaml::from_str("server:\n  workers: 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_backlog_is_rejected() {
        let cfg: Config = serde_yaml::from_str("lifecycle:\n  max_backlog: 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
