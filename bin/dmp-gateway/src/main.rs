//! dmp Gateway
//!
//! Registers dmp volumes over local block devices, serves them as NBD
//! exports and publishes the global read/write statistics over HTTP.

mod nbd;
mod stat_server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dmp_common::{Config, VolumeConfig};
use dmp_target::{
    AccessMode, IoDispatcher, IoStatistics, Remapper, TARGET_NAME, TARGET_VERSION, TableMode,
    TargetRegistry,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::nbd::NbdServer;
use crate::stat_server::StatState;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "dmp-gateway", about = "dmp remapping target gateway")]
struct Args {
    /// Configuration file (TOML); missing file means defaults
    #[arg(short, long, default_value = "/etc/dmp/gateway.toml")]
    config: PathBuf,

    /// NBD TCP listen address
    #[arg(long)]
    nbd_listen: Option<SocketAddr>,

    /// Statistics HTTP listen address
    #[arg(long)]
    stat_listen: Option<SocketAddr>,

    /// Dispatch worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Dispatch queue depth
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "DMP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Extra volume as NAME=DEVICE (repeatable)
    #[arg(long = "volume", value_name = "NAME=DEVICE")]
    volumes: Vec<VolumeConfig>,
}

impl Args {
    /// Load the file configuration and apply command-line overrides
    fn into_config(self) -> Result<Config> {
        let mut config = if self.config.exists() {
            Config::from_file(&self.config)
                .with_context(|| format!("load config {}", self.config.display()))?
        } else {
            Config::default()
        };

        if let Some(listen) = self.nbd_listen {
            config.nbd.listen = listen;
        }
        if let Some(listen) = self.stat_listen {
            config.stat.listen = listen;
        }
        if let Some(workers) = self.workers {
            config.dispatch.workers = workers;
        }
        if let Some(depth) = self.queue_depth {
            config.dispatch.queue_depth = depth;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config.volumes.extend(self.volumes);
        config.validate()?;
        Ok(config)
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.logging.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (major, minor, patch) = TARGET_VERSION;
    info!("Starting dmp gateway (target {TARGET_NAME} v{major}.{minor}.{patch})");

    // ── Target ────────────────────────────────────────────────────────────────
    let stats = Arc::new(IoStatistics::new());
    let dispatcher = Arc::new(
        IoDispatcher::new(config.dispatch.workers, config.dispatch.queue_depth)
            .context("start dispatch workers")?,
    );
    let registry = Arc::new(TargetRegistry::new(Remapper::new(
        Arc::clone(&stats),
        dispatcher,
    )));

    for volume in &config.volumes {
        register(&registry, volume)?;
    }
    if config.volumes.is_empty() {
        warn!("No volumes configured; NBD clients will find no exports");
    }

    // ── Stat server ───────────────────────────────────────────────────────────
    let stat_state = Arc::new(StatState::new(Arc::clone(&registry)));
    let stat_addr = config.stat.listen;
    let stat_task = tokio::spawn(async move {
        if let Err(e) = stat_server::serve(stat_addr, stat_state).await {
            error!("Stat server failed: {e:#}");
        }
    });

    // ── NBD ───────────────────────────────────────────────────────────────────
    let listener = TcpListener::bind(config.nbd.listen)
        .await
        .with_context(|| format!("bind NBD listener {}", config.nbd.listen))?;
    let nbd_task = tokio::spawn(Arc::new(NbdServer::new(Arc::clone(&registry))).serve(listener));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Shutting down");

    nbd_task.abort();
    stat_task.abort();
    let _ = nbd_task.await;
    let _ = stat_task.await;

    registry.clear();
    info!("Final statistics:\n{}", stats.report());
    Ok(())
}

fn register(registry: &TargetRegistry, volume: &VolumeConfig) -> Result<()> {
    let mode = TableMode {
        access: if volume.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        },
        exclusive: volume.exclusive,
    };
    let mapped = registry
        .create(&volume.name, volume.len_sectors, &[&volume.device], mode)
        .map_err(|e| {
            let errno = e.errno();
            anyhow::Error::new(e).context(format!(
                "register volume '{}' (errno {errno})",
                volume.name
            ))
        })?;
    info!(
        volume = mapped.name(),
        device = %volume.device,
        sectors = mapped.len_sectors(),
        read_only = mapped.read_only(),
        "volume ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[dispatch]\nworkers = 2\n\n[[volumes]]\nname = \"a\"\ndevice = \"/dev/loop0\""
        )
        .unwrap();

        let args = Args::parse_from([
            "dmp-gateway",
            "--config",
            file.path().to_str().unwrap(),
            "--workers",
            "8",
            "--nbd-listen",
            "127.0.0.1:10900",
            "--volume",
            "b=/dev/loop1",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.nbd.listen.port(), 10900);
        let names: Vec<_> = config.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let args = Args::parse_from(["dmp-gateway", "--config", "/nonexistent/dmp.toml"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.dispatch.workers, 4);
        assert!(config.volumes.is_empty());
    }

    #[test]
    fn test_duplicate_cli_volume_rejected() {
        let args = Args::parse_from([
            "dmp-gateway",
            "--config",
            "/nonexistent/dmp.toml",
            "--volume",
            "a=/dev/loop0",
            "--volume",
            "a=/dev/loop1",
        ]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_register_reports_lookup_failure() {
        let stats = Arc::new(IoStatistics::new());
        let dispatcher = Arc::new(IoDispatcher::new(1, 4).unwrap());
        let registry = TargetRegistry::new(Remapper::new(stats, dispatcher));
        let volume: VolumeConfig = "x=/nonexistent/device".parse().unwrap();
        let err = register(&registry, &volume).unwrap_err();
        assert!(err.to_string().contains("register volume 'x'"));
    }
}
