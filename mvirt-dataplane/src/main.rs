//! mvirt-dataplane: node-local dataplane reconciliation daemon.
//!
//! Replays JSON-lines update events from a file or stdin into a dataplane
//! driver, using dry-run appliers that log what they would program.
//! Published resource status is written to stdout as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_dataplane::capture::{ActiveCaptures, CaptureManager, purge_orphans};
use mvirt_dataplane::cleanup::RetryPolicy;
use mvirt_dataplane::config::DataplaneConfig;
use mvirt_dataplane::driver::{DataplaneDriver, DriverHandle};
use mvirt_dataplane::dryrun::{LoggingFilterTable, LoggingIpSets};
use mvirt_dataplane::event::Update;
use mvirt_dataplane::hosts::AllHostsIpSetManager;
use mvirt_dataplane::status::StatusReport;

/// mvirt Dataplane Driver
#[derive(Parser, Debug)]
#[command(name = "mvirt-dataplane", version, about)]
struct Args {
    /// JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Events file (JSON lines); reads stdin when omitted
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Directory for capture specification files
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Interface prefix allowed to back a capture (repeatable)
    #[arg(long = "capture-iface-prefix")]
    capture_iface_prefixes: Vec<String>,

    /// Maximum number of extra queued messages drained per batch
    #[arg(long)]
    msg_peek_limit: Option<usize>,

    /// kube-proxy runs in IPVS mode on this node
    #[arg(long)]
    kube_ipvs: bool,

    /// Seconds to keep running after the events input hits EOF
    #[arg(long, default_value = "2")]
    linger: u64,
}

impl Args {
    fn load_config(&self) -> Result<DataplaneConfig> {
        let mut config = match &self.config {
            Some(path) => DataplaneConfig::from_file(path)?,
            None => DataplaneConfig::default(),
        };
        if let Some(dir) = &self.capture_dir {
            config.capture_dir = dir.clone();
        }
        if !self.capture_iface_prefixes.is_empty() {
            config.capture_iface_prefixes = self.capture_iface_prefixes.clone();
        }
        if let Some(limit) = self.msg_peek_limit {
            config.msg_peek_limit = limit;
        }
        if self.kube_ipvs {
            config.kube_ipvs_support_enabled = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries status reports.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_dataplane=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.load_config().context("Failed to load config")?;

    info!("Starting mvirt-dataplane");
    info!(
        capture_dir = %config.capture_dir.display(),
        prefixes = ?config.capture_iface_prefixes,
        kube_ipvs = config.kube_ipvs_support_enabled,
        "Config loaded"
    );

    let (driver, mut handle) = build_driver(config);
    let mut driver_task = tokio::spawn(driver.run());

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.events {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open events file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let status = std::mem::replace(&mut handle.status, mpsc::unbounded_channel().1);
    let printer = tokio::spawn(print_status(status));

    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let linger = Duration::from_secs(args.linger);

    let result = tokio::select! {
        res = replay(input, &handle) => {
            res?;
            info!(linger_secs = args.linger, "Events input finished, lingering");
            tokio::select! {
                _ = tokio::time::sleep(linger) => None,
                res = &mut driver_task => Some(res),
            }
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            None
        }
        res = &mut driver_task => Some(res),
    };

    let result = match result {
        Some(res) => res,
        None => {
            handle.stop();
            driver_task.await
        }
    };
    // The driver's status senders are gone once it has finished, so this
    // drains the final reports and returns.
    drop(handle);
    if let Err(e) = printer.await {
        warn!("Status printer failed: {}", e);
    }

    match result.context("Driver task panicked")? {
        Ok(()) => {
            info!("mvirt-dataplane stopped");
            Ok(())
        }
        Err(e) => {
            error!("Driver loop failed: {}", e);
            Err(e.into())
        }
    }
}

fn build_driver(config: DataplaneConfig) -> (DataplaneDriver, DriverHandle) {
    let capture_dir = config.capture_dir.clone();
    let prefixes = config.capture_iface_prefixes.clone();

    let (mut driver, handle) = DataplaneDriver::new(config, Box::new(exit_for_restart));

    let ip_sets = Arc::new(LoggingIpSets::new("ipv4"));
    let filter = Arc::new(LoggingFilterTable::new("filter"));
    driver.add_ip_sets(ip_sets.clone());
    driver.add_filter_table(filter.clone());

    let captures = CaptureManager::new(
        Box::new(ActiveCaptures::new(capture_dir.clone())),
        prefixes,
    )
    .with_status(driver.status_combiner());
    driver.register(Box::new(captures));
    driver.register(Box::new(AllHostsIpSetManager::new(ip_sets, filter)));

    driver.add_startup_cleanup(
        "purge-orphaned-captures",
        RetryPolicy::default(),
        move || {
            let dir = capture_dir.clone();
            async move { purge_orphans(dir).await.map(|_| ()) }
        },
    );

    (driver, handle)
}

fn exit_for_restart(reason: &str) {
    error!(reason, "Dataplane environment changed, exiting to be restarted");
    std::process::exit(1)
}

/// Feed every event line into the matching driver queue.
async fn replay(input: Box<dyn AsyncRead + Unpin + Send>, handle: &DriverHandle) -> Result<()> {
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let update: Update = match serde_json::from_str(line) {
            Ok(u) => u,
            Err(e) => {
                warn!(line = line_no, "Skipping malformed event: {}", e);
                continue;
            }
        };
        let sent = match update {
            Update::ControlPlane(u) => handle.control.send(u).await.is_ok(),
            Update::IfaceState(u) => handle.iface_state.send(u).await.is_ok(),
            Update::IfaceAddrs(u) => handle.iface_addrs.send(u).await.is_ok(),
        };
        if !sent {
            anyhow::bail!("Driver stopped accepting updates");
        }
    }
    Ok(())
}

async fn print_status(mut rx: mpsc::UnboundedReceiver<StatusReport>) {
    while let Some(report) = rx.recv().await {
        match serde_json::to_string(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Failed to encode status report: {}", e),
        }
    }
}
