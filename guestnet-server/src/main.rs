mod config;
mod connected_ns;
mod counters;
mod datapath;
mod guest;
mod helper;
mod manager;
mod ndproxy;
mod port_rules;
mod routing;
mod shill;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use datapath::Datapath;
use helper::{Credentials, HelperSupervisor};
use manager::feature::FeatureGate;
use manager::{request, Channels, Manager};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument};

#[derive(Parser)]
#[command(name = "guestnetd")]
#[command(version = "0.1.0")]
#[command(about = "Guest network daemon for containers and VMs", long_about = None)]
struct Cli {
    /// Run a helper instead of the manager
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Proxy neighbor discovery between paired interfaces
    NdProxy {
        /// Control socket inherited from the manager
        #[arg(long)]
        control_fd: RawFd,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::NdProxy { control_fd }) => run_nd_proxy(control_fd).await,
        None => run_manager().await,
    }
}

async fn run_nd_proxy(control_fd: RawFd) -> Result<()> {
    telemetry::init_helper_logging();
    if control_fd < 0 {
        bail!("Invalid control fd {control_fd}");
    }
    // SAFETY: the manager hands this descriptor to exactly one helper and
    // nothing else in this process refers to it.
    #[allow(unsafe_code)]
    let control = unsafe { OwnedFd::from_raw_fd(control_fd) };

    let span = tracing::info_span!("nd_proxy", pid = std::process::id());
    ndproxy::daemon::run(control).instrument(span).await
}

async fn run_manager() -> Result<()> {
    let config = Config::from_env();
    let tracer_provider = telemetry::init_telemetry(config.otlp).context("Failed to initialize telemetry")?;

    info!("Starting guestnetd {}...", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::geteuid().is_root() {
        error!("guestnetd must be run as root");
        bail!("guestnetd must be run as root (required for links, namespaces and iptables)");
    }

    let nd_proxy_enabled = FeatureGate::nd_proxy(config.nd_proxy_boards.clone()).evaluate_file(&config.lsb_release);
    info!("ND proxy {}", if nd_proxy_enabled { "enabled" } else { "disabled" });

    let datapath = Datapath::system().context("Failed to initialize datapath")?;

    let credentials = match Credentials::for_user(&config.helper_user) {
        Ok(creds) => Some(creds),
        Err(e) => {
            warn!("Helpers will keep the manager's privileges: {:#}", e);
            None
        }
    };
    let (helper_tx, helper_events) = mpsc::unbounded_channel();
    let helpers = HelperSupervisor::new(credentials, helper_tx);

    let mut manager =
        Manager::new(datapath, &config, helpers, nd_proxy_enabled).context("Failed to create manager")?;
    manager.setup();
    manager.start_helpers(manager::helper_specs(&config, nd_proxy_enabled));

    let (snapshot_tx, snapshots) = mpsc::channel(8);
    let _poller = shill::netlink::spawn_poller(config.device_poll, snapshot_tx)
        .context("Failed to start device monitoring")?;

    let (sideload_tx, sideloading) = mpsc::unbounded_channel();
    if let Some(command) = config.adb_sideload_query.clone() {
        let _query = guest::crostini::spawn_adb_sideload_query(command, sideload_tx);
    }

    // Request transports attach to the handle
    let (_handle, requests) = request::channel(32);

    let channels = Channels {
        requests,
        snapshots,
        helper_events,
        sideloading,
    };
    manager.run(channels, shutdown_signal()).await;
    info!("guestnetd stopped");

    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("Failed to shut down tracer provider: {e}");
        }
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            None
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received SIGINT, initiating graceful shutdown..."),
                Err(e) => error!("Failed to listen for SIGINT: {}", e),
            }
        }
        Some(()) = async {
            match sigterm.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        } => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
