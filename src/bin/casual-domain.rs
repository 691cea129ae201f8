//! `casual-domain` — the long-running supervisor for one domain: boots
//! every server/executable declared in the domain's configuration, reaps
//! and restarts them, and drives the two-phase shutdown protocol when
//! asked. The `casual domain boot` CLI command performs the same boot
//! step for a one-shot invocation; this binary is the process that stays
//! up afterwards to actually supervise what it spawned.

use anyhow::{Context, Result};
use casual_core::dispatch::HandlerTable;
use casual_core::domain::config::Model;
use casual_core::domain::orchestrator::Orchestrator;
use casual_core::ids::IpcId;
use casual_core::transport::fifo::FifoDevice;
use casual_core::transport::pump::Pump;
use casual_core::transport::{Device, Envelope};
use casual_core::wire::{self, message_type};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise a domain's server and executable processes")]
struct Args {
    /// Root directory of the domain. Defaults to `$CASUAL_DOMAIN_HOME`.
    #[arg(long)]
    domain_home: Option<PathBuf>,

    /// Path to the domain's YAML configuration.
    #[arg(long)]
    config: PathBuf,

    /// Seconds to wait for processes to exit on `SIGTERM` before
    /// escalating to `SIGKILL` during shutdown.
    #[arg(long, default_value_t = 10)]
    soft_timeout_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = args
        .domain_home
        .or_else(|| std::env::var_os("CASUAL_DOMAIN_HOME").map(PathBuf::from))
        .context("no domain home given; pass --domain-home or set CASUAL_DOMAIN_HOME")?;

    let _log_guard = casual_core::logging::init("domain", &home.join("log"))?;

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading domain configuration {}", args.config.display()))?;
    let model = Model::from_yaml(&text).context("parsing domain configuration")?;

    let orchestrator = Arc::new(Mutex::new(Orchestrator::new(model, home.clone())?));
    orchestrator.lock().unwrap().boot().await?;
    info!(processes = orchestrator.lock().unwrap().process_count(), "domain booted");

    let own_ipc_id = IpcId::new();
    casual_core::cli::publish_admin_id(&home, "domain", own_ipc_id)?;
    let device = FifoDevice::bind(&home.join("ipc"), own_ipc_id, IpcId::nil())?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));

    let mut table = HandlerTable::new();
    {
        let shutdown_requested = shutdown_requested.clone();
        table.on(
            message_type::SHUTDOWN_REQUEST,
            Box::new(move |envelope| {
                let _: wire::ShutdownRequest = wire::decode(&envelope.payload)?;
                info!("shutdown requested");
                shutdown_requested.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
    }
    {
        let orchestrator = orchestrator.clone();
        table.on(
            message_type::CONNECT,
            Box::new(move |envelope| {
                let connect: wire::Connect = wire::decode(&envelope.payload)?;
                let mut orchestrator = orchestrator.lock().unwrap();
                match orchestrator.key_for_pid(connect.pid) {
                    Some(key) => {
                        orchestrator.record_connect(&key, connect.ipc_id)?;
                        info!(alias = %connect.alias, pid = connect.pid, "process connected");
                    }
                    None => warn!(alias = %connect.alias, pid = connect.pid, "connect from untracked pid"),
                }
                Ok(())
            }),
        );
    }

    let mut pump = Pump::new();
    pump.register(
        "domain-admin",
        Box::new(device),
        Box::new(move |_name, envelope| table.dispatch(envelope)),
    );

    loop {
        orchestrator.lock().unwrap().reap().await?;
        if shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
        pump.run_once().await?;
    }

    info!("entering shutdown sequence");
    orchestrator
        .lock()
        .unwrap()
        .shutdown(Duration::from_secs(args.soft_timeout_seconds))
        .await?;
    info!("domain shutdown complete");

    Ok(())
}
