//! fpmgrd - Flexible Parser configuration worker daemon.
//!
//! Entry point for the fpmgrd daemon.

use std::process::ExitCode;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pfe_fpmgrd::{FciWorker, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "fpmgrd", about = "PFE Flexible Parser configuration worker")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Size of the DMEM window in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    dmem_size: usize,

    /// VLAN table primary hash slots (power of two)
    #[arg(long, default_value_t = 64)]
    vlan_hash_slots: usize,

    /// VLAN table collision slots
    #[arg(long, default_value_t = 32)]
    vlan_collision_slots: usize,
}

/// Initializes tracing/logging subsystem
fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    info!("--- Starting fpmgrd ---");

    let config = WorkerConfig {
        dmem_size: args.dmem_size,
        vlan_hash_slots: args.vlan_hash_slots,
        vlan_collision_slots: args.vlan_collision_slots,
        ..WorkerConfig::default()
    };
    let (worker, tx) = match FciWorker::new(config) {
        Ok(up) => up,
        Err(err) => {
            eprintln!("fpmgrd bring-up failed: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let handle = tokio::spawn(worker.run());

    info!("fpmgrd up, waiting for shutdown signal");
    if let Err(err) = tokio::signal::ctrl_c().await {
        eprintln!("failed to wait for shutdown signal: {err}");
        return ExitCode::FAILURE;
    }

    // Dropping the request handle drains and stops the worker.
    drop(tx);
    if handle.await.is_err() {
        return ExitCode::FAILURE;
    }

    info!("fpmgrd shut down");
    ExitCode::SUCCESS
}
