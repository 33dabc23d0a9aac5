//! Gateway service binary.
//!
//! Offers a gateway for internal services to be reached from the outside
//! world: capabilities registered here stay resolvable for as long as their
//! clients keep heartbeating.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use uuid::Uuid;

use weir::gateway::{GatewayService, DEFAULT_SECS_KEEP_ALIVE_TIMEOUT};
use weir::restorer::{Cap, MemRestorer, Restorer};
use weir::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "weir-gateway",
    version,
    about = "Gateway for internal services to be accessed from the outside world"
)]
struct Args {
    /// Seconds a registration survives without a heartbeat.
    #[arg(
        short = 't',
        long = "secs_keep_alive_timeout",
        default_value_t = DEFAULT_SECS_KEEP_ALIVE_TIMEOUT
    )]
    secs_keep_alive_timeout: u64,

    /// Gateway name.
    #[arg(long, default_value = "Gateway")]
    name: String,

    /// Gateway description.
    #[arg(
        long,
        default_value = "Offers a gateway for internal services to be accessed from the outside world."
    )]
    description: String,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    telemetry::init(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> weir::Result<()> {
    let restorer = Arc::new(MemRestorer::new(Uuid::new_v4().to_string()));
    tracing::info!(
        secs_keep_alive_timeout = args.secs_keep_alive_timeout,
        "starting gateway service"
    );
    let gateway = GatewayService::spawn(
        restorer.clone(),
        &args.name,
        &args.description,
        args.secs_keep_alive_timeout,
    );

    let saved = restorer.save(Cap::Gateway(gateway.client()), None)?;
    println!("gatewaySR={}", saved.sturdy_ref);

    let term = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone());
    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutdown signal received");
    gateway.shutdown();
    tracing::info!("gateway service stopped");
    Ok(())
}
