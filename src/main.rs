//! arcdeck - event fabric for a single-device arc media controller.
//!
//! One binary, one service per process: `arcdeck <service>` runs the
//! input daemon, router, player adapter, remote ingress or supervisor.
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 required
//! dependency unreachable after initial probes, 3 supervisor-requested
//! restart.

use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arcdeck::{config, ingress, input, peer, players, router, supervisor};

const EXIT_CONFIG: u8 = 1;
const EXIT_DEPENDENCY: u8 = 2;

fn print_help() {
    println!("arcdeck {} ({})", env!("ARCDECK_VERSION"), env!("ARCDECK_GIT_SHA"));
    println!();
    println!("Event fabric for a single-device arc media controller.");
    println!();
    println!("USAGE:");
    println!("    arcdeck <SERVICE>");
    println!();
    println!("SERVICES:");
    println!("    input         HID decode, menu hosting, event fan-out");
    println!("    router        Active-source state machine and command fan-out");
    println!("    player        Networked-speaker or local-decoder adapter");
    println!("    ingress       IR and Bluetooth LE remote ingress");
    println!("    supervisor    Timer-driven peer health checks and restarts");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -V, --version    Print version information");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    ARCDECK_CONFIG_DIR   Configuration directory (default /etc/arcdeck)");
    println!("    RUST_LOG             Log filter (default arcdeck=debug)");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("arcdeck {} ({})", env!("ARCDECK_VERSION"), env!("ARCDECK_GIT_SHA"));
        return ExitCode::SUCCESS;
    }
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    // Initialize logging. Priority: RUST_LOG > default
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "arcdeck=debug,tower_http=info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service = args[1].as_str();
    tracing::info!(
        "Starting arcdeck {} v{} ({})",
        service,
        env!("ARCDECK_VERSION"),
        env!("ARCDECK_GIT_SHA")
    );

    // Secrets first so config env overrides can reference them.
    if let Err(e) = config::load_secrets() {
        eprintln!("arcdeck: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }
    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("arcdeck: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    // A reload request (SIGHUP) is a supervisor-style restart: shut down
    // gracefully and exit 3 so the service manager brings us back with
    // fresh configuration.
    let reload_requested = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reload_flag = reload_requested.clone();
    tokio::spawn(async move {
        if shutdown_signal().await == ShutdownKind::Reload {
            reload_flag.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        signal_cancel.cancel();
    });

    let outcome: anyhow::Result<i32> = match service {
        "input" => input::run(config, cancel).await.map(|_| 0),
        "router" => router::routes::run(config, cancel).await.map(|_| 0),
        "player" => {
            // The player is useless without a reachable router.
            if !probe_router(&config).await {
                eprintln!("arcdeck: router unreachable at {}", config.router_url());
                return ExitCode::from(EXIT_DEPENDENCY);
            }
            players::run(config, cancel).await.map(|_| 0)
        }
        "ingress" => ingress::run(config, cancel).await,
        "supervisor" => supervisor::run(config, cancel).await.map(|_| 0),
        other => {
            eprintln!("arcdeck: unknown service `{}`", other);
            print_help();
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match outcome {
        Ok(0) if reload_requested.load(std::sync::atomic::Ordering::Relaxed) => {
            tracing::info!("{} restarting for config reload", service);
            ExitCode::from(3)
        }
        Ok(0) => {
            tracing::info!("{} shut down cleanly", service);
            ExitCode::SUCCESS
        }
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(e) => {
            tracing::error!(error = %e, "{} failed", service);
            ExitCode::FAILURE
        }
    }
}

/// Three quick probes before giving up with exit code 2.
async fn probe_router(config: &config::Config) -> bool {
    let client = peer::PeerClient::new();
    let url = format!("{}/health", config.router_url());
    for _ in 0..3 {
        if client.probe(&url, peer::HEALTH_DEADLINE).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownKind {
    Terminate,
    Reload,
}

/// Wait for a shutdown (Ctrl+C, SIGTERM) or reload (SIGHUP) signal.
#[allow(clippy::expect_used)] // Signal handlers must succeed for graceful shutdown
async fn shutdown_signal() -> ShutdownKind {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let reload = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let reload = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            ShutdownKind::Terminate
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            ShutdownKind::Terminate
        }
        _ = reload => {
            tracing::info!("Received SIGHUP, restarting for reload...");
            ShutdownKind::Reload
        }
    }
}
