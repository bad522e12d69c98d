//! `aegis` — the host lifecycle daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use aegis::api;
use aegis::config::Config;
use aegis::lifecycle::LifecycleManager;
use aegis::logstore::LogStore;
use aegis::observe::{ObserveConfig, Observer};
use aegis::portalloc::PortAllocator;
use aegis::tether::TetherBus;
use aegis::vmm::mock::LocalProcessVmm;

#[derive(Parser)]
#[command(name = "aegis", version, about = "Local microVM orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host daemon: Lifecycle Manager, idle-policy loop, and the
    /// unix-domain HTTP API.
    Serve {
        /// Path to the unix-domain socket the host API listens on.
        #[arg(long, env = "AEGIS_SOCKET_PATH")]
        socket_path: Option<PathBuf>,

        /// Log level passed to the tracing env-filter (e.g. `info`,
        /// `aegis=debug`).
        #[arg(long, env = "AEGIS_LOG", default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            socket_path,
            log_level,
        } => {
            init_tracing(&log_level);
            if let Err(e) = serve(socket_path).await {
                tracing::error!(error = %e, "aegis daemon exited with error");
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(socket_path_override: Option<PathBuf>) -> std::io::Result<()> {
    let mut config = Config::from_env();
    if let Some(path) = socket_path_override {
        config.socket_path = path.to_string_lossy().into_owned();
    }

    let observer = Arc::new(Observer::new(ObserveConfig::from_env()));

    let manager = LifecycleManager::new(
        Arc::new(LocalProcessVmm::new()),
        Arc::new(LogStore::new(config.log_ring_capacity)),
        Arc::new(TetherBus::new(config.tether_buffer_capacity)),
        Arc::new(PortAllocator::new()),
        config.boot_timeout,
        config.exec_timeout,
    )
    .with_observer(observer);

    let idle_manager = manager.clone();
    let idle_threshold = config.idle_threshold;
    let idle_scan_interval = config.idle_scan_interval;
    tokio::spawn(async move {
        idle_manager.run_idle_loop(idle_scan_interval, idle_threshold).await;
    });

    tracing::info!(socket = %config.socket_path, "starting aegis host daemon");
    api::serve(std::path::Path::new(&config.socket_path), manager).await
}
