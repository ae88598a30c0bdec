//! The `growbox-node` binary.
//!
//! It runs a node on a Linux host, with a simulated board.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use growbox_node::boot::{BootConfig, DEFAULT_BOOTSTRAP_PATH, boot_until_ready};
use growbox_node::mqtt::MqttTransport;
use growbox_node::net::HostRadio;
use growbox_node::sim::SimulatedBoard;

use tokio_util::sync::CancellationToken;

use tracing::{Level, error, info};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bootstrap file.
    #[arg(short, long, default_value = DEFAULT_BOOTSTRAP_PATH)]
    bootstrap: PathBuf,

    /// Maximum log level.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// Wireless association attempts before a boot attempt fails.
    #[arg(long, default_value_t = 5)]
    association_attempts: u32,

    /// Pause between two boot attempts, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    boot_retry_delay_ms: u64,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let mut config = BootConfig {
        bootstrap: cli.bootstrap,
        retry_delay: Duration::from_millis(cli.boot_retry_delay_ms),
        ..BootConfig::default()
    };
    config.link.retry.max_attempts = cli.association_attempts;

    // Actors share the link through `Rc`, hence a single-threaded runtime.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Unable to start the runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let cancellation_token = CancellationToken::new();

        let shutdown = cancellation_token.clone();
        drop(tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signals: {e}");
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        }));

        let node = boot_until_ready(
            &config,
            || (HostRadio::new(), MqttTransport::new(), SimulatedBoard::new()),
            &cancellation_token,
        )
        .await;

        if let Some(node) = node {
            node.run(cancellation_token).await;
        }
    });
}
