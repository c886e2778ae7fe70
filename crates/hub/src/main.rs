//! tss-hub: relay process shared by the gateway and all node agents.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use common::observability;
use hub::{server, Hub, HubConfig};

#[derive(Parser, Debug)]
#[command(name = "tss-hub")]
#[command(about = "Session relay for threshold-signing parties")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "HUB_LISTEN", default_value = "0.0.0.0:9000")]
    listen: String,

    /// Seconds a new connection may take to send its hello.
    #[arg(long, env = "HUB_HELLO_TIMEOUT_SECS", default_value = "30")]
    hello_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.json_logs);

    observability::banner("TSS Hub Starting");
    debug!("CLI arguments: {:?}", args);

    let config = HubConfig {
        hello_timeout: Duration::from_secs(args.hello_timeout_secs),
    };
    let hub = Arc::new(Hub::new());

    info!("Configuration:");
    info!("  - Listen address: {}", args.listen);
    info!("  - Hello timeout:  {:?}", config.hello_timeout);
    info!("");
    info!("Endpoints:");
    info!("  GET    /ws        - WebSocket relay (hello first)");
    info!("  GET    /health    - Health check");
    info!("  GET    /sessions  - Session snapshot");

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("Hub is ready on {}", listener.local_addr()?);
    info!("========================================");

    server::serve(listener, hub, config, shutdown_signal()).await?;
    info!("Hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    } else {
        // No signal handler; run until killed.
        std::future::pending::<()>().await;
    }
}
