//! tss-node: one party of the threshold-signing cluster.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use common::{client, observability, Role, WireMessage};
use node::{EngineKind, NodeAgent, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "tss-node")]
#[command(about = "Threshold-signing node agent")]
struct Args {
    /// Party id inside the session (e.g. P1).
    #[arg(long, env = "PARTY_ID")]
    party: String,

    /// Session shared with the gateway and the other nodes.
    #[arg(long, env = "CLUSTER_SESSION", default_value = common::DEFAULT_SESSION)]
    session: String,

    /// Hub WebSocket URL.
    #[arg(long, env = "COORDINATOR_URL", default_value = common::DEFAULT_HUB_URL)]
    coordinator: String,

    /// Directory for keygen.json.
    #[arg(long, env = "DATA_DIR", default_value = "/data")]
    data_dir: PathBuf,

    /// Party id results are sent to.
    #[arg(long, env = "GATEWAY_PARTY", default_value = common::DEFAULT_GATEWAY_PARTY)]
    gateway_party: String,

    /// MPC engine.
    #[arg(long, env = "TSS_ENGINE", value_enum, default_value = "cggmp24")]
    engine: EngineKind,

    /// Keygen ceiling in seconds.
    #[arg(long, env = "KEYGEN_TIMEOUT_SECS", default_value = "1800")]
    keygen_timeout_secs: u64,

    /// Signing ceiling in seconds.
    #[arg(long, env = "SIGN_TIMEOUT_SECS", default_value = "600")]
    sign_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.json_logs);

    observability::banner("TSS Node Starting");
    debug!("CLI arguments: {:?}", args);

    let mut config = NodeConfig::new(args.party.trim(), args.data_dir.clone());
    config.session = args.session.clone();
    config.gateway_party = args.gateway_party.clone();
    config.keygen_timeout = Duration::from_secs(args.keygen_timeout_secs);
    config.sign_timeout = Duration::from_secs(args.sign_timeout_secs);
    anyhow::ensure!(!config.party.is_empty(), "party id must not be empty");

    info!("Configuration:");
    info!("  - Party:          {}", config.party);
    info!("  - Session:        {}", config.session);
    info!("  - Coordinator:    {}", args.coordinator);
    info!("  - Data dir:       {:?}", config.data_dir);
    info!("  - Gateway party:  {}", config.gateway_party);
    info!("  - Engine:         {:?}", args.engine);
    info!("  - Keygen timeout: {:?}", config.keygen_timeout);
    info!("  - Sign timeout:   {:?}", config.sign_timeout);

    let hello = WireMessage::hello(config.session.clone(), config.party.clone(), Role::Node);
    let connection = client::connect(&args.coordinator, hello).await?;
    let (sender, inbound, closer) = connection.into_parts();

    let agent = NodeAgent::new(config, args.engine.build(), sender);
    match agent.store().load().await {
        Ok(share) => info!("Loaded key share for address {}", share.address),
        Err(e) => info!("No usable key share yet: {}", e),
    }
    info!("Node is ready");
    info!("========================================");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    let result = agent.run(inbound, shutdown).await;
    closer.cancel();
    if let Err(e) = &result {
        error!("Node agent stopped: {}", e);
    }
    result.map_err(Into::into)
}
