//! tss-gateway: HTTP front end of the threshold-signing cluster.

use std::future::IntoFuture;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info};

use common::{client, observability, Role, WireMessage};
use gateway::{parse_parties, router, GatewayConfig, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "tss-gateway")]
#[command(about = "HTTP gateway for threshold keygen and signing")]
struct Args {
    /// Hub WebSocket URL.
    #[arg(long, env = "COORDINATOR_URL", default_value = common::DEFAULT_HUB_URL)]
    coordinator: String,

    /// Session shared with the nodes.
    #[arg(long, env = "CLUSTER_SESSION", default_value = common::DEFAULT_SESSION)]
    session: String,

    /// The gateway's own party id.
    #[arg(long, env = "GATEWAY_PARTY", default_value = common::DEFAULT_GATEWAY_PARTY)]
    party: String,

    /// Comma-separated signing parties, in protocol order.
    #[arg(long, env = "TSS_PARTIES", default_value = "P1,P2,P3")]
    parties: String,

    /// Threshold t; any t + 1 parties can sign.
    #[arg(long, env = "TSS_THRESHOLD", default_value = "1")]
    threshold: u16,

    /// HTTP listen address.
    #[arg(long, env = "GATEWAY_LISTEN", default_value = "0.0.0.0:9100")]
    listen: String,

    /// Keygen deadline in seconds.
    #[arg(long, env = "KEYGEN_TIMEOUT_SECS", default_value = "2700")]
    keygen_timeout_secs: u64,

    /// Signing deadline in seconds.
    #[arg(long, env = "SIGN_TIMEOUT_SECS", default_value = "900")]
    sign_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.json_logs);

    observability::banner("TSS Gateway Starting");
    debug!("CLI arguments: {:?}", args);

    let config = GatewayConfig {
        session: args.session.clone(),
        party: args.party.trim().to_string(),
        parties: parse_parties(&args.parties),
        threshold: args.threshold,
        keygen_timeout: Duration::from_secs(args.keygen_timeout_secs),
        sign_timeout: Duration::from_secs(args.sign_timeout_secs),
    };
    config.validate()?;

    info!("Configuration:");
    info!("  - Coordinator:    {}", args.coordinator);
    info!("  - Session:        {}", config.session);
    info!("  - Party:          {}", config.party);
    info!("  - Parties:        {:?}", config.parties);
    info!("  - Threshold:      {}", config.threshold);
    info!("  - Keygen timeout: {:?}", config.keygen_timeout);
    info!("  - Sign timeout:   {:?}", config.sign_timeout);

    let hello = WireMessage::hello(config.session.clone(), config.party.clone(), Role::Gateway);
    let connection = client::connect(&args.coordinator, hello).await?;
    let (sender, inbound, closer) = connection.into_parts();
    let (state, pump) = GatewayState::new(config, sender, inbound);
    let app = router(state);

    info!("");
    info!("Endpoints:");
    info!("  GET    /health    - Health check");
    info!("  GET    /address   - Group address and public key");
    info!("  POST   /keygen    - Distributed key generation");
    info!("  POST   /signHash  - Sign a 32-byte digest");

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("Gateway is ready on {}", listener.local_addr()?);
    info!("========================================");

    // Losing the hub is fatal; the operator restarts the gateway.
    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        _ = pump => {
            error!("Hub connection lost; shutting down");
            closer.cancel();
            anyhow::bail!("hub connection lost");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            closer.cancel();
        }
    }
    Ok(())
}
