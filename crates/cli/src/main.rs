//! tss-cli
//!
//! Command-line client for the threshold-signing gateway.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use cli::GatewayClient;
use common::{eth, hexutil};

/// Drive keygen and signing through the gateway.
#[derive(Parser, Debug)]
#[command(name = "tss-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Gateway base URL.
    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:9100", global = true)]
    gateway: String,

    /// Request timeout in seconds.
    #[arg(long, default_value = "30", global = true)]
    timeout_secs: u64,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the gateway is up.
    Health,

    /// Show the group address from the last keygen.
    Address,

    /// Run distributed key generation.
    Keygen,

    /// Sign a 32-byte digest.
    SignHash {
        /// Digest as 64 hex characters, optional 0x prefix.
        hash_hex: String,
    },

    /// Verify a signature offline against an address.
    Verify {
        /// Digest as 64 hex characters.
        hash_hex: String,
        /// r scalar in hex.
        r: String,
        /// s scalar in hex.
        s: String,
        /// Expected Ethereum address.
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    let client = GatewayClient::with_timeout(&cli.gateway, Duration::from_secs(cli.timeout_secs))?;

    match cli.command {
        Commands::Health => {
            println!("{}", client.health().await?);
        }
        Commands::Address => {
            let identity = client.address().await?;
            if identity.address.is_empty() {
                println!("No key yet. Run `tss-cli keygen` first.");
            } else {
                println!("Group Identity");
                println!("==============");
                println!("  Address:    {}", identity.address);
                println!("  Public key: {}", identity.pubkey);
            }
        }
        Commands::Keygen => {
            let reply = client.keygen().await?;
            println!("Keygen Complete");
            println!("===============");
            println!("  Address:    {}", reply.address);
            println!("  Public key: {}", reply.pubkey);
            println!("  Threshold:  {}", reply.threshold);
            println!("  Parties:    {}", reply.parties.join(", "));
            println!("  Took:       {} ms", reply.t_keygen_ms);
        }
        Commands::SignHash { hash_hex } => {
            let digest = hexutil::decode_hash32(&hash_hex)?;
            let sig = client.sign_hash(&digest).await?;
            println!("Signature");
            println!("=========");
            println!("  r:          {}", hexutil::encode_0x(sig.r));
            println!("  s:          {}", hexutil::encode_0x(sig.s));
            println!("  Reported by {} in {} ms", sig.party, sig.t_sign_ms);
        }
        Commands::Verify {
            hash_hex,
            r,
            s,
            address,
        } => {
            let digest = hexutil::decode_hash32(&hash_hex)?;
            let r = hexutil::decode_left_padded32("r", &r)?;
            let s = hexutil::decode_left_padded32("s", &s)?;
            if !eth::verify_prehash_address(&address, &digest, &r, &s)? {
                anyhow::bail!("signature does not recover to {}", address);
            }
            println!("Signature is valid for {}", address);
        }
    }

    Ok(())
}
