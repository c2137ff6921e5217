// meshweave — relay service and diagnostics for meshweave-core
//
// `meshweave serve` runs the websocket relay; `meshweave ping` checks a
// relay's liveness and reports the assigned endpoint id and round trip.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshweave_core::signaling::{SignalMessage, SignalingConfig, SignalingLink};
use meshweave_core::RelayServer;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Parser)]
#[command(name = "meshweave")]
#[command(about = "MeshWeave — relay-bootstrapped peer meshes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Ping a relay and report latency
    Ping {
        /// Relay endpoint, e.g. ws://127.0.0.1:3000
        server: String,
        #[arg(short, long, default_value = "5")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshweave=info,meshweave_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => serve(&host, port).await,
        Commands::Ping {
            server,
            timeout_secs,
        } => ping(&server, Duration::from_secs(timeout_secs)).await,
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    let relay = RelayServer::new();
    let (addr, task) = relay
        .bind(&format!("{host}:{port}"))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    println!("{} relay listening on {}", "✓".green(), addr.to_string().cyan());
    info!(addr = %addr, "Serving");

    tokio::signal::ctrl_c().await?;
    println!("\n{} shutting down", "✓".green());
    task.abort();
    Ok(())
}

async fn ping(server: &str, timeout: Duration) -> Result<()> {
    let config = SignalingConfig {
        endpoints: vec![server.to_string()],
        ..SignalingConfig::default()
    };
    let (link, mut inbound) = SignalingLink::new(config)?;
    link.connect()
        .await
        .with_context(|| format!("connecting to {server}"))?;

    let sent = now_millis();
    link.send(SignalMessage::Ping { timestamp: sent }).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, inbound.recv())
            .await
            .context("timed out waiting for pong")?
            .context("relay closed the connection")?;
        match frame {
            SignalMessage::Connected { id, connected_peers, .. } => {
                println!(
                    "{} connected as {} ({} client{})",
                    "✓".green(),
                    id.cyan(),
                    connected_peers,
                    if connected_peers == 1 { "" } else { "s" }
                );
            }
            SignalMessage::Pong {
                timestamp,
                server_tick,
            } => {
                let rtt = now_millis().saturating_sub(timestamp);
                match server_tick {
                    Some(tick) => {
                        println!("{} pong in {}ms (server tick {})", "✓".green(), rtt, tick)
                    }
                    None => println!("{} pong in {}ms", "✓".green(), rtt),
                }
                link.close().await;
                return Ok(());
            }
            SignalMessage::Error { message } => {
                link.close().await;
                bail!("relay error: {message}");
            }
            _ => {}
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
