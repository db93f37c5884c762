use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::time::{Duration, timeout};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use capsync::memory::{MemoryEngine, MemoryNetwork};
use capsync::{
    Backend, BackendEvent, BackendOptions, CAN_READ, CAN_WRITE, Capabilities, PeerId, derive,
    generate_secret, generate_symmetrical_key,
};

#[derive(Parser, Debug)]
#[command(name = "capsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh set of document secrets
    Keygen {
        /// Only print a read secret (no write authority)
        #[arg(long)]
        read_only: bool,
    },
    /// Show what a set of secrets derives to
    Inspect(SecretArgs),
    /// Run two in-process peers and replicate a grant between them
    Demo {
        #[arg(short, long, default_value = "demo")]
        name: String,
    },
}

#[derive(Args, Debug)]
struct SecretArgs {
    #[arg(short, long)]
    read_key: String,

    #[arg(short, long)]
    write_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Keygen { read_only } => keygen(read_only),
        Command::Inspect(args) => inspect(&args),
        Command::Demo { name } => demo(&name).await,
    }
}

fn keygen(read_only: bool) -> Result<()> {
    println!("read key:      {}", generate_secret());
    if !read_only {
        println!("write key:     {}", generate_secret());
    }
    println!("symmetric key: {}", generate_symmetrical_key().to_base58());
    Ok(())
}

fn inspect(args: &SecretArgs) -> Result<()> {
    let keys = derive(&args.read_key, args.write_key.as_deref()).context("invalid secrets")?;
    println!("public identity: {}", keys.public_identity());
    println!("pad identifier:  {}", keys.pad_identifier());
    match keys.write_authority() {
        Some(authority) => println!("write authority: {}", authority.identity()),
        None => println!("write authority: none (read only)"),
    }
    Ok(())
}

async fn demo(name: &str) -> Result<()> {
    let network = MemoryNetwork::new();
    let engine = Arc::new(MemoryEngine::new());
    let read = generate_secret();

    let admin_node = Arc::new(network.node());
    let admin = Backend::new(
        BackendOptions::new(name, read.clone()).with_write_key(generate_secret()),
        admin_node.clone(),
        admin_node.clone(),
        engine.clone(),
    );
    let reader_node = Arc::new(network.node());
    let reader = Backend::new(
        BackendOptions::new(name, read),
        reader_node.clone(),
        reader_node.clone(),
        engine.clone(),
    );

    let mut admin_events = admin.events().await?;
    admin.start().await.context("admin backend failed to start")?;
    reader.start().await.context("reader backend failed to start")?;

    let admin_access = admin.access().context("admin backend not running")?;
    let reader_access = reader.access().context("reader backend not running")?;
    let mut updates = reader_access.updates();

    let peer = PeerId::from(reader_node.identity());
    admin_access
        .grant(peer.clone(), Capabilities::new().with(CAN_READ, true).with(CAN_WRITE, true))
        .await?;

    match timeout(Duration::from_secs(5), updates.recv()).await {
        Ok(Ok(update)) => info!(peer = %update.peer, capabilities = ?update.capabilities, "reader observed grant"),
        Ok(Err(e)) => warn!(error = %e, "update stream failed"),
        Err(_) => warn!("reader did not observe the grant"),
    }

    if let Err(e) = reader_access.grant(peer.clone(), Capabilities::new().with(CAN_WRITE, false)).await {
        info!(error = %e, "reader grant rejected as expected");
    }

    admin_access.revoke(peer.clone()).await?;
    let _ = timeout(Duration::from_secs(5), updates.recv()).await;
    info!(peer = %peer, state = ?reader_access.state(peer.clone()).await?, "after revoke");

    reader.stop().await;
    admin.stop().await;

    while let Ok(event) = admin_events.try_recv() {
        match event {
            BackendEvent::PeerConnected(peer) => info!(peer = %peer, "admin connected"),
            other => info!(event = ?other, "admin event"),
        }
    }
    Ok(())
}
