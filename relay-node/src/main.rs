// Relay daemon and command-line client.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_core::{paths, wire, Envelope, Identity, Registry, TransferAnnouncement};
use relay_node::{
    config, discovery, receive, Client, ClientOptions, Config, Listener, TransferEngine,
    TransferOptions, TransferSource,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relay-node", version, about = "Encrypted LAN messaging relay")]
struct Cli {
    /// Config file (default: ~/.config/relay/config.toml, then /etc/relay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay and its discovery responder until Ctrl+C or SIGTERM
    Serve,

    /// Broadcast a discovery query and list the relays that answer
    Probe {
        /// Discovery port (default: broadcast_port from config)
        #[arg(long)]
        port: Option<u16>,
        /// Destination address for the query
        #[arg(long, default_value_t = Ipv4Addr::BROADCAST)]
        address: Ipv4Addr,
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },

    /// Offer a file or directory to another client and wait for it to be fetched
    Send {
        #[arg(long)]
        relay: SocketAddr,
        /// Our identity (positive)
        #[arg(long)]
        identity: i32,
        /// Receiving identity
        #[arg(long)]
        to: i32,
        path: PathBuf,
    },

    /// Wait for one offered transfer and store it under `dest`
    Receive {
        #[arg(long)]
        relay: SocketAddr,
        #[arg(long)]
        identity: i32,
        #[arg(default_value = ".")]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging("info");
    let config = config::load(cli.config.as_deref());

    let result = match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Probe {
            port,
            address,
            wait_ms,
        } => {
            let port = port.unwrap_or(config.broadcast_port);
            cmd_probe(SocketAddr::from((address, port)), Duration::from_millis(wait_ms)).await
        }
        Commands::Send {
            relay,
            identity,
            to,
            path,
        } => cmd_send(config, relay, Identity(identity), Identity(to), path).await,
        Commands::Receive {
            relay,
            identity,
            dest,
        } => cmd_receive(config, relay, Identity(identity), dest).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let tcp = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
        .await
        .with_context(|| format!("cannot listen on port {}", config.listen_port))?;
    let udp = discovery::bind_responder(config.broadcast_port)
        .with_context(|| format!("cannot bind discovery port {}", config.broadcast_port))?;
    let listener = Listener::new(config);

    let server = tokio::spawn(listener.clone().serve(tcp));
    let responder = tokio::spawn(discovery::run_responder(udp, listener.clone()));

    tokio::select! {
        r = shutdown_signal() => r?,
        r = server => r.context("listener task")?.context("listener stopped")?,
    }
    info!("shutting down");
    responder.abort();
    listener.shutdown();
    Ok(())
}

async fn cmd_probe(target: SocketAddr, wait: Duration) -> anyhow::Result<()> {
    let found = discovery::probe(target, wait).await?;
    if found.is_empty() {
        println!("no relays answered");
    }
    for (addr, record) in found {
        println!(
            "{addr}\t{}\t{}/{} clients",
            record.name, record.current, record.max
        );
    }
    Ok(())
}

async fn cmd_send(
    config: Config,
    relay: SocketAddr,
    identity: Identity,
    to: Identity,
    path: PathBuf,
) -> anyhow::Result<()> {
    let client = Client::connect(relay, identity, &ClientOptions::from(&config), Registry::new())
        .await
        .context("connect to relay")?;
    let engine = TransferEngine::for_client(&client, TransferOptions::from(&config))?;
    let meta = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let source = if meta.is_dir() {
        TransferSource::Directory(path)
    } else {
        TransferSource::File(path)
    };
    let handle = engine.announce(&client, to, source).await?;
    println!("offered transfer {} to {to}", handle.token());
    let done = handle.finished().await;
    engine.shutdown();
    println!("{:?} after {} bytes", done.status, done.position);
    Ok(())
}

async fn cmd_receive(
    config: Config,
    relay: SocketAddr,
    identity: Identity,
    dest: PathBuf,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = Registry::new().on(paths::TRANSFER_ANNOUNCE, move |_: &Client, env: &Envelope| {
        match wire::decode_payload::<TransferAnnouncement>(&env.payload) {
            Ok(a) => {
                let _ = tx.send((env.source, a));
            }
            Err(e) => error!(source = %env.source, error = %e, "malformed announcement"),
        }
    });
    let client = Client::connect(relay, identity, &ClientOptions::from(&config), registry)
        .await
        .context("connect to relay")?;
    println!("waiting for a transfer as {identity}");

    let (from, announcement) = tokio::select! {
        a = rx.recv() => a.context("relay session ended")?,
        _ = client.closed() => anyhow::bail!("relay session ended"),
    };
    println!("receiving {} from {from}", announcement.name);
    let handle = receive(announcement, dest, &TransferOptions::from(&config));
    let done = handle.finished().await;
    println!("{:?} after {} bytes", done.status, done.position);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
