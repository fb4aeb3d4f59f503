use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshtun::backoff::ExponentialBackoff;
use meshtun::connection::DEFAULT_PATH_TIMEOUT;
use meshtun::engine::{Engine, EngineConfig, DEFAULT_ATTEMPT_TIMEOUT};
use meshtun::iface::WgIface;
use meshtun::signal::WsSignal;
use meshtun::{admin, Config};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "meshtun", version, about = "Mesh VPN agent")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/meshtun/config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a new configuration with a fresh private key
    Init {
        /// Signal server URL
        #[arg(long)]
        signal_addr: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Bring the interface up and connect to the configured peers
    Up,
    /// Print the public key of the configured private key
    Pubkey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    match cli.command {
        Command::Init { signal_addr, force } => init(&cli.config, signal_addr, force),
        Command::Up => up(&cli.config).await,
        Command::Pubkey => {
            let config = Config::read(&cli.config)?;
            println!("{}", config.private_key()?.public_key());
            Ok(())
        }
    }
}

fn init(path: &Path, signal_addr: Option<String>, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = Config::generate();
    if let Some(addr) = signal_addr {
        config.signal_addr = addr;
    }
    config.write(path)?;
    info!("Wrote {}", path.display());
    println!("{}", config.private_key()?.public_key());
    Ok(())
}

async fn up(path: &Path) -> Result<()> {
    let config = Config::read(path)?;
    let key = config.private_key()?;
    let public = key.public_key();
    info!("Starting meshtun as {}", public);

    let signal = WsSignal::connect(&config.signal_addr, public, config.signal_insecure_tls);
    let engine_config = EngineConfig {
        wg_iface: config.wg_iface.clone(),
        wg_addr: config.wg_addr.clone(),
        stun_turn_urls: config.stun_turn_urls.clone(),
        iface_black_list: config.iface_black_list.iter().cloned().collect::<HashSet<_>>(),
        allow_loopback: false,
        attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        path_timeout: DEFAULT_PATH_TIMEOUT,
        backoff: ExponentialBackoff::peer_default(),
    };
    let engine = Engine::new(engine_config, signal.clone(), Arc::new(WgIface::new()));

    engine
        .start(key, config.peers.clone())
        .await
        .context("Failed to start engine")?;

    let admin_engine = engine.clone();
    let admin_addr = config.admin_addr;
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_addr, admin_engine).await {
            error!("{:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    engine.stop().await;
    signal.close();
    Ok(())
}
