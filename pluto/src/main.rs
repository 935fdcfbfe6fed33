mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use pluto_user::config::{read_config, Config};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the deployment configuration file
    #[clap(short, long, env = "PLUTO_CONFIG", default_value = "pluto.toml")]
    config: PathBuf,

    /// Log verbosity: debug, info, warn or error
    #[clap(long, env = "PLUTO_LOGLEVEL", default_value = "info")]
    loglevel: String,

    #[clap(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the public IMAP front-end
    Distributor,
    /// Run the authoritative node for one range of users
    Worker { name: String },
    /// Run the shared secondary replica
    Storage,
}

#[tokio::main]
async fn main() {
    // Abort on panic; the orchestrator restarts us and the journals resume
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    let args = Args::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("pluto={0},pluto_crdt={0},pluto_sync={0},pluto_user={0},pluto_mail={0},pluto_proto={0}", args.loglevel));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("exiting on error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config: Config = read_config(args.config.clone())
        .with_context(|| format!("reading configuration {}", args.config.display()))?;
    let config = std::sync::Arc::new(config);

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = term.recv() => (),
            _ = int.recv() => (),
        }
        tracing::info!("shutdown requested");
        let _ = exit_tx.send(true);
    });

    match args.role {
        Role::Distributor => server::run_distributor(config, exit_rx).await,
        Role::Worker { name } => server::run_worker(config, &name, exit_rx).await,
        Role::Storage => server::run_storage(config, exit_rx).await,
    }
}
