use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use common::prelude::{App, AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(name = "endershare")]
#[command(about = "Peer-to-peer end-to-end-encrypted personal file vault")]
struct Args {
    /// Path to the node database.
    #[arg(long, global = true, default_value = "./endershare.db")]
    db_path: PathBuf,

    /// Directory for encrypted file blobs.
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// P2P listen port.
    #[arg(long, global = true, default_value_t = 13000)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a vault node. Replica by default; `--init` makes this device
    /// the master.
    Peer {
        /// Initialize this device as the vault master.
        #[arg(long)]
        init: bool,

        /// Initialize from an existing mnemonic instead of generating a
        /// new vault (implies --init).
        #[arg(long)]
        mnemonic: Option<String>,
    },
    /// Authorize a waiting replica using its 4-word sync phrase
    /// (master only).
    Bind {
        /// The phrase shown on the replica.
        #[arg(required = true, num_args = 1..)]
        phrase: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig {
        db_path: args.db_path.clone(),
        data_dir: args.data_dir.clone(),
        port: args.port,
    };

    let result = match args.command {
        Command::Peer { init, mnemonic } => run_peer(config, init, mnemonic).await,
        Command::Bind { phrase } => run_bind(config, phrase.join(" ")).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_peer(config: AppConfig, init: bool, mnemonic: Option<String>) -> Result<()> {
    let app = App::open(config).await.context("failed to open app state")?;
    let state = app.state().await;

    if init || mnemonic.is_some() {
        match state {
            AppState::Fresh => match mnemonic {
                Some(mnemonic) => {
                    app.unlock_with_mnemonic(mnemonic.trim())
                        .await
                        .context("failed to initialize from mnemonic")?;
                    println!("Master node initialized from mnemonic");
                }
                None => {
                    let mnemonic = app.create_vault().await.context("failed to create vault")?;
                    println!("Generated new vault. Write down the mnemonic:");
                    println!();
                    println!("    {mnemonic}");
                    println!();
                }
            },
            AppState::Locked => {
                let mnemonic =
                    mnemonic.context("this device is locked; pass --mnemonic to unlock")?;
                app.unlock_with_mnemonic(mnemonic.trim())
                    .await
                    .context("mnemonic rejected")?;
                println!("Vault unlocked");
            }
            _ => {
                tracing::info!("device already initialized; ignoring --init");
            }
        }
    }

    match app.state().await {
        AppState::Fresh => {
            // A replica with no master yet: enter binding mode.
            let phrase = app
                .start_replica_binding()
                .await
                .context("failed to start binding")?;
            app.start_node().await.context("failed to start node")?;
            println!("Binding mode. On the master device run:");
            println!();
            println!("    endershare bind {phrase}");
            println!();
        }
        _ => {
            app.start_node().await.context("failed to start node")?;
        }
    }

    println!("Node running (peer id will appear in logs). Ctrl-C to stop.");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    app.shutdown().await?;
    Ok(())
}

async fn run_bind(config: AppConfig, phrase: String) -> Result<()> {
    let app = App::open(config).await.context("failed to open app state")?;
    if !app.is_master().await {
        bail!("only master nodes can bind new peers");
    }

    app.start_node().await.context("failed to start node")?;
    app.bind_peer_with_phrase(phrase.trim())
        .await
        .context("binding failed")?;
    println!("Successfully bound new peer");
    app.shutdown().await?;
    Ok(())
}
