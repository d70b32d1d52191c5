//! Taixiu engine binary
//!
//! `run` hosts every running room until Ctrl-C. The other subcommands are
//! offline operator tools against the same data directory.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taixiu::{
    config::{ConfigLoader, EngineConfig},
    errors::{EngineResult, LedgerError},
    types::{AccountId, ForcingMode, Leaderboard, RoomId, RoomStatus},
    Engine, LogAnnouncer,
};
use tracing_subscriber::EnvFilter;

/// Tai/xiu betting room engine
#[derive(Parser)]
#[command(name = "taixiu")]
#[command(about = "Three-dice tai/xiu betting room engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host all running rooms until interrupted
    Run,

    /// Register a room and queue it for approval
    Request {
        #[arg(short, long, allow_negative_numbers = true)]
        room: i64,
        #[arg(short, long, default_value = "")]
        title: String,
    },

    /// Approve a room; it starts on the next `run`
    Approve {
        #[arg(short, long, allow_negative_numbers = true)]
        room: i64,
    },

    /// Revoke approval and stop the room
    Deny {
        #[arg(short, long, allow_negative_numbers = true)]
        room: i64,
    },

    /// Top up an account
    Credit {
        #[arg(short, long, allow_negative_numbers = true)]
        account: i64,
        #[arg(short = 'n', long)]
        amount: u64,
    },

    /// Set the forcing mode of a room (random, force-tai, force-xiu, sticky-tai, sticky-xiu)
    Mode {
        #[arg(short, long, allow_negative_numbers = true)]
        room: i64,
        mode: ForcingMode,
    },

    /// List accounts by balance
    Balances {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List top depositors
    Top {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show recent results of a room
    History {
        #[arg(short, long, allow_negative_numbers = true)]
        room: i64,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Create a promo code
    Promo {
        #[arg(short = 'n', long)]
        amount: u64,
        /// Rounds to wager before withdrawal (defaults to config)
        #[arg(short, long)]
        rounds: Option<u32>,
    },

    /// Write the effective configuration as TOML
    InitConfig {
        #[arg(short, long, default_value = "taixiu.toml")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> EngineResult<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_directory = dir;
    }

    let default_filter = format!("taixiu={}", config.monitoring.log_level.as_filter());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match cli.command {
        Commands::Run => run(config).await,
        Commands::InitConfig { path } => {
            ConfigLoader::save(&config, &path)?;
            println!("Configuration written to {}", path);
            Ok(())
        }
        command => admin(config, command).await,
    }
}

async fn run(config: EngineConfig) -> EngineResult<()> {
    tracing::info!(
        round_seconds = config.game.round_seconds,
        backend = ?config.storage.backend,
        data_dir = %config.storage.data_directory,
        "Starting taixiu engine"
    );

    let engine = Engine::builder(config)
        .with_announcer(Arc::new(LogAnnouncer))
        .build()?;
    let report = engine.startup().await?;
    println!(
        "Engine running: {} room(s) resumed, {} orphaned round(s) drained",
        report.rooms_started, report.orphan_rounds
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    engine.shutdown().await;

    let metrics = engine.metrics();
    println!(
        "Settled {} round(s), {} bet(s), volume {}",
        metrics.rounds_settled, metrics.bets_accepted, metrics.volume_wagered
    );
    Ok(())
}

async fn admin(config: EngineConfig, command: Commands) -> EngineResult<()> {
    let engine = Engine::builder(config).build()?;
    let ledger = engine.ledger();

    match command {
        Commands::Request { room, title } => {
            let record = engine.request_room(RoomId(room), &title).await?;
            println!("Room {} ({:?})", record.id, record.status);
        }
        Commands::Approve { room } => {
            let room = RoomId(room);
            let record = engine.room(room).await?;
            if record.status == RoomStatus::Unapproved {
                ledger.set_room_status(room, RoomStatus::Stopped).await?;
            }
            ledger.set_room_running(room, true).await?;
            println!("Room {} approved", room);
        }
        Commands::Deny { room } => {
            engine.deny_room(RoomId(room)).await?;
            println!("Room {} denied", room);
        }
        Commands::Credit { account, amount } => {
            let balance = engine.wallet().credit(AccountId(account), amount).await?;
            println!("Account {} balance {}", account, balance);
        }
        Commands::Mode { room, mode } => {
            let record = engine.set_forcing_mode(RoomId(room), mode).await?;
            println!("Room {} mode {}", record.id, record.mode);
        }
        Commands::Balances { limit } => {
            for account in engine.wallet().leaderboard(Leaderboard::ByBalance, limit).await? {
                println!("{:>14} {:<24} {:>14}", account.id, account.username, account.balance);
            }
        }
        Commands::Top { limit } => {
            for (rank, account) in engine
                .wallet()
                .leaderboard(Leaderboard::ByDeposits, limit)
                .await?
                .into_iter()
                .enumerate()
            {
                println!("{:>3}. {:<24} {:>14}", rank + 1, account.username, account.total_deposited);
            }
        }
        Commands::History { room, limit } => {
            let room = RoomId(room);
            if engine.ledger().get_room(room).await?.is_none() {
                return Err(LedgerError::RoomNotFound(room).into());
            }
            for entry in engine.recent_history(room, limit).await? {
                println!(
                    "#{:<10} {:?} = {:>2} {}{}",
                    entry.round,
                    entry.dice,
                    entry.total,
                    entry.side,
                    if entry.triple { " (jackpot)" } else { "" }
                );
            }
            println!("Jackpot: {}", engine.jackpot().await?);
        }
        Commands::Promo { amount, rounds } => {
            let promo = engine.wallet().create_promo(amount, rounds, None).await?;
            println!("{} worth {} ({} rounds)", promo.code, promo.amount, promo.wager_rounds);
        }
        Commands::Run | Commands::InitConfig { .. } => {}
    }
    Ok(())
}
