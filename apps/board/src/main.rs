mod config;
mod render;

use std::sync::Arc;

use anyhow::{Context, Result};
use board_core::{Board, BoardBackend, RestBackend};
use clap::{Parser, Subcommand};
use shared::domain::{RecordId, StageId};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{load_settings, prepare_database_url, Settings},
    render::{describe_notice, describe_outcome, render_columns},
};

#[derive(Parser, Debug)]
struct Args {
    /// Local SQLite store; ignored when a backend URL is set.
    #[arg(long)]
    database_url: Option<String>,
    /// Base URL of a REST/WebSocket backend, e.g. http://host/api.
    #[arg(long)]
    backend_url: Option<String>,
    /// `store` or a preset stage set (`prospects`, `deals`).
    #[arg(long)]
    board: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the board columns.
    Show,
    /// Drag a record to a stage and wait for the write to settle.
    Move {
        record_id: String,
        stage_id: String,
        /// Position in the target column; defaults to the end.
        #[arg(long)]
        index: Option<usize>,
    },
    /// Print the board again whenever the change feed reports a write.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if let Some(v) = args.backend_url {
        settings.backend_url = Some(v);
    }
    if let Some(v) = args.board {
        settings.board = v;
    }

    let board = mount(&settings).await?;
    let result = run(&board, args.command).await;
    board.unmount().await;
    result
}

async fn mount(settings: &Settings) -> Result<Arc<Board>> {
    let backend = match &settings.backend_url {
        Some(url) => {
            info!(backend_url = %url, "using remote backend");
            BoardBackend::from_shared(Arc::new(RestBackend::new(url)?))
        }
        None => {
            let database_url = prepare_database_url(&settings.database_url)?;
            info!(database_url = %database_url, "using local store");
            let storage = Storage::new(&database_url)
                .await
                .with_context(|| format!("failed to open store at {database_url}"))?;
            BoardBackend::from_shared(Arc::new(storage))
        }
    };

    Board::mount(settings.board_options(), settings.registry()?, backend).await
}

async fn run(board: &Board, command: Command) -> Result<()> {
    match command {
        Command::Show => {
            print!("{}", render_columns(board.registry(), &board.columns().await));
        }
        Command::Move {
            record_id,
            stage_id,
            index,
        } => {
            let outcome = board
                .move_record(&RecordId::new(record_id), &StageId::new(stage_id), index)
                .await?;
            println!("{}", describe_outcome(&outcome));
            print!("{}", render_columns(board.registry(), &board.columns().await));
        }
        Command::Watch => {
            let mut notices = board.subscribe_notices();
            if !board.feed_connected().await {
                warn!("change feed is not connected; nothing to watch");
            }
            print!("{}", render_columns(board.registry(), &board.columns().await));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notice = notices.recv() => match notice {
                        Ok(notice) => {
                            println!("-- {}", describe_notice(&notice));
                            print!("{}", render_columns(board.registry(), &board.columns().await));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "notice stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    Ok(())
}
