//! Ingestion daemon: reads validated snapshots (one JSON document per
//! line) from stdin, appends them to the game-state log, and drives the
//! update pipeline that keeps the derived ratings store current.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use scrimrank_core::snapshot::GameState;
use scrimrank_statelog::{GameStateLog, LogEntry, LogError};
use scrimrank_updater::{
    channel, config::load_seasons, remap::PlayerConfig, run_consumer, ConsumerHandle,
    QueueConsumer, Updater, UpdaterMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Snapshot ingestion and rating-update daemon.
#[derive(Parser)]
struct Options {
    /// Directory holding the log, the ratings store and config files.
    #[clap(short, long, env = "SCRIMRANK_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Seasons file; defaults to `<data-dir>/seasons.toml`.
    #[clap(long, env = "SCRIMRANK_SEASONS")]
    seasons: Option<PathBuf>,

    /// Player alias/ignore file; defaults to `<data-dir>/players.toml`,
    /// which may be absent.
    #[clap(long, env = "SCRIMRANK_PLAYERS")]
    players: Option<PathBuf>,

    /// Rebuild the derived store from the whole log before ingesting.
    #[clap(long)]
    recalculate: bool,
}

/// Appends snapshot batches to the log and notifies the updater.
///
/// Ids continue from the last entry already in the log, so restarts never
/// reuse an id.
struct StateWriter {
    log: Arc<GameStateLog>,
    updater: ConsumerHandle<UpdaterMessage>,
    next_id: u64,
}

impl QueueConsumer for StateWriter {
    type Message = String;

    async fn process_batch(&mut self, messages: Vec<String>) -> anyhow::Result<()> {
        tracing::debug!(count = messages.len(), "appending snapshots");
        let created_at = Utc::now().timestamp();

        let mut writer = self.log.writer(None)?;
        for message in &messages {
            let entry = LogEntry {
                id: self.next_id,
                created_at,
                payload: message.clone().into_bytes(),
            };
            writer.append(&entry)?;
            self.next_id += 1;
        }
        writer.flush()?;
        drop(writer);

        self.updater.send(UpdaterMessage::Process {
            max_id: self.next_id - 1,
        });
        Ok(())
    }
}

fn last_log_id(log: &GameStateLog) -> anyhow::Result<u64> {
    let mut reader = log.reader(None)?;
    match reader.fetch_last() {
        Ok(entry) => Ok(entry.id),
        Err(LogError::NoSuchRecord) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
    let opt = Options::parse();

    std::fs::create_dir_all(&opt.data_dir)
        .with_context(|| format!("failed to create data dir {}", opt.data_dir.display()))?;
    let log = Arc::new(GameStateLog::new(opt.data_dir.join("statelog.bin")));
    let db_path = opt.data_dir.join("skill.db");

    let seasons_path = opt
        .seasons
        .unwrap_or_else(|| opt.data_dir.join("seasons.toml"));
    let seasons = load_seasons(&seasons_path)?;

    let players_path = opt
        .players
        .unwrap_or_else(|| opt.data_dir.join("players.toml"));
    let players = if players_path.exists() {
        PlayerConfig::load(&players_path)?
    } else {
        PlayerConfig::default()
    };

    let (updater_handle, updater_rx) = channel();
    let updater = Updater::new(log.clone(), &db_path, seasons, players);
    let updater_task = tokio::spawn(run_consumer(updater, updater_rx));

    if opt.recalculate {
        updater_handle.send(UpdaterMessage::Recalculate);
    }

    let last_id = last_log_id(&log)?;
    if last_id > 0 {
        // Catch up on anything appended while the pipeline was down.
        updater_handle.send(UpdaterMessage::Process { max_id: last_id });
    }

    let (writer_handle, writer_rx) = channel();
    let state_writer = StateWriter {
        log: log.clone(),
        updater: updater_handle.clone(),
        next_id: last_id + 1,
    };
    let writer_task = tokio::spawn(run_consumer(state_writer, writer_rx));

    tracing::info!(log = %log.path().display(), last_id, "ingesting snapshots from stdin");
    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // The feed is supposed to deliver validated snapshots; anything
        // else is logged and dropped before it can reach the log.
        if let Err(err) = serde_json::from_str::<GameState>(trimmed) {
            tracing::warn!("discarding invalid snapshot: {err}");
            continue;
        }
        writer_handle.send(trimmed.to_string());
    }

    // Drain in dependency order: all pending appends first, so their
    // notifications are queued ahead of the updater's sentinel.
    tracing::info!("snapshot feed closed; shutting down");
    writer_handle.stop();
    writer_task.await?;
    updater_handle.stop();
    updater_task.await?;
    Ok(())
}
