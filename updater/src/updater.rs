use crate::{recalculate, remap::PlayerConfig, QueueConsumer};
use anyhow::Context;
use scrimrank_core::model::SeasonList;
use scrimrank_statelog::GameStateLog;
use std::path::PathBuf;
use std::sync::Arc;

/// Notification consumed by the update pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdaterMessage {
    /// New log data is available up to `max_id`.
    Process { max_id: u64 },
    /// Discard the derived store and rebuild it from the whole log.
    Recalculate,
}

/// The update pipeline: a single worker folding new log ranges into the
/// derived ratings store.
///
/// Duplicate and reordered `Process` notifications are harmless: each
/// batch collapses to the highest notified id, and anything at or below
/// the persisted watermark is skipped.
pub struct Updater {
    log: Arc<GameStateLog>,
    db_path: PathBuf,
    seasons: SeasonList,
    players: PlayerConfig,
}

impl Updater {
    pub fn new(
        log: Arc<GameStateLog>,
        db_path: impl Into<PathBuf>,
        seasons: SeasonList,
        players: PlayerConfig,
    ) -> Self {
        Self {
            log,
            db_path: db_path.into(),
            seasons,
            players,
        }
    }
}

impl QueueConsumer for Updater {
    type Message = UpdaterMessage;

    async fn process_batch(&mut self, messages: Vec<UpdaterMessage>) -> anyhow::Result<()> {
        if messages.contains(&UpdaterMessage::Recalculate) {
            tracing::debug!("processing recalculate message");
            recalculate::rebuild(&self.log, &self.db_path, &self.seasons, &self.players).await
        } else {
            let max_id = messages
                .iter()
                .map(|message| match message {
                    UpdaterMessage::Process { max_id } => *max_id,
                    UpdaterMessage::Recalculate => 0,
                })
                .max()
                .context("empty updater batch")?;
            tracing::debug!(count = messages.len(), max_id, "processing log notifications");
            recalculate::process_range(
                &self.log,
                &self.db_path,
                &self.seasons,
                &self.players,
                max_id,
            )
            .await
        }
    }
}
