//! Raw game-state snapshots as delivered by the ingestion adapter.
//!
//! One snapshot per observed tick, already validated and deserialized
//! upstream; the log stores them as opaque JSON blobs and the extractor
//! decodes them back into these types. Phase and side labels are open
//! vocabularies (only "live"/"over" and the winning side label matter), so
//! they stay plain strings rather than closed enums.

use crate::model::PlayerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One opaque snapshot of a live match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameState {
    /// Round lifecycle phase, e.g. "freezetime", "live", "over".
    pub round_phase: String,
    /// Match lifecycle phase; "gameover" marks the final round of a match.
    #[serde(default)]
    pub map_phase: String,
    /// Side label of the winning team, present once the round is decided.
    #[serde(default)]
    pub win_team: Option<String>,
    /// Capture time, unix seconds.
    pub timestamp: i64,
    /// Connected players keyed by player id.
    #[serde(default)]
    pub players: BTreeMap<PlayerId, PlayerSnapshot>,
}

impl GameState {
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub name: String,
    /// Side label, e.g. "CT" or "T".
    pub team: String,
    /// Counters scoped to the current round.
    #[serde(default)]
    pub state: PlayerRoundState,
    /// Counters cumulative over the whole match.
    #[serde(default)]
    pub match_stats: MatchStats,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PlayerRoundState {
    pub health: i64,
    pub round_kills: i64,
    pub round_damage: i64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MatchStats {
    pub assists: i64,
    pub mvps: i64,
}
