//! Player identity remapping: aliases and ignore lists.
//!
//! Some players show up under more than one id (second accounts, shared
//! seats); others should never be rated (spectator bots, one-off guests).
//! The mapping lives in a TOML file loaded once at startup and is applied
//! to extracted rounds before teams are registered, so the store only ever
//! sees canonical identities.

use crate::extract::ExtractedRound;
use anyhow::Context;
use scrimrank_core::model::PlayerId;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Alias and ignore configuration.
///
/// ```toml
/// ignored = [76561198000000009]
///
/// [[alias]]
/// canonical = 76561198000000001
/// duplicates = [76561198000000002, 76561198000000003]
/// ```
#[derive(Clone, Debug, Default)]
pub struct PlayerConfig {
    aliases: HashMap<PlayerId, PlayerId>,
    ignored: HashSet<PlayerId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PlayerConfigFile {
    ignored: Vec<PlayerId>,
    alias: Vec<AliasEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AliasEntry {
    canonical: PlayerId,
    duplicates: Vec<PlayerId>,
}

impl From<PlayerConfigFile> for PlayerConfig {
    fn from(file: PlayerConfigFile) -> Self {
        let mut aliases = HashMap::new();
        for entry in file.alias {
            for duplicate in entry.duplicates {
                aliases.insert(duplicate, entry.canonical);
            }
        }
        Self {
            aliases,
            ignored: file.ignored.into_iter().collect(),
        }
    }
}

impl PlayerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read player config {}", path.display()))?;
        let file: PlayerConfigFile = toml::from_str(&text)
            .with_context(|| format!("invalid player config {}", path.display()))?;
        Ok(file.into())
    }

    /// The id a player should be rated under, or `None` if ignored.
    pub fn canonical(&self, player_id: PlayerId) -> Option<PlayerId> {
        if self.ignored.contains(&player_id) {
            return None;
        }
        Some(self.aliases.get(&player_id).copied().unwrap_or(player_id))
    }

    /// Apply aliases and ignores to extracted rounds, dropping any round
    /// left without players on either side.
    pub fn remap_rounds(&self, rounds: Vec<ExtractedRound>) -> Vec<ExtractedRound> {
        rounds
            .into_iter()
            .filter_map(|round| self.remap_round(round))
            .collect()
    }

    fn remap_round(&self, mut round: ExtractedRound) -> Option<ExtractedRound> {
        round.winner = self.remap_members(&round.winner);
        round.loser = self.remap_members(&round.loser);
        if round.winner.is_empty() || round.loser.is_empty() {
            tracing::warn!(
                log_id = round.log_id,
                "dropping round emptied by player remapping"
            );
            return None;
        }
        round.stats = round
            .stats
            .into_iter()
            .filter_map(|(player_id, stats)| Some((self.canonical(player_id)?, stats)))
            .collect();
        round.mvp = round.mvp.and_then(|player_id| self.canonical(player_id));
        Some(round)
    }

    fn remap_members(&self, members: &[PlayerId]) -> Vec<PlayerId> {
        let mut remapped: Vec<PlayerId> = members
            .iter()
            .filter_map(|player_id| self.canonical(*player_id))
            .collect();
        remapped.sort_unstable();
        remapped.dedup();
        remapped
    }

    /// Canonicalize the keys of a name map, dropping ignored players.
    pub fn remap_names(&self, names: HashMap<PlayerId, String>) -> HashMap<PlayerId, String> {
        names
            .into_iter()
            .filter_map(|(player_id, name)| Some((self.canonical(player_id)?, name)))
            .collect()
    }
}
