//! Turning the raw snapshot stream into completed rounds.
//!
//! A round completes when consecutive snapshots transition the round phase
//! from "live" to "over" with a decided winner. Everything else — warmup
//! ticks, freezetime, repeated "over" states — is ignored. Individual bad
//! snapshots are skipped with a warning so one corrupt entry never blocks
//! the rest of a batch.

use chrono::{DateTime, Utc};
use scrimrank_core::{
    model::{PlayerId, RoundStats, SeasonId, SeasonList},
    snapshot::{GameState, PlayerSnapshot},
};
use scrimrank_statelog::LogEntry;
use std::collections::{BTreeMap, HashMap};

/// A completed round pulled out of the snapshot stream, before team ids
/// are assigned by the store.
#[derive(Clone, Debug)]
pub struct ExtractedRound {
    pub log_id: u64,
    pub created_at: DateTime<Utc>,
    pub season_id: SeasonId,
    /// Winning side's player ids, sorted.
    pub winner: Vec<PlayerId>,
    /// Losing side's player ids, sorted.
    pub loser: Vec<PlayerId>,
    pub mvp: Option<PlayerId>,
    pub stats: BTreeMap<PlayerId, RoundStats>,
    /// Whether this round ended its match.
    pub last_round: bool,
}

/// Everything extracted from one log range.
#[derive(Clone, Debug, Default)]
pub struct Extraction {
    pub rounds: Vec<ExtractedRound>,
    /// Display names of every player seen in a completed round.
    pub player_names: HashMap<PlayerId, String>,
    /// Highest log id scanned, whether or not it completed a round.
    pub max_log_id: u64,
}

/// Scan `entries` (in log order) for round completions.
pub fn extract_rounds(
    entries: impl IntoIterator<Item = LogEntry>,
    seasons: &SeasonList,
) -> Extraction {
    let mut extraction = Extraction::default();
    let mut previous: Option<GameState> = None;

    for entry in entries {
        extraction.max_log_id = extraction.max_log_id.max(entry.id);
        let state = match GameState::from_json(&entry.payload) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(log_id = entry.id, "skipping malformed snapshot: {err}");
                continue;
            }
        };

        if let Some(round) = round_completion(previous.as_ref(), &state, entry.id, seasons) {
            for (player_id, player) in connected_players(&state) {
                extraction
                    .player_names
                    .insert(*player_id, player.name.clone());
            }
            extraction.rounds.push(round);
        }
        previous = Some(state);
    }

    compute_assists(&mut extraction.rounds);
    extraction
}

fn connected_players(state: &GameState) -> impl Iterator<Item = (&PlayerId, &PlayerSnapshot)> {
    state
        .players
        .iter()
        .filter(|(_, player)| player.name != "unconnected")
}

fn round_completion(
    previous: Option<&GameState>,
    state: &GameState,
    log_id: u64,
    seasons: &SeasonList,
) -> Option<ExtractedRound> {
    if state.round_phase != "over" {
        return None;
    }
    let previous = match previous {
        Some(previous) if previous.round_phase == "live" => previous,
        // Repeated "over" snapshots of the same round, or no prior data.
        _ => return None,
    };
    let win_team = state.win_team.as_deref()?;

    let mut sides: BTreeMap<&str, Vec<PlayerId>> = BTreeMap::new();
    for (player_id, player) in connected_players(state) {
        sides.entry(player.team.as_str()).or_default().push(*player_id);
    }
    if sides.len() != 2 {
        tracing::warn!(
            log_id,
            sides = sides.len(),
            "dropping round without exactly two sides"
        );
        return None;
    }
    let Some(winner) = sides.remove(win_team) else {
        tracing::warn!(log_id, win_team, "dropping round: winning side has no players");
        return None;
    };
    let (_, loser) = sides.pop_first()?;

    let Some(created_at) = DateTime::from_timestamp(state.timestamp, 0) else {
        tracing::warn!(log_id, timestamp = state.timestamp, "skipping snapshot with invalid timestamp");
        return None;
    };
    let Some(season_id) = seasons.season_of(created_at) else {
        tracing::warn!(log_id, %created_at, "dropping round before the first season start");
        return None;
    };

    let stats = connected_players(state)
        .map(|(player_id, player)| {
            (
                *player_id,
                RoundStats {
                    kills: player.state.round_kills,
                    // Cumulative for now; compute_assists turns this into a
                    // per-round delta once the whole batch is collected.
                    assists: player.match_stats.assists,
                    damage: player.state.round_damage,
                    survived: player.state.health > 0,
                },
            )
        })
        .collect();

    Some(ExtractedRound {
        log_id,
        created_at,
        season_id,
        winner,
        loser,
        mvp: parse_mvp(previous, state),
        stats,
        last_round: state.map_phase == "gameover",
    })
}

/// The player whose cumulative MVP counter strictly increased across the
/// round. No increase means no MVP; that is a valid round, not an error.
fn parse_mvp(previous: &GameState, state: &GameState) -> Option<PlayerId> {
    connected_players(state).find_map(|(player_id, player)| {
        let before = previous.players.get(player_id)?.match_stats.mvps;
        (player.match_stats.mvps > before).then_some(*player_id)
    })
}

/// Rewrite cumulative match-assist counters into per-round deltas.
///
/// Assumes a player is not in two concurrent matches. The running
/// counters reset at match boundaries, so the first round of each match
/// counts from zero again.
fn compute_assists(rounds: &mut [ExtractedRound]) {
    let mut last_assists: HashMap<PlayerId, i64> = HashMap::new();
    for round in rounds {
        for (player_id, stats) in &mut round.stats {
            let cumulative = stats.assists;
            stats.assists = cumulative - last_assists.get(player_id).copied().unwrap_or(0);
            last_assists.insert(*player_id, cumulative);
        }
        if round.last_round {
            last_assists.clear();
        }
    }
}
