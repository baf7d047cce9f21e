//! Incremental and full recalculation of the derived ratings store.
//!
//! [`process_range`] folds one half-open log range `(watermark, max_id]`
//! into the store inside a single transaction, so a crash leaves the
//! watermark either untouched (the range is redone later) or fully
//! advanced — never in between. [`rebuild`] replays the whole log into a
//! staging file and swaps it over the live store with a rename, so readers
//! only ever see a complete store.

use crate::extract::{self, ExtractedRound, Extraction};
use crate::remap::PlayerConfig;
use anyhow::Context;
use scrimrank_core::{
    db::{self, NewRound, SkillDb},
    model::{PlayerId, Round, RoundId, SeasonId, SeasonList, SkillHistory, TeamId},
    rating::{Rating, RatingModel},
};
use scrimrank_statelog::{GameStateLog, LogEntry};
use sqlx::sqlite::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Fold the rating model over `rounds` in order, starting from the
/// beliefs in `current` (unseen players start at the prior).
///
/// Returns the final belief of every player plus one history entry per
/// participant per round. Folding rounds one at a time, feeding each
/// result back in as `current`, yields exactly the same output as one
/// pass over all of them.
pub fn compute_player_skills<'a>(
    model: &RatingModel,
    rounds: impl IntoIterator<Item = &'a Round>,
    teams: &HashMap<TeamId, Vec<PlayerId>>,
    current: &HashMap<PlayerId, Rating>,
) -> anyhow::Result<(HashMap<PlayerId, Rating>, Vec<SkillHistory>)> {
    let mut ratings = current.clone();
    let mut history = Vec::new();

    for round in rounds {
        let winners = teams
            .get(&round.winner)
            .with_context(|| format!("round {} references unknown team {}", round.round_id, round.winner))?;
        let losers = teams
            .get(&round.loser)
            .with_context(|| format!("round {} references unknown team {}", round.round_id, round.loser))?;

        let winner_ratings: Vec<Rating> = winners
            .iter()
            .map(|player_id| ratings.get(player_id).copied().unwrap_or_default())
            .collect();
        let loser_ratings: Vec<Rating> = losers
            .iter()
            .map(|player_id| ratings.get(player_id).copied().unwrap_or_default())
            .collect();

        let (new_winners, new_losers) = model.rate(&winner_ratings, &loser_ratings);
        for (player_id, rating) in winners
            .iter()
            .zip(new_winners)
            .chain(losers.iter().zip(new_losers))
        {
            ratings.insert(*player_id, rating);
            history.push(SkillHistory {
                round_id: round.round_id,
                player_id: *player_id,
                rating,
            });
        }
    }
    Ok((ratings, history))
}

/// Persist extracted rounds: player names, team identities, round rows and
/// per-round stats. Returns the inserted round-id range.
async fn store_rounds(
    conn: &mut SqliteConnection,
    rounds: &[ExtractedRound],
    names: &HashMap<PlayerId, String>,
) -> anyhow::Result<Option<(RoundId, RoundId)>> {
    db::upsert_players(conn, names).await?;

    let member_sets: BTreeSet<Vec<PlayerId>> = rounds
        .iter()
        .flat_map(|round| [round.winner.clone(), round.loser.clone()])
        .collect();
    let team_ids = db::ensure_teams(conn, &member_sets).await?;

    let new_rounds: Vec<NewRound> = rounds
        .iter()
        .map(|round| {
            Ok(NewRound {
                log_id: round.log_id,
                created_at: round.created_at,
                season_id: round.season_id,
                winner: *team_ids
                    .get(&round.winner)
                    .context("winning team vanished during registration")?,
                loser: *team_ids
                    .get(&round.loser)
                    .context("losing team vanished during registration")?,
                mvp: round.mvp,
            })
        })
        .collect::<anyhow::Result<_>>()?;

    let round_ids = db::insert_rounds(conn, &new_rounds).await?;
    for (round, round_id) in rounds.iter().zip(&round_ids) {
        db::insert_round_stats(conn, *round_id, &round.stats).await?;
    }

    Ok(match (round_ids.first(), round_ids.last()) {
        (Some(first), Some(last)) => Some((*first, *last)),
        _ => None,
    })
}

/// Re-rate everyone affected by the rounds in `new_rounds`: one pass for
/// the overall chain, one independently-seeded pass per season.
async fn recalculate_ratings(
    conn: &mut SqliteConnection,
    model: &RatingModel,
    new_rounds: (RoundId, RoundId),
) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let all_rounds = db::rounds_in(conn, new_rounds).await?;
    let teams = db::get_all_teams(conn).await?;

    let current = db::overall_ratings(conn).await?;
    let (skills, history) = compute_player_skills(model, &all_rounds, &teams, &current)?;
    db::update_overall_ratings(conn, &skills).await?;
    db::append_overall_history(conn, &history).await?;

    let mut by_season: BTreeMap<SeasonId, Vec<&Round>> = BTreeMap::new();
    for round in &all_rounds {
        by_season.entry(round.season_id).or_default().push(round);
    }
    for (season_id, rounds) in &by_season {
        let current = db::season_ratings_for(conn, *season_id).await?;
        let (skills, history) =
            compute_player_skills(model, rounds.iter().copied(), &teams, &current)?;
        db::replace_season_ratings(conn, *season_id, &skills).await?;
        db::append_season_history(conn, &history).await?;
    }

    tracing::debug!(
        from = %new_rounds.0,
        to = %new_rounds.1,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recalculated ratings"
    );
    Ok(())
}

fn read_log_range(log: &GameStateLog, start_id: u64, end_id: u64) -> anyhow::Result<Vec<LogEntry>> {
    let mut reader = log.reader(None)?;
    let entries = reader
        .fetch(start_id, end_id)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn extract_and_remap(
    entries: Vec<LogEntry>,
    seasons: &SeasonList,
    players: &PlayerConfig,
) -> (Vec<ExtractedRound>, HashMap<PlayerId, String>, u64) {
    let Extraction {
        rounds,
        player_names,
        max_log_id,
    } = extract::extract_rounds(entries, seasons);
    (
        players.remap_rounds(rounds),
        players.remap_names(player_names),
        max_log_id,
    )
}

/// Incrementally fold the log range `(watermark, max_id]` into the store.
///
/// Duplicate or stale notifications are no-ops: anything at or below the
/// persisted watermark has already been folded in.
pub async fn process_range(
    log: &GameStateLog,
    db_path: &Path,
    seasons: &SeasonList,
    players: &PlayerConfig,
    max_id: u64,
) -> anyhow::Result<()> {
    let mut skill_db = SkillDb::open(db_path).await?;
    let watermark = skill_db.watermark().await?;
    if max_id <= watermark {
        tracing::debug!(watermark, max_id, "log range already processed");
        return Ok(());
    }

    // Round completion is a transition between consecutive snapshots, so
    // the scan starts at the watermark entry itself for context. A round
    // is attributed to the id of its "over" snapshot; anything at or
    // below the watermark was stored by an earlier batch and is filtered
    // back out.
    let entries = read_log_range(log, watermark, max_id)?;
    let (mut rounds, names, _) = extract_and_remap(entries, seasons, players);
    rounds.retain(|round| round.log_id > watermark);

    let model = RatingModel::default();
    let mut tx = skill_db.begin().await?;
    db::replace_seasons(tx.as_mut(), seasons).await?;
    if let Some(range) = store_rounds(tx.as_mut(), &rounds, &names).await? {
        recalculate_ratings(tx.as_mut(), &model, range).await?;
    }
    db::save_watermark(tx.as_mut(), max_id).await?;
    tx.commit().await?;

    tracing::info!(
        from = watermark + 1,
        to = max_id,
        rounds = rounds.len(),
        "incremental update committed"
    );
    Ok(())
}

/// Rebuild the whole store from the log into a staging file, then swap it
/// over the live store. On failure the live store is left untouched and
/// the rebuild can simply be retried.
pub async fn rebuild(
    log: &GameStateLog,
    db_path: &Path,
    seasons: &SeasonList,
    players: &PlayerConfig,
) -> anyhow::Result<()> {
    let staging = staging_path(db_path);
    // A leftover staging file from an earlier failed rebuild must not leak
    // stale rows into this one.
    match std::fs::remove_file(&staging) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to clear staging store {}", staging.display())
            })
        }
    }

    let mut skill_db = SkillDb::open(&staging).await?;
    let entries = {
        let mut reader = log.reader(None)?;
        reader.fetch_all(None)?.collect::<Result<Vec<_>, _>>()?
    };
    let (rounds, names, max_log_id) = extract_and_remap(entries, seasons, players);

    let model = RatingModel::default();
    let mut tx = skill_db.begin().await?;
    db::replace_seasons(tx.as_mut(), seasons).await?;
    if let Some(range) = store_rounds(tx.as_mut(), &rounds, &names).await? {
        recalculate_ratings(tx.as_mut(), &model, range).await?;
    }
    db::save_watermark(tx.as_mut(), max_log_id).await?;
    tx.commit().await?;
    skill_db.close().await?;

    std::fs::rename(&staging, db_path).with_context(|| {
        format!(
            "failed to swap rebuilt store {} into place",
            staging.display()
        )
    })?;
    tracing::info!(rounds = rounds.len(), max_log_id, "full rebuild swapped in");
    Ok(())
}

fn staging_path(db_path: &Path) -> PathBuf {
    let mut staging = db_path.as_os_str().to_owned();
    staging.push(".new");
    PathBuf::from(staging)
}
