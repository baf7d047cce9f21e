//! Write side of the derived ratings store.
//!
//! A single SQLite file owned by the update pipeline. Incremental batches
//! run inside one transaction obtained from [`SkillDb::begin`]; the
//! operation functions in this module take a plain connection so they
//! compose inside or outside a transaction (`tx.as_mut()`).

use crate::{
    model::{PlayerId, Round, RoundId, RoundStats, SeasonId, SeasonList, SkillHistory, TeamId},
    rating::Rating,
};
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use itertools::Itertools;
use sqlx::{
    migrate, query, query_as,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePoolOptions},
    Connection, Transaction,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

#[derive(Debug)]
pub struct SkillDb {
    conn: SqliteConnection,
}

impl SkillDb {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        Self::new(
            SqliteConnectOptions::default()
                .filename(path)
                .create_if_missing(true),
        )
        .await
    }

    pub async fn memory() -> anyhow::Result<Self> {
        Self::new(Default::default()).await
    }

    async fn new(opt: SqliteConnectOptions) -> anyhow::Result<Self> {
        // Run migrations through a single-connection pool rather than
        // against `&mut SqliteConnection` directly: the migrator's
        // pool-backed future is `Send`, which the `&mut`-borrow future is
        // not under a `Send`-bounded caller (the updater is spawned on a
        // multi-thread runtime). Capping the pool at one connection means
        // the connection detached below is exactly the one migrated, which
        // keeps the shared-nothing in-memory database correct.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opt)
            .await?;
        migrate!("db/migrations").run(&pool).await?;
        let conn = pool.acquire().await?.detach();
        Ok(Self { conn })
    }

    /// Flush and release the underlying file, e.g. before a rename swap.
    pub async fn close(self) -> anyhow::Result<()> {
        self.conn.close().await?;
        Ok(())
    }

    /// Begin a transaction covering one pipeline unit of work.
    pub async fn begin(&mut self) -> anyhow::Result<Transaction<'_, Sqlite>> {
        Ok(self.conn.begin().await?)
    }

    /// Highest log id folded into this store; 0 before anything was.
    pub async fn watermark(&mut self) -> anyhow::Result<u64> {
        watermark(&mut self.conn).await
    }

    /// Current overall belief for every known player.
    pub async fn overall_ratings(&mut self) -> anyhow::Result<HashMap<PlayerId, Rating>> {
        overall_ratings(&mut self.conn).await
    }

    /// Current belief for every player rated in `season_id`.
    pub async fn season_ratings(
        &mut self,
        season_id: SeasonId,
    ) -> anyhow::Result<HashMap<PlayerId, Rating>> {
        season_ratings_for(&mut self.conn, season_id).await
    }

    pub async fn round_count(&mut self) -> anyhow::Result<u64> {
        let (count,): (i64,) = query_as("SELECT count(*) FROM rounds")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(count as u64)
    }

    /// A player's overall belief after each round they took part in.
    pub async fn overall_history(
        &mut self,
        player_id: PlayerId,
    ) -> anyhow::Result<Vec<SkillHistory>> {
        let rows: Vec<(i64, f64, f64)> = query_as(
            "SELECT round_id, skill_mean, skill_stdev FROM overall_skill_history
             WHERE player_id = $1 ORDER BY round_id",
        )
        .bind(i64::from(player_id))
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(round_id, mu, sigma)| SkillHistory {
                round_id: round_id.into(),
                player_id,
                rating: Rating::new(mu, sigma),
            })
            .collect())
    }

    pub async fn player_names(&mut self) -> anyhow::Result<HashMap<PlayerId, String>> {
        let rows: Vec<(i64, String)> = query_as("SELECT player_id, name FROM players")
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(player_id, name)| (PlayerId::from(player_id), name))
            .collect())
    }
}

/// A round ready for insertion, before a round id exists.
#[derive(Clone, Debug)]
pub struct NewRound {
    pub log_id: u64,
    pub created_at: DateTime<Utc>,
    pub season_id: SeasonId,
    pub winner: TeamId,
    pub loser: TeamId,
    pub mvp: Option<PlayerId>,
}

/// Mirror the configured seasons into the store so the read side does not
/// need the config file. Season ids are stable, so existing rows are
/// updated in place (an upsert, not a REPLACE: rounds may already
/// reference the season row).
pub async fn replace_seasons(
    conn: &mut SqliteConnection,
    seasons: &SeasonList,
) -> anyhow::Result<()> {
    for (season_id, start) in seasons.iter() {
        query(
            "INSERT INTO seasons (season_id, start_date) VALUES ($1, $2)
             ON CONFLICT (season_id) DO UPDATE SET start_date = excluded.start_date",
        )
        .bind(i64::from(season_id))
        .bind(start)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Insert players or refresh their display names, leaving skills alone.
pub async fn upsert_players(
    conn: &mut SqliteConnection,
    names: &HashMap<PlayerId, String>,
) -> anyhow::Result<()> {
    for (player_id, name) in names {
        query(
            "INSERT INTO players (player_id, name) VALUES ($1, $2)
             ON CONFLICT (player_id) DO UPDATE SET name = excluded.name",
        )
        .bind(i64::from(*player_id))
        .bind(name.as_str())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// All registered teams with their member lists (sorted by player id).
pub async fn get_all_teams(
    conn: &mut SqliteConnection,
) -> anyhow::Result<HashMap<TeamId, Vec<PlayerId>>> {
    let rows: Vec<(i64, i64)> =
        query_as("SELECT team_id, player_id FROM team_membership ORDER BY team_id, player_id")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(team_id, player_id)| (TeamId::from(team_id), PlayerId::from(player_id)))
        .into_group_map())
}

/// Team ids for every member set, registering combinations not seen
/// before. Teams are append-only: an existing combination is reused, a new
/// one gets a fresh id. Member lists must be sorted and deduplicated.
pub async fn ensure_teams(
    conn: &mut SqliteConnection,
    member_sets: &BTreeSet<Vec<PlayerId>>,
) -> anyhow::Result<HashMap<Vec<PlayerId>, TeamId>> {
    let mut memberships: HashMap<Vec<PlayerId>, TeamId> = get_all_teams(&mut *conn)
        .await?
        .into_iter()
        .map(|(team_id, members)| (members, team_id))
        .collect();

    for members in member_sets {
        if memberships.contains_key(members) {
            continue;
        }
        let (team_id,): (i64,) = query_as("INSERT INTO teams DEFAULT VALUES RETURNING team_id")
            .fetch_one(&mut *conn)
            .await?;
        for player_id in members {
            query("INSERT INTO team_membership (team_id, player_id) VALUES ($1, $2)")
                .bind(team_id)
                .bind(i64::from(*player_id))
                .execute(&mut *conn)
                .await?;
        }
        tracing::debug!(team_id, players = members.len(), "registered new team");
        memberships.insert(members.clone(), TeamId::from(team_id));
    }
    Ok(memberships)
}

/// Insert rounds in order, returning their assigned ids.
pub async fn insert_rounds(
    conn: &mut SqliteConnection,
    rounds: &[NewRound],
) -> anyhow::Result<Vec<RoundId>> {
    let mut round_ids = Vec::with_capacity(rounds.len());
    for round in rounds {
        let (round_id,): (i64,) = query_as(
            "INSERT INTO rounds (season_id, log_id, created_at, winner, loser, mvp)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING round_id",
        )
        .bind(i64::from(round.season_id))
        .bind(round.log_id as i64)
        .bind(round.created_at)
        .bind(i64::from(round.winner))
        .bind(i64::from(round.loser))
        .bind(round.mvp.map(i64::from))
        .fetch_one(&mut *conn)
        .await?;
        round_ids.push(RoundId::from(round_id));
    }
    Ok(round_ids)
}

pub async fn insert_round_stats(
    conn: &mut SqliteConnection,
    round_id: RoundId,
    stats: &BTreeMap<PlayerId, RoundStats>,
) -> anyhow::Result<()> {
    for (player_id, stat) in stats {
        query(
            "INSERT INTO round_stats (round_id, player_id, kills, assists, damage, survived)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(i64::from(round_id))
        .bind(i64::from(*player_id))
        .bind(stat.kills)
        .bind(stat.assists)
        .bind(stat.damage)
        .bind(stat.survived)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Rounds with ids in `range` (inclusive), in round order.
pub async fn rounds_in(
    conn: &mut SqliteConnection,
    range: (RoundId, RoundId),
) -> anyhow::Result<Vec<Round>> {
    let rounds: Vec<Round> = query_as::<_, (i64, DateTime<Utc>, i64, i64, i64, Option<i64>)>(
        "SELECT round_id, created_at, season_id, winner, loser, mvp
         FROM rounds WHERE round_id BETWEEN $1 AND $2 ORDER BY round_id",
    )
    .bind(i64::from(range.0))
    .bind(i64::from(range.1))
    .fetch(&mut *conn)
    .map_ok(|(round_id, created_at, season_id, winner, loser, mvp)| Round {
        round_id: round_id.into(),
        created_at,
        season_id: season_id.into(),
        winner: winner.into(),
        loser: loser.into(),
        mvp: mvp.map(PlayerId::from),
    })
    .try_collect()
    .await?;
    Ok(rounds)
}

pub async fn overall_ratings(
    conn: &mut SqliteConnection,
) -> anyhow::Result<HashMap<PlayerId, Rating>> {
    let rows: Vec<(i64, f64, f64)> =
        query_as("SELECT player_id, skill_mean, skill_stdev FROM players")
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(player_id, mu, sigma)| (PlayerId::from(player_id), Rating::new(mu, sigma)))
        .collect())
}

pub async fn update_overall_ratings(
    conn: &mut SqliteConnection,
    ratings: &HashMap<PlayerId, Rating>,
) -> anyhow::Result<()> {
    for (player_id, rating) in ratings {
        query("UPDATE players SET skill_mean = $1, skill_stdev = $2 WHERE player_id = $3")
            .bind(rating.mu)
            .bind(rating.sigma)
            .bind(i64::from(*player_id))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn append_overall_history(
    conn: &mut SqliteConnection,
    history: &[SkillHistory],
) -> anyhow::Result<()> {
    for entry in history {
        query(
            "REPLACE INTO overall_skill_history (player_id, round_id, skill_mean, skill_stdev)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(i64::from(entry.player_id))
        .bind(i64::from(entry.round_id))
        .bind(entry.rating.mu)
        .bind(entry.rating.sigma)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn season_ratings_for(
    conn: &mut SqliteConnection,
    season_id: SeasonId,
) -> anyhow::Result<HashMap<PlayerId, Rating>> {
    let rows: Vec<(i64, f64, f64)> =
        query_as("SELECT player_id, mean, stdev FROM skills WHERE season_id = $1")
            .bind(i64::from(season_id))
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(player_id, mu, sigma)| (PlayerId::from(player_id), Rating::new(mu, sigma)))
        .collect())
}

pub async fn replace_season_ratings(
    conn: &mut SqliteConnection,
    season_id: SeasonId,
    ratings: &HashMap<PlayerId, Rating>,
) -> anyhow::Result<()> {
    for (player_id, rating) in ratings {
        query("REPLACE INTO skills (player_id, season_id, mean, stdev) VALUES ($1, $2, $3, $4)")
            .bind(i64::from(*player_id))
            .bind(i64::from(season_id))
            .bind(rating.mu)
            .bind(rating.sigma)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn append_season_history(
    conn: &mut SqliteConnection,
    history: &[SkillHistory],
) -> anyhow::Result<()> {
    for entry in history {
        query(
            "REPLACE INTO season_skill_history (player_id, round_id, skill_mean, skill_stdev)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(i64::from(entry.player_id))
        .bind(i64::from(entry.round_id))
        .bind(entry.rating.mu)
        .bind(entry.rating.sigma)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn watermark(conn: &mut SqliteConnection) -> anyhow::Result<u64> {
    let row: Option<(i64,)> =
        query_as("SELECT last_processed_log_id FROM log_progress WHERE log_progress_id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(id,)| id as u64).unwrap_or(0))
}

pub async fn save_watermark(conn: &mut SqliteConnection, max_log_id: u64) -> anyhow::Result<()> {
    query(
        "REPLACE INTO log_progress (log_progress_id, updated_at, last_processed_log_id)
         VALUES (1, CURRENT_TIMESTAMP, $1)",
    )
    .bind(max_log_id as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
