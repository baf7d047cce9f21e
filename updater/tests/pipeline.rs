//! End-to-end pipeline tests over a real log file and a real store.

use chrono::{TimeZone, Utc};
use scrimrank_core::{
    db::SkillDb,
    model::{PlayerId, SeasonId, SeasonList, TAU},
    snapshot::{GameState, MatchStats, PlayerRoundState, PlayerSnapshot},
};
use scrimrank_statelog::{GameStateLog, LogEntry};
use scrimrank_updater::{
    channel, recalculate, remap::PlayerConfig, run_consumer, Updater, UpdaterMessage,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const T0: i64 = 1_700_000_000;

fn one_season() -> SeasonList {
    SeasonList::new(vec![Utc.timestamp_opt(T0, 0).unwrap()])
}

fn two_seasons() -> SeasonList {
    // The second season starts between log ids 9 and 10.
    SeasonList::new(vec![
        Utc.timestamp_opt(T0, 0).unwrap(),
        Utc.timestamp_opt(T0 + 10, 0).unwrap(),
    ])
}

fn player(name: &str, team: &str, mvps: i64) -> PlayerSnapshot {
    PlayerSnapshot {
        name: name.to_string(),
        team: team.to_string(),
        state: PlayerRoundState {
            health: 100,
            round_kills: 1,
            round_damage: 80,
        },
        match_stats: MatchStats { assists: 0, mvps },
    }
}

fn game_state(round_phase: &str, win_team: Option<&str>, timestamp: i64, mvps_p1: i64) -> GameState {
    let mut players = BTreeMap::new();
    players.insert(PlayerId::from(1), player("alice", "CT", mvps_p1));
    players.insert(PlayerId::from(2), player("bob", "CT", 0));
    players.insert(PlayerId::from(3), player("carol", "T", 0));
    players.insert(PlayerId::from(4), player("dave", "T", 0));
    GameState {
        round_phase: round_phase.to_string(),
        map_phase: "live".to_string(),
        win_team: win_team.map(str::to_string),
        timestamp,
        players,
    }
}

fn entry(id: u64, state: &GameState) -> LogEntry {
    LogEntry {
        id,
        created_at: state.timestamp,
        payload: state.to_json().unwrap(),
    }
}

/// Append `rounds` completed rounds (two log entries each). CT wins every
/// round except multiples of three, and alice's MVP counter tracks CT
/// wins. Returns the highest log id written.
fn write_rounds(log: &GameStateLog, rounds: usize) -> u64 {
    let mut writer = log.writer(None).unwrap();
    let mut id = 0u64;
    let mut mvps_p1 = 0i64;
    for k in 0..rounds {
        let ct_wins = k % 3 != 0;
        id += 1;
        writer
            .append(&entry(id, &game_state("live", None, T0 + id as i64, mvps_p1)))
            .unwrap();
        if ct_wins {
            mvps_p1 += 1;
        }
        id += 1;
        let win_team = if ct_wins { "CT" } else { "T" };
        writer
            .append(&entry(
                id,
                &game_state("over", Some(win_team), T0 + id as i64, mvps_p1),
            ))
            .unwrap();
    }
    writer.flush().unwrap();
    id
}

async fn overall(db_path: &Path) -> std::collections::HashMap<PlayerId, scrimrank_core::rating::Rating> {
    let mut db = SkillDb::open(db_path).await.unwrap();
    db.overall_ratings().await.unwrap()
}

#[tokio::test]
async fn one_round_moves_equal_priors_apart() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let max_id = write_rounds(&log, 1);

    let db_path = dir.path().join("skill.db");
    recalculate::process_range(&log, &db_path, &one_season(), &PlayerConfig::default(), max_id)
        .await
        .unwrap();

    // Round zero is a T win: carol and dave rise, alice and bob fall.
    let ratings = overall(&db_path).await;
    for winner in [3, 4] {
        let rating = ratings[&PlayerId::from(winner)];
        assert!(rating.mu > 1000.0);
        assert!(rating.sigma <= 250.0 + TAU);
    }
    for loser in [1, 2] {
        let rating = ratings[&PlayerId::from(loser)];
        assert!(rating.mu < 1000.0);
        assert!(rating.sigma <= 250.0 + TAU);
    }
}

#[tokio::test]
async fn incremental_batches_equal_one_shot_processing() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let max_id = write_rounds(&log, 6);
    let seasons = two_seasons();
    let players = PlayerConfig::default();

    let one_shot = dir.path().join("one_shot.db");
    recalculate::process_range(&log, &one_shot, &seasons, &players, max_id)
        .await
        .unwrap();

    let stepwise = dir.path().join("stepwise.db");
    for id in 1..=max_id {
        recalculate::process_range(&log, &stepwise, &seasons, &players, id)
            .await
            .unwrap();
    }

    assert_eq!(overall(&one_shot).await, overall(&stepwise).await);

    let mut one_shot_db = SkillDb::open(&one_shot).await.unwrap();
    let mut stepwise_db = SkillDb::open(&stepwise).await.unwrap();
    assert_eq!(
        one_shot_db.round_count().await.unwrap(),
        stepwise_db.round_count().await.unwrap()
    );
    for season in [SeasonId::from(1), SeasonId::from(2)] {
        assert_eq!(
            one_shot_db.season_ratings(season).await.unwrap(),
            stepwise_db.season_ratings(season).await.unwrap()
        );
    }
    assert_eq!(
        one_shot_db
            .overall_history(PlayerId::from(1))
            .await
            .unwrap()
            .len(),
        6
    );
}

#[tokio::test]
async fn full_rebuild_equals_incremental_processing() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let max_id = write_rounds(&log, 6);
    let seasons = two_seasons();
    let players = PlayerConfig::default();

    let incremental = dir.path().join("incremental.db");
    for id in 1..=max_id {
        recalculate::process_range(&log, &incremental, &seasons, &players, id)
            .await
            .unwrap();
    }

    let rebuilt = dir.path().join("rebuilt.db");
    recalculate::rebuild(&log, &rebuilt, &seasons, &players)
        .await
        .unwrap();

    assert_eq!(overall(&incremental).await, overall(&rebuilt).await);

    let mut rebuilt_db = SkillDb::open(&rebuilt).await.unwrap();
    assert_eq!(rebuilt_db.watermark().await.unwrap(), max_id);
    assert_eq!(rebuilt_db.round_count().await.unwrap(), 6);
    for season in [SeasonId::from(1), SeasonId::from(2)] {
        let mut incremental_db = SkillDb::open(&incremental).await.unwrap();
        assert_eq!(
            incremental_db.season_ratings(season).await.unwrap(),
            rebuilt_db.season_ratings(season).await.unwrap()
        );
    }
}

#[tokio::test]
async fn duplicate_and_stale_notifications_are_noops() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let max_id = write_rounds(&log, 4);
    let seasons = one_season();
    let players = PlayerConfig::default();
    let db_path = dir.path().join("skill.db");

    recalculate::process_range(&log, &db_path, &seasons, &players, max_id)
        .await
        .unwrap();
    let before = overall(&db_path).await;

    // The exact same notification, then a stale one.
    recalculate::process_range(&log, &db_path, &seasons, &players, max_id)
        .await
        .unwrap();
    recalculate::process_range(&log, &db_path, &seasons, &players, 2)
        .await
        .unwrap();

    assert_eq!(overall(&db_path).await, before);
    let mut db = SkillDb::open(&db_path).await.unwrap();
    assert_eq!(db.round_count().await.unwrap(), 4);
    assert_eq!(db.watermark().await.unwrap(), max_id);
}

#[tokio::test]
async fn watermark_resumes_across_log_growth() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let seasons = one_season();
    let players = PlayerConfig::default();
    let db_path = dir.path().join("skill.db");

    let first_batch = write_rounds(&log, 2);
    recalculate::process_range(&log, &db_path, &seasons, &players, first_batch)
        .await
        .unwrap();

    // More rounds arrive later; only the new range is folded in.
    let max_id = write_rounds(&log, 3);
    recalculate::process_range(&log, &db_path, &seasons, &players, max_id)
        .await
        .unwrap();

    let mut db = SkillDb::open(&db_path).await.unwrap();
    assert_eq!(db.round_count().await.unwrap(), 5);
    assert_eq!(db.watermark().await.unwrap(), max_id);
}

#[tokio::test]
async fn failed_rebuild_leaves_the_live_store_authoritative() {
    let dir = tempdir().unwrap();
    let log = GameStateLog::new(dir.path().join("statelog.bin"));
    let max_id = write_rounds(&log, 3);
    let seasons = one_season();
    let players = PlayerConfig::default();
    let db_path = dir.path().join("skill.db");

    recalculate::process_range(&log, &db_path, &seasons, &players, max_id)
        .await
        .unwrap();
    let before = overall(&db_path).await;

    // Occupy the staging path with a directory so the rebuild cannot
    // create its scratch store.
    std::fs::create_dir(dir.path().join("skill.db.new")).unwrap();
    let result = recalculate::rebuild(&log, &db_path, &seasons, &players).await;
    assert!(result.is_err());

    assert_eq!(overall(&db_path).await, before);
    let mut db = SkillDb::open(&db_path).await.unwrap();
    assert_eq!(db.round_count().await.unwrap(), 3);
    assert_eq!(db.watermark().await.unwrap(), max_id);
}

#[tokio::test]
async fn updater_worker_drains_notifications_and_shuts_down() {
    let dir = tempdir().unwrap();
    let log = Arc::new(GameStateLog::new(dir.path().join("statelog.bin")));
    let max_id = write_rounds(&log, 6);
    let db_path = dir.path().join("skill.db");

    let updater = Updater::new(
        log.clone(),
        &db_path,
        one_season(),
        PlayerConfig::default(),
    );
    let (handle, rx) = channel();
    let worker = tokio::spawn(run_consumer(updater, rx));

    handle.send(UpdaterMessage::Process { max_id: 4 });
    handle.send(UpdaterMessage::Process { max_id });
    handle.stop();
    worker.await.unwrap();

    let mut db = SkillDb::open(&db_path).await.unwrap();
    assert_eq!(db.round_count().await.unwrap(), 6);
    assert_eq!(db.watermark().await.unwrap(), max_id);
}

#[tokio::test]
async fn recalculate_message_wins_over_process_in_a_batch() {
    let dir = tempdir().unwrap();
    let log = Arc::new(GameStateLog::new(dir.path().join("statelog.bin")));
    let max_id = write_rounds(&log, 4);
    let db_path = dir.path().join("skill.db");
    let seasons = one_season();

    // Seed the live store, then ask for a rebuild alongside new data.
    recalculate::process_range(&log, &db_path, &seasons, &PlayerConfig::default(), 2)
        .await
        .unwrap();

    let updater = Updater::new(log.clone(), &db_path, seasons, PlayerConfig::default());
    let (handle, rx) = channel();
    let worker = tokio::spawn(run_consumer(updater, rx));

    handle.send(UpdaterMessage::Process { max_id });
    handle.send(UpdaterMessage::Recalculate);
    handle.stop();
    worker.await.unwrap();

    let mut db = SkillDb::open(&db_path).await.unwrap();
    assert_eq!(db.round_count().await.unwrap(), 4);
    assert_eq!(db.watermark().await.unwrap(), max_id);

    // MVP bookkeeping survives the rebuild: alice took every CT win.
    let names = db.player_names().await.unwrap();
    assert_eq!(names[&PlayerId::from(1)], "alice");
}
