use crate::rating::Rating;
use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Prior mean of a fresh skill belief.
pub const SKILL_MEAN: f64 = 1000.0;
/// Prior standard deviation of a fresh skill belief.
pub const SKILL_STDEV: f64 = SKILL_MEAN / 4.0;
/// Performance noise: how far a single round's performance may stray from
/// latent skill.
pub const BETA: f64 = SKILL_STDEV * 2.0;
/// Dynamics: variance added to every participant after each round, so
/// beliefs never freeze solid.
pub const TAU: f64 = SKILL_STDEV / 100.0;

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    From,
    Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct PlayerId(i64);

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    From,
    Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct TeamId(i64);

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    From,
    Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct RoundId(i64);

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    From,
    Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct SeasonId(i64);

/// A completed match round as stored in the derived store.
#[derive(Clone, Debug)]
pub struct Round {
    pub round_id: RoundId,
    pub created_at: DateTime<Utc>,
    pub season_id: SeasonId,
    pub winner: TeamId,
    pub loser: TeamId,
    pub mvp: Option<PlayerId>,
}

/// Per-player performance counters for one round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub kills: i64,
    pub assists: i64,
    pub damage: i64,
    pub survived: bool,
}

/// Immutable audit record of a belief immediately after a round.
#[derive(Clone, Copy, Debug)]
pub struct SkillHistory {
    pub round_id: RoundId,
    pub player_id: PlayerId,
    pub rating: Rating,
}

/// Ordered season starts. A round belongs to the last season whose start
/// is not after the round; rounds before the first start have no season.
///
/// Season ids are 1-based positions in the sorted list, so the same file
/// always yields the same ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeasonList {
    starts: Vec<DateTime<Utc>>,
}

impl SeasonList {
    pub fn new(mut starts: Vec<DateTime<Utc>>) -> Self {
        starts.sort();
        starts.dedup();
        Self { starts }
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn season_of(&self, at: DateTime<Utc>) -> Option<SeasonId> {
        match self.starts.partition_point(|start| *start <= at) {
            0 => None,
            n => Some(SeasonId::from(n as i64)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeasonId, DateTime<Utc>)> + '_ {
        self.starts
            .iter()
            .enumerate()
            .map(|(index, start)| (SeasonId::from(index as i64 + 1), *start))
    }
}

/// Conservative skill estimate used for ranking: almost all of the belief
/// mass lies above it.
pub fn mmr(rating: &Rating) -> f64 {
    rating.mu - rating.sigma * 2.0
}

pub const SKILL_GROUP_SPACING: f64 = SKILL_STDEV * 0.5;

const SKILL_GROUP_NAMES: [&str; 13] = [
    "Bronze I",
    "Bronze II",
    "Bronze III",
    "Silver I",
    "Silver II",
    "Silver III",
    "Gold I",
    "Gold II",
    "Gold III",
    "Platinum",
    "Diamond",
    "Master",
    "Grandmaster",
];

/// Display tier for an MMR. The lowest tier is unbounded below; each later
/// tier starts one spacing higher.
pub fn skill_group_name(mmr: f64) -> &'static str {
    if mmr < SKILL_GROUP_SPACING {
        return SKILL_GROUP_NAMES[0];
    }
    let index = (mmr / SKILL_GROUP_SPACING) as usize;
    SKILL_GROUP_NAMES[index.min(SKILL_GROUP_NAMES.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn season_assignment_uses_last_start_not_after() {
        let seasons = SeasonList::new(vec![date(2024, 1, 1), date(2024, 7, 1)]);

        assert_eq!(seasons.season_of(date(2023, 12, 31)), None);
        assert_eq!(
            seasons.season_of(date(2024, 1, 1)),
            Some(SeasonId::from(1))
        );
        assert_eq!(
            seasons.season_of(date(2024, 6, 30)),
            Some(SeasonId::from(1))
        );
        assert_eq!(
            seasons.season_of(date(2025, 3, 1)),
            Some(SeasonId::from(2))
        );
    }

    #[test]
    fn season_starts_are_sorted_on_construction() {
        let seasons = SeasonList::new(vec![date(2024, 7, 1), date(2024, 1, 1)]);
        let ids: Vec<_> = seasons.iter().map(|(id, _)| i64::from(id)).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            seasons.season_of(date(2024, 2, 1)),
            Some(SeasonId::from(1))
        );
    }

    #[test]
    fn skill_groups_cover_the_whole_range() {
        assert_eq!(skill_group_name(-500.0), "Bronze I");
        assert_eq!(skill_group_name(0.0), "Bronze I");
        assert_eq!(skill_group_name(SKILL_GROUP_SPACING), "Bronze II");
        assert_eq!(skill_group_name(1_000_000.0), "Grandmaster");
    }

    #[test]
    fn default_rating_mmr_is_conservative() {
        let prior = Rating::default();
        assert_eq!(mmr(&prior), SKILL_MEAN - 2.0 * SKILL_STDEV);
    }
}
