//! Startup configuration files for the pipeline.

use anyhow::{ensure, Context};
use chrono::{DateTime, Utc};
use scrimrank_core::model::SeasonList;
use serde::Deserialize;
use std::path::Path;

/// ```toml
/// season_starts = [
///     "2023-09-01T00:00:00Z",
///     "2024-03-01T00:00:00Z",
/// ]
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeasonsFile {
    season_starts: Vec<DateTime<Utc>>,
}

/// Load the season-start list. Rounds observed before the first start are
/// invalid, so an empty list is rejected outright.
pub fn load_seasons(path: &Path) -> anyhow::Result<SeasonList> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seasons file {}", path.display()))?;
    let file: SeasonsFile = toml::from_str(&text)
        .with_context(|| format!("invalid seasons file {}", path.display()))?;
    ensure!(
        !file.season_starts.is_empty(),
        "seasons file {} lists no season starts",
        path.display()
    );
    Ok(SeasonList::new(file.season_starts))
}
