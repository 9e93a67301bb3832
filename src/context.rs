use crate::config::PipelineSettings;
use crate::data_context::RaceData;
use crate::database::Database;
use crate::models::DateRange;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

/// History loaded ahead of a target window when no explicit start is given.
pub const DEFAULT_HISTORY_DAYS: i64 = 3653;
pub const DEFAULT_RACE_DATA_FILE: &str = "data/race-data.bin";
pub const DEFAULT_MODEL_PATH: &str = "models/racing_roi_model.txt";

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Connects when a URL is configured; a failed connection is logged, not fatal.
    pub async fn optional_database(&self) -> Option<Database> {
        match self.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => match Database::new(url).await {
                Ok(db) => Some(db),
                Err(error) => {
                    warn!(
                        "Database connection unavailable ({}). Continuing with local files only.",
                        error
                    );
                    None
                }
            },
            _ => {
                warn!("Database URL not provided. Using local files only.");
                None
            }
        }
    }

    /// Loads race records for `range`, from a snapshot when one is given.
    pub async fn race_data(&self, range: DateRange, data_file: Option<&Path>) -> Result<RaceData> {
        match data_file {
            Some(path) => {
                let data = RaceData::load_from_file(path)?;
                let before = data.races().len();
                let restricted = data
                    .restrict_to_date_range(Some(range.start), Some(range.end))
                    .with_context(|| format!("Snapshot {} has no races in {}", path.display(), range))?;
                info!(
                    "Restricted race data snapshot to {} ({} races -> {})",
                    range,
                    before,
                    restricted.races().len()
                );
                Ok(restricted)
            }
            None => {
                let db = self.database().await?;
                RaceData::load(&db, range).await
            }
        }
    }

    /// Raw settings map, from the snapshot when one is given.
    pub async fn settings_map(&self, data_file: Option<&Path>) -> Result<HashMap<String, String>> {
        match data_file {
            Some(path) => Ok(RaceData::load_from_file(path)?.settings().clone()),
            None => self.database().await?.get_all_settings().await,
        }
    }
}

/// Window to load so that `target` has its full history available.
pub fn history_range(target: DateRange, history_start: Option<NaiveDate>) -> Result<DateRange> {
    let start = history_start.unwrap_or(target.start - Duration::days(DEFAULT_HISTORY_DAYS));
    DateRange::new(start.min(target.start), target.end)
}

/// Pipeline settings carried by the loaded batch.
pub fn pipeline_settings(data: &RaceData) -> Result<PipelineSettings> {
    PipelineSettings::from_settings_map(data.settings()).context("Invalid pipeline settings")
}
