use crate::database::Database;
use crate::errors::PipelineError;
use crate::models::{DateRange, Entrant, Horse, Payout, Race, RaceId};
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const RACE_DATA_SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_ALLOWED_SETTINGS: [&str; 15] = [
    "COHORT_BET_KIND",
    "COHORT_LOOKBACK_DAYS",
    "MIN_POPULARITY_FOR_TRAINING",
    "MIN_SAMPLES_CLOSING_SPEED",
    "MIN_SAMPLES_HORSE_COURSE",
    "MIN_SAMPLES_JOCKEY_COURSE",
    "MIN_SAMPLES_PACE_RECOVERY",
    "MIN_SAMPLES_SIRE_CONDITION",
    "MIN_SAMPLES_STAMINA_RANK",
    "STAMINA_DISTANCE_THRESHOLD",
    "STAMINA_HISTORY_MIN_DISTANCE",
    "TARGET_KIND",
    "TRAINING_END_DATE",
    "TRAINING_START_DATE",
    "VALIDATION_FRACTION",
];

#[derive(Serialize, Deserialize)]
struct RaceDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    races: Vec<Race>,
    entrants: Vec<Entrant>,
    payouts: Vec<Payout>,
    horses: Vec<Horse>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| SNAPSHOT_ALLOWED_SETTINGS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Immutable batch of race records. Cloning shares the underlying vectors.
#[derive(Clone)]
pub struct RaceData {
    races: Arc<Vec<Race>>,
    entrants: Arc<Vec<Entrant>>,
    payouts: Arc<Vec<Payout>>,
    horses: Arc<HashMap<String, Horse>>,
    settings: Arc<HashMap<String, String>>,
    race_index: Arc<HashMap<RaceId, usize>>,
    payout_index: Arc<HashMap<RaceId, usize>>,
    entrants_by_race: Arc<HashMap<RaceId, Vec<usize>>>,
}

impl RaceData {
    pub async fn load(db: &Database, range: DateRange) -> Result<Self> {
        info!("Loading race records for {} from database...", range);
        let (races, entrants, payouts, settings) = futures::try_join!(
            db.get_races(range),
            db.get_entrants(range),
            db.get_payouts(range),
            db.get_all_settings(),
        )?;

        let horse_ids: Vec<String> = entrants
            .iter()
            .map(|entrant| entrant.horse_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        info!("Loading pedigree records for {} horses...", horse_ids.len());
        let horses = db.get_horses(&horse_ids).await?;

        let data = Self::from_records(races, entrants, payouts, horses, settings)?;
        if data.races.is_empty() {
            return Err(anyhow!("No races found for {}", range));
        }
        info!(
            "Loaded {} races, {} entrants, {} payout records and {} horses",
            data.races.len(),
            data.entrants.len(),
            data.payouts.len(),
            data.horses.len()
        );
        Ok(data)
    }

    /// Builds a batch from already-parsed records. Races are ordered by date then id.
    pub fn from_records(
        mut races: Vec<Race>,
        entrants: Vec<Entrant>,
        payouts: Vec<Payout>,
        horses: Vec<Horse>,
        settings: HashMap<String, String>,
    ) -> Result<Self, PipelineError> {
        races.sort_by(|a, b| (a.date, a.id).cmp(&(b.date, b.id)));

        let mut race_index = HashMap::with_capacity(races.len());
        for (idx, race) in races.iter().enumerate() {
            if race.id.date()? != race.date {
                return Err(PipelineError::integrity(
                    format!("race {}", race.id),
                    format!("race date {} does not match its id", race.date),
                ));
            }
            if race_index.insert(race.id, idx).is_some() {
                return Err(PipelineError::integrity(
                    format!("race {}", race.id),
                    "duplicate race record",
                ));
            }
        }

        let mut payout_index = HashMap::with_capacity(payouts.len());
        for (idx, payout) in payouts.iter().enumerate() {
            if payout_index.insert(payout.race_id, idx).is_some() {
                return Err(PipelineError::integrity(
                    format!("race {}", payout.race_id),
                    "duplicate payout record",
                ));
            }
        }

        let mut entrants_by_race: HashMap<RaceId, Vec<usize>> = HashMap::new();
        let mut seen_entries = HashSet::with_capacity(entrants.len());
        for (idx, entrant) in entrants.iter().enumerate() {
            if !seen_entries.insert((entrant.race_id, entrant.horse_number)) {
                return Err(PipelineError::integrity(
                    format!("race {}", entrant.race_id),
                    format!("horse number {} entered twice", entrant.horse_number),
                ));
            }
            entrants_by_race.entry(entrant.race_id).or_default().push(idx);
        }
        for indices in entrants_by_race.values_mut() {
            indices.sort_by_key(|&idx| entrants[idx].horse_number);
        }

        let horses = horses
            .into_iter()
            .map(|horse| (horse.horse_id.clone(), horse))
            .collect();

        Ok(Self {
            races: Arc::new(races),
            entrants: Arc::new(entrants),
            payouts: Arc::new(payouts),
            horses: Arc::new(horses),
            settings: Arc::new(settings),
            race_index: Arc::new(race_index),
            payout_index: Arc::new(payout_index),
            entrants_by_race: Arc::new(entrants_by_race),
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading race data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open race data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: RaceDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != RACE_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Race data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                RACE_DATA_SNAPSHOT_VERSION
            ));
        }
        info!(
            "Snapshot generated at {} with {} races",
            snapshot.generated_at.format("%Y-%m-%d %H:%M"),
            snapshot.races.len()
        );

        Ok(Self::from_records(
            snapshot.races,
            snapshot.entrants,
            snapshot.payouts,
            snapshot.horses,
            snapshot.settings,
        )?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!("Unable to create race data snapshot at {}", path.display())
        })?;
        let mut writer = BufWriter::new(file);
        let mut horses: Vec<Horse> = self.horses.values().cloned().collect();
        horses.sort_by(|a, b| a.horse_id.cmp(&b.horse_id));
        let snapshot = RaceDataSnapshot {
            version: RACE_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            races: self.races.as_ref().clone(),
            entrants: self.entrants.as_ref().clone(),
            payouts: self.payouts.as_ref().clone(),
            horses,
            settings: scrub_snapshot_settings(self.settings.as_ref()),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize race data snapshot")?;
        writer
            .flush()
            .context("Failed to flush race data snapshot to disk")?;
        Ok(())
    }

    /// Keeps races dated within the bounds, together with their entrants and payouts.
    pub fn restrict_to_date_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Self> {
        let keep = |date: NaiveDate| {
            start.map_or(true, |start| date >= start) && end.map_or(true, |end| date <= end)
        };
        let races: Vec<Race> = self
            .races
            .iter()
            .filter(|race| keep(race.date))
            .cloned()
            .collect();
        if races.is_empty() {
            return Err(anyhow!(
                "No races remain after restricting race data to {} - {}",
                start.map_or("start".to_string(), |d| d.to_string()),
                end.map_or("end".to_string(), |d| d.to_string())
            ));
        }
        let kept: HashSet<RaceId> = races.iter().map(|race| race.id).collect();
        let entrants = self
            .entrants
            .iter()
            .filter(|entrant| kept.contains(&entrant.race_id))
            .cloned()
            .collect();
        let payouts = self
            .payouts
            .iter()
            .filter(|payout| kept.contains(&payout.race_id))
            .cloned()
            .collect();

        Ok(Self::from_records(
            races,
            entrants,
            payouts,
            self.horses.values().cloned().collect(),
            self.settings.as_ref().clone(),
        )?)
    }

    /// Returns a new batch with `newer` appended. Races already present are immutable,
    /// so their records in `newer` are ignored; horse records are replaced by the newer
    /// registration data.
    pub fn append(&self, newer: &RaceData) -> Result<Self, PipelineError> {
        let mut races = self.races.as_ref().clone();
        let mut entrants = self.entrants.as_ref().clone();
        let mut payouts = self.payouts.as_ref().clone();

        let mut skipped = 0usize;
        for race in newer.races.iter() {
            if self.race_index.contains_key(&race.id) {
                skipped += 1;
                continue;
            }
            races.push(race.clone());
            entrants.extend(newer.entrants_for_race(race.id).cloned());
            if let Some(payout) = newer.payout(race.id) {
                payouts.push(payout.clone());
            }
        }
        if skipped > 0 {
            warn!(
                "Ignored {} races already present in the batch while appending",
                skipped
            );
        }

        let mut horses = self.horses.as_ref().clone();
        for (id, horse) in newer.horses.iter() {
            horses.insert(id.clone(), horse.clone());
        }

        let mut settings = self.settings.as_ref().clone();
        for (key, value) in newer.settings.iter() {
            settings.entry(key.clone()).or_insert_with(|| value.clone());
        }

        Self::from_records(
            races,
            entrants,
            payouts,
            horses.into_values().collect(),
            settings,
        )
    }

    pub fn races(&self) -> &[Race] {
        &self.races
    }

    pub fn entrants(&self) -> &[Entrant] {
        &self.entrants
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn payout(&self, id: RaceId) -> Option<&Payout> {
        self.payout_index.get(&id).map(|&idx| &self.payouts[idx])
    }

    pub fn horse(&self, horse_id: &str) -> Option<&Horse> {
        self.horses.get(horse_id)
    }

    /// Entrants of one race in horse-number order.
    pub fn entrants_for_race(&self, id: RaceId) -> impl Iterator<Item = &Entrant> + '_ {
        self.entrants_by_race
            .get(&id)
            .into_iter()
            .flat_map(move |indices| indices.iter().map(move |&idx| &self.entrants[idx]))
    }

    /// Race ids referenced by entrants that have no race record.
    pub fn orphan_entrant_races(&self) -> Vec<RaceId> {
        let mut orphans: Vec<RaceId> = self
            .entrants_by_race
            .keys()
            .filter(|id| !self.race_index.contains_key(id))
            .copied()
            .collect();
        orphans.sort();
        orphans
    }

    pub fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((self.races.first()?.date, self.races.last()?.date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Going, Surface};

    fn race(date: (i32, u32, u32), venue: u8, number: u8) -> Race {
        let date = NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap();
        Race {
            id: RaceId::new(
                date.year() as u16,
                (date.month() * 100 + date.day()) as u16,
                venue,
                number,
            ),
            date,
            distance_m: 1600,
            track_code: "11".into(),
            surface: Surface::Turf,
            weather_code: 1,
            going: Going::Good,
        }
    }

    fn entrant(race_id: RaceId, horse: &str, number: u8) -> Entrant {
        Entrant {
            race_id,
            horse_id: horse.into(),
            post_position: number,
            horse_number: number,
            jockey_code: "J1".into(),
            trainer_code: "T1".into(),
            finish_position: Some(number),
            elapsed_time_tenths: None,
            final_3f_tenths: None,
            win_odds: Some(3.0),
            popularity: Some(number),
        }
    }

    fn sample() -> RaceData {
        let first = race((2021, 1, 5), 6, 1);
        let second = race((2021, 2, 7), 5, 11);
        let entrants = vec![
            entrant(first.id, "H2", 2),
            entrant(first.id, "H1", 1),
            entrant(second.id, "H1", 1),
        ];
        RaceData::from_records(
            vec![second, first],
            entrants,
            vec![],
            vec![],
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn races_are_ordered_and_entrants_indexed() {
        let data = sample();
        assert_eq!(data.races()[0].id.to_string(), "202101050601");
        let numbers: Vec<u8> = data
            .entrants_for_race(data.races()[0].id)
            .map(|e| e.horse_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let first = race((2021, 1, 5), 6, 1);
        let err = RaceData::from_records(
            vec![first.clone()],
            vec![entrant(first.id, "H1", 1), entrant(first.id, "H2", 1)],
            vec![],
            vec![],
            HashMap::new(),
        )
        .err()
        .unwrap();
        assert!(err.is_data_integrity());
    }

    #[test]
    fn restrict_and_append_keep_existing_races() {
        let data = sample();
        let january = data
            .restrict_to_date_range(None, NaiveDate::from_ymd_opt(2021, 1, 31))
            .unwrap();
        assert_eq!(january.races().len(), 1);
        assert_eq!(january.entrants().len(), 2);

        let merged = january.append(&data).unwrap();
        assert_eq!(merged.races().len(), 2);
        assert_eq!(merged.entrants().len(), 3);
        assert!(data
            .restrict_to_date_range(NaiveDate::from_ymd_opt(2022, 1, 1), None)
            .is_err());
    }

    #[test]
    fn snapshot_round_trip_keeps_pipeline_settings_only() {
        let mut settings = HashMap::new();
        settings.insert("MIN_SAMPLES_SIRE_CONDITION".to_string(), "5".to_string());
        settings.insert("UNRELATED_SECRET".to_string(), "x".to_string());
        let base = sample();
        let data = RaceData::from_records(
            base.races().to_vec(),
            base.entrants().to_vec(),
            vec![],
            vec![],
            settings,
        )
        .unwrap();

        let path = std::env::temp_dir().join(format!("race-data-{}.bin", uuid::Uuid::new_v4()));
        data.save_to_file(&path).unwrap();
        let loaded = RaceData::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.races().len(), 2);
        assert_eq!(loaded.entrants().len(), 3);
        assert_eq!(
            loaded.settings().get("MIN_SAMPLES_SIRE_CONDITION").map(String::as_str),
            Some("5")
        );
        assert!(!loaded.settings().contains_key("UNRELATED_SECRET"));
    }
}
