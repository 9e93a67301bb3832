use crate::errors::PipelineError;
use crate::models::*;
use crate::retry::retry_db_operation;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, warn};
use std::collections::HashMap;
use tokio_postgres::{Client, NoTls, Row};

const WIN_PAYOUT_SLOTS: usize = 3;
const PLACE_PAYOUT_SLOTS: usize = 5;

/// One trained model plus its experiment metadata.
#[derive(Debug, Clone)]
pub struct ModelRunRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub hyperparameters: serde_json::Value,
    pub metrics: serde_json::Value,
    pub feature_columns: Vec<String>,
    pub tree_text: String,
}

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = retry_db_operation!("settings fetch", async {
            self.client
                .query("SELECT setting_key, value FROM settings", &[])
                .await
        })?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let value: String = row.get(1);
            settings.insert(key, value);
        }
        Ok(settings)
    }

    pub async fn get_races(&self, range: DateRange) -> Result<Vec<Race>> {
        let (start, end) = range_bounds(range);
        let rows = retry_db_operation!(format!("race fetch for {range}"), async {
            self.client
                .query(
                    "SELECT kaisai_nen, kaisai_tsukihi, keibajo_code, race_bango,
                            kyori, track_code, tenko_code,
                            babajotai_code_shiba, babajotai_code_dirt
                     FROM jvd_ra
                     WHERE (kaisai_nen || kaisai_tsukihi) BETWEEN $1 AND $2
                     ORDER BY kaisai_nen, kaisai_tsukihi, keibajo_code, race_bango",
                    &[&start, &end],
                )
                .await
        })?;

        let races = rows
            .iter()
            .map(|row| RawRaceRow::from_row(row).into_race())
            .collect::<Result<Vec<_>, PipelineError>>()?;
        debug!("Fetched {} races for {}", races.len(), range);
        Ok(races)
    }

    pub async fn get_entrants(&self, range: DateRange) -> Result<Vec<Entrant>> {
        let (start, end) = range_bounds(range);
        let rows = retry_db_operation!(format!("entrant fetch for {range}"), async {
            self.client
                .query(
                    "SELECT kaisai_nen, kaisai_tsukihi, keibajo_code, race_bango,
                            ketto_toroku_bango, wakuban, umaban, kishu_code, chokyoshi_code,
                            kakutei_chakujun, soha_time, kohan_3f, tansho_odds, tansho_ninkijun
                     FROM jvd_se
                     WHERE (kaisai_nen || kaisai_tsukihi) BETWEEN $1 AND $2
                     ORDER BY kaisai_nen, kaisai_tsukihi, keibajo_code, race_bango, umaban",
                    &[&start, &end],
                )
                .await
        })?;

        let entrants = rows
            .iter()
            .map(|row| RawEntrantRow::from_row(row).into_entrant())
            .collect::<Result<Vec<_>, PipelineError>>()?;
        debug!("Fetched {} entrants for {}", entrants.len(), range);
        Ok(entrants)
    }

    pub async fn get_payouts(&self, range: DateRange) -> Result<Vec<Payout>> {
        let (start, end) = range_bounds(range);
        let rows = retry_db_operation!(format!("payout fetch for {range}"), async {
            self.client
                .query(
                    "SELECT kaisai_nen, kaisai_tsukihi, keibajo_code, race_bango,
                            haraimodoshi_tansho_1a, haraimodoshi_tansho_1b,
                            haraimodoshi_tansho_2a, haraimodoshi_tansho_2b,
                            haraimodoshi_tansho_3a, haraimodoshi_tansho_3b,
                            haraimodoshi_fukusho_1a, haraimodoshi_fukusho_1b,
                            haraimodoshi_fukusho_2a, haraimodoshi_fukusho_2b,
                            haraimodoshi_fukusho_3a, haraimodoshi_fukusho_3b,
                            haraimodoshi_fukusho_4a, haraimodoshi_fukusho_4b,
                            haraimodoshi_fukusho_5a, haraimodoshi_fukusho_5b
                     FROM jvd_hr
                     WHERE (kaisai_nen || kaisai_tsukihi) BETWEEN $1 AND $2",
                    &[&start, &end],
                )
                .await
        })?;

        let payouts = rows
            .iter()
            .map(|row| RawPayoutRow::from_row(row).into_payout())
            .collect::<Result<Vec<_>, PipelineError>>()?;
        debug!("Fetched {} payout records for {}", payouts.len(), range);
        Ok(payouts)
    }

    pub async fn get_horses(&self, horse_ids: &[String]) -> Result<Vec<Horse>> {
        if horse_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = horse_ids.to_vec();
        let rows = retry_db_operation!(format!("pedigree fetch for {} horses", ids.len()), async {
            self.client
                .query(
                    "SELECT ketto_toroku_bango, bamei, seinengappi,
                            ketto_joho_01a, ketto_joho_01b, ketto_joho_02a, ketto_joho_02b
                     FROM jvd_um
                     WHERE ketto_toroku_bango = ANY($1)",
                    &[&ids],
                )
                .await
        })?;

        Ok(rows
            .iter()
            .map(|row| RawHorseRow::from_row(row).into_horse())
            .collect())
    }

    pub async fn insert_model_run(&self, record: &ModelRunRecord) -> Result<()> {
        let hyperparameters = record.hyperparameters.to_string();
        let metrics = record.metrics.to_string();
        let feature_columns = serde_json::to_string(&record.feature_columns)?;
        self.client
            .execute(
                "INSERT INTO model_runs (id, name, created_at, hyperparameters, metrics, feature_columns, tree_text)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &record.id,
                    &record.name,
                    &record.created_at,
                    &hyperparameters,
                    &metrics,
                    &feature_columns,
                    &record.tree_text,
                ],
            )
            .await
            .context("failed to store model run")?;
        Ok(())
    }

    pub async fn get_latest_model_run(&self) -> Result<Option<ModelRunRecord>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, created_at, hyperparameters, metrics, feature_columns, tree_text
                 FROM model_runs
                 ORDER BY created_at DESC
                 LIMIT 1",
                &[],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let hyperparameters: String = row.get(3);
        let metrics: String = row.get(4);
        let feature_columns: String = row.get(5);
        Ok(Some(ModelRunRecord {
            id: row.get(0),
            name: row.get(1),
            created_at: row.get(2),
            hyperparameters: parse_json_or_null(&hyperparameters),
            metrics: parse_json_or_null(&metrics),
            feature_columns: serde_json::from_str(&feature_columns)
                .context("model_runs.feature_columns is not a JSON string array")?,
            tree_text: row.get(6),
        }))
    }
}

fn range_bounds(range: DateRange) -> (String, String) {
    (
        range.start.format("%Y%m%d").to_string(),
        range.end.format("%Y%m%d").to_string(),
    )
}

fn parse_json_or_null(raw: &str) -> serde_json::Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!("Ignoring malformed JSON column: {}", err);
            serde_json::Value::Null
        }
    }
}

fn text(row: &Row, idx: usize) -> String {
    row.get::<_, Option<String>>(idx).unwrap_or_default()
}

/// `jvd_ra` columns as stored (all text).
#[derive(Debug, Clone, Default)]
pub struct RawRaceRow {
    pub kaisai_nen: String,
    pub kaisai_tsukihi: String,
    pub keibajo_code: String,
    pub race_bango: String,
    pub kyori: String,
    pub track_code: String,
    pub tenko_code: String,
    pub babajotai_code_shiba: String,
    pub babajotai_code_dirt: String,
}

impl RawRaceRow {
    fn from_row(row: &Row) -> Self {
        Self {
            kaisai_nen: text(row, 0),
            kaisai_tsukihi: text(row, 1),
            keibajo_code: text(row, 2),
            race_bango: text(row, 3),
            kyori: text(row, 4),
            track_code: text(row, 5),
            tenko_code: text(row, 6),
            babajotai_code_shiba: text(row, 7),
            babajotai_code_dirt: text(row, 8),
        }
    }

    pub fn into_race(self) -> Result<Race, PipelineError> {
        let id = RaceId::from_raw_parts(
            &self.kaisai_nen,
            &self.kaisai_tsukihi,
            &self.keibajo_code,
            &self.race_bango,
        )?;
        let date = id.date()?;
        let distance_m = self
            .kyori
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                PipelineError::integrity(
                    format!("race {id}"),
                    format!("malformed kyori field \"{}\"", self.kyori),
                )
            })?;
        let surface = Surface::from_track_code(&self.track_code);
        let going_code = match surface {
            Surface::Turf => &self.babajotai_code_shiba,
            _ => &self.babajotai_code_dirt,
        };
        Ok(Race {
            id,
            date,
            distance_m,
            track_code: self.track_code.trim().to_string(),
            surface,
            weather_code: self.tenko_code.trim().parse::<u8>().unwrap_or(0),
            going: Going::from_code(going_code),
        })
    }
}

/// `jvd_se` columns as stored (all text).
#[derive(Debug, Clone, Default)]
pub struct RawEntrantRow {
    pub kaisai_nen: String,
    pub kaisai_tsukihi: String,
    pub keibajo_code: String,
    pub race_bango: String,
    pub ketto_toroku_bango: String,
    pub wakuban: String,
    pub umaban: String,
    pub kishu_code: String,
    pub chokyoshi_code: String,
    pub kakutei_chakujun: String,
    pub soha_time: String,
    pub kohan_3f: String,
    pub tansho_odds: String,
    pub tansho_ninkijun: String,
}

impl RawEntrantRow {
    fn from_row(row: &Row) -> Self {
        Self {
            kaisai_nen: text(row, 0),
            kaisai_tsukihi: text(row, 1),
            keibajo_code: text(row, 2),
            race_bango: text(row, 3),
            ketto_toroku_bango: text(row, 4),
            wakuban: text(row, 5),
            umaban: text(row, 6),
            kishu_code: text(row, 7),
            chokyoshi_code: text(row, 8),
            kakutei_chakujun: text(row, 9),
            soha_time: text(row, 10),
            kohan_3f: text(row, 11),
            tansho_odds: text(row, 12),
            tansho_ninkijun: text(row, 13),
        }
    }

    pub fn into_entrant(self) -> Result<Entrant, PipelineError> {
        let race_id = RaceId::from_raw_parts(
            &self.kaisai_nen,
            &self.kaisai_tsukihi,
            &self.keibajo_code,
            &self.race_bango,
        )?;
        let horse_id = self.ketto_toroku_bango.trim().to_string();
        if horse_id.is_empty() {
            return Err(PipelineError::integrity(
                format!("race {race_id}"),
                format!("entrant with umaban \"{}\" has no ketto_toroku_bango", self.umaban),
            ));
        }
        let horse_number = parse_small_number(&self.umaban).ok_or_else(|| {
            PipelineError::integrity(
                format!("race {race_id}"),
                format!("malformed umaban \"{}\" for horse {}", self.umaban, horse_id),
            )
        })?;

        Ok(Entrant {
            race_id,
            horse_id,
            post_position: parse_small_number(&self.wakuban).unwrap_or(0),
            horse_number,
            jockey_code: self.kishu_code.trim().to_string(),
            trainer_code: self.chokyoshi_code.trim().to_string(),
            finish_position: parse_finish_position(&self.kakutei_chakujun),
            elapsed_time_tenths: parse_elapsed_time(&self.soha_time),
            final_3f_tenths: parse_final_3f(&self.kohan_3f),
            win_odds: parse_win_odds(&self.tansho_odds),
            popularity: parse_popularity(&self.tansho_ninkijun),
        })
    }
}

fn parse_small_number(raw: &str) -> Option<u8> {
    raw.trim().parse::<u8>().ok().filter(|value| *value > 0)
}

/// `jvd_hr` columns: horse number (`a`) and payout (`b`) per slot.
#[derive(Debug, Clone, Default)]
pub struct RawPayoutRow {
    pub kaisai_nen: String,
    pub kaisai_tsukihi: String,
    pub keibajo_code: String,
    pub race_bango: String,
    pub tansho: Vec<(String, String)>,
    pub fukusho: Vec<(String, String)>,
}

impl RawPayoutRow {
    fn from_row(row: &Row) -> Self {
        let pair = |idx: usize| (text(row, idx), text(row, idx + 1));
        Self {
            kaisai_nen: text(row, 0),
            kaisai_tsukihi: text(row, 1),
            keibajo_code: text(row, 2),
            race_bango: text(row, 3),
            tansho: (0..WIN_PAYOUT_SLOTS).map(|slot| pair(4 + slot * 2)).collect(),
            fukusho: (0..PLACE_PAYOUT_SLOTS)
                .map(|slot| pair(4 + WIN_PAYOUT_SLOTS * 2 + slot * 2))
                .collect(),
        }
    }

    pub fn into_payout(self) -> Result<Payout, PipelineError> {
        let race_id = RaceId::from_raw_parts(
            &self.kaisai_nen,
            &self.kaisai_tsukihi,
            &self.keibajo_code,
            &self.race_bango,
        )?;
        let win = parse_payout_slots(race_id, "tansho", &self.tansho)?;
        let place = parse_payout_slots(race_id, "fukusho", &self.fukusho)?;
        Ok(Payout {
            race_id,
            win,
            place,
        })
    }
}

fn parse_payout_slots(
    race_id: RaceId,
    bet_type: &str,
    slots: &[(String, String)],
) -> Result<Vec<PayoutEntry>, PipelineError> {
    let mut entries = Vec::new();
    for (horse_raw, amount_raw) in slots {
        let horse_trimmed = horse_raw.trim();
        // Unused slots are blank or zero-filled.
        if horse_trimmed.is_empty() || horse_trimmed.chars().all(|c| c == '0') {
            continue;
        }
        let horse_number = parse_small_number(horse_trimmed).ok_or_else(|| {
            PipelineError::integrity(
                format!("race {race_id}"),
                format!("malformed {bet_type} horse number \"{horse_raw}\""),
            )
        })?;
        let amount_yen = amount_raw.trim().parse::<u32>().map_err(|_| {
            PipelineError::integrity(
                format!("race {race_id}"),
                format!("malformed {bet_type} payout \"{amount_raw}\" for horse {horse_number}"),
            )
        })?;
        entries.push(PayoutEntry {
            horse_number,
            amount_yen,
        });
    }
    Ok(entries)
}

/// `jvd_um` columns as stored (all text).
#[derive(Debug, Clone, Default)]
pub struct RawHorseRow {
    pub ketto_toroku_bango: String,
    pub bamei: String,
    pub seinengappi: String,
    pub ketto_joho_01a: String,
    pub ketto_joho_01b: String,
    pub ketto_joho_02a: String,
    pub ketto_joho_02b: String,
}

impl RawHorseRow {
    fn from_row(row: &Row) -> Self {
        Self {
            ketto_toroku_bango: text(row, 0),
            bamei: text(row, 1),
            seinengappi: text(row, 2),
            ketto_joho_01a: text(row, 3),
            ketto_joho_01b: text(row, 4),
            ketto_joho_02a: text(row, 5),
            ketto_joho_02b: text(row, 6),
        }
    }

    pub fn into_horse(self) -> Horse {
        Horse {
            horse_id: self.ketto_toroku_bango.trim().to_string(),
            name: self.bamei.trim().to_string(),
            birth_date: NaiveDate::parse_from_str(self.seinengappi.trim(), "%Y%m%d").ok(),
            sire_id: pedigree_field(&self.ketto_joho_01a),
            sire_name: pedigree_field(&self.ketto_joho_01b),
            dam_id: pedigree_field(&self.ketto_joho_02a),
            dam_name: pedigree_field(&self.ketto_joho_02b),
        }
    }
}

/// Blank and zero-filled pedigree ids mean "unknown".
fn pedigree_field(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '0') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_race() -> RawRaceRow {
        RawRaceRow {
            kaisai_nen: "2021".into(),
            kaisai_tsukihi: "1226".into(),
            keibajo_code: "06".into(),
            race_bango: "11".into(),
            kyori: "2500".into(),
            track_code: "17".into(),
            tenko_code: "1".into(),
            babajotai_code_shiba: "2".into(),
            babajotai_code_dirt: "1".into(),
        }
    }

    #[test]
    fn raw_race_rows_pick_surface_specific_going() {
        let race = raw_race().into_race().expect("valid race");
        assert_eq!(race.id.to_string(), "202112260611");
        assert_eq!(race.surface, Surface::Turf);
        assert_eq!(race.going, Going::Yielding);
        assert_eq!(race.distance_m, 2500);

        let mut dirt = raw_race();
        dirt.track_code = "24".into();
        let race = dirt.into_race().unwrap();
        assert_eq!(race.surface, Surface::Dirt);
        assert_eq!(race.going, Going::Good);
    }

    #[test]
    fn malformed_race_fields_are_integrity_errors() {
        let mut bad_date = raw_race();
        bad_date.kaisai_tsukihi = "1332".into();
        assert!(bad_date.into_race().unwrap_err().is_data_integrity());

        let mut bad_distance = raw_race();
        bad_distance.kyori = "".into();
        assert!(bad_distance.into_race().unwrap_err().is_data_integrity());
    }

    #[test]
    fn raw_entrant_rows_parse_results() {
        let entrant = RawEntrantRow {
            kaisai_nen: "2021".into(),
            kaisai_tsukihi: "1226".into(),
            keibajo_code: "06".into(),
            race_bango: "11".into(),
            ketto_toroku_bango: "2018105165".into(),
            wakuban: "5".into(),
            umaban: "10".into(),
            kishu_code: "01126".into(),
            chokyoshi_code: "01061".into(),
            kakutei_chakujun: "01".into(),
            soha_time: "2325".into(),
            kohan_3f: "356".into(),
            tansho_odds: "0045".into(),
            tansho_ninkijun: "02".into(),
        }
        .into_entrant()
        .expect("valid entrant");
        assert_eq!(entrant.horse_number, 10);
        assert_eq!(entrant.finish_position, Some(1));
        assert_eq!(entrant.elapsed_time_tenths, Some(2 * 600 + 32 * 10 + 5));
        assert_eq!(entrant.final_3f_tenths, Some(356));
        assert_eq!(entrant.win_odds, Some(4.5));
        assert_eq!(entrant.popularity, Some(2));
    }

    #[test]
    fn payout_slots_skip_blanks_and_reject_garbage() {
        let mut raw = RawPayoutRow {
            kaisai_nen: "2021".into(),
            kaisai_tsukihi: "1226".into(),
            keibajo_code: "06".into(),
            race_bango: "11".into(),
            tansho: vec![
                ("10".into(), "450".into()),
                ("".into(), "".into()),
                ("00".into(), "000000000".into()),
            ],
            fukusho: vec![
                ("10".into(), "160".into()),
                ("03".into(), "420".into()),
                ("07".into(), "210".into()),
            ],
        };
        let payout = raw.clone().into_payout().expect("valid payout");
        assert_eq!(payout.win.len(), 1);
        assert_eq!(payout.win_return(10), 450.0);
        assert_eq!(payout.place_return(3), 420.0);

        raw.tansho[0].1 = "4x0".into();
        assert!(raw.into_payout().unwrap_err().is_data_integrity());
    }

    #[test]
    fn zero_filled_pedigree_ids_are_unknown() {
        let horse = RawHorseRow {
            ketto_toroku_bango: "2018105165".into(),
            bamei: "Sample Runner ".into(),
            seinengappi: "20180304".into(),
            ketto_joho_01a: "1120004323".into(),
            ketto_joho_01b: "Sample Sire".into(),
            ketto_joho_02a: "0000000000".into(),
            ketto_joho_02b: "".into(),
        }
        .into_horse();
        assert_eq!(horse.name, "Sample Runner");
        assert_eq!(horse.sire_id.as_deref(), Some("1120004323"));
        assert_eq!(horse.dam_id, None);
        assert_eq!(horse.birth_date, NaiveDate::from_ymd_opt(2018, 3, 4));
    }
}
