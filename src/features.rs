//! Feature matrix construction.
//!
//! Every cohort feature is emitted as a pair of columns: `<dimension>_roi` and
//! `<dimension>_sufficient`. Missing values use fixed sentinels that a genuine value
//! can never take (ROI and all raw attributes are non-negative):
//!
//! * [`INSUFFICIENT_SENTINEL`] when the cohort has fewer prior bets than its threshold,
//!   or a raw attribute is unknown (first start, no odds);
//! * [`NOT_APPLICABLE_SENTINEL`] for the stamina features on races shorter than the
//!   stamina threshold.
//!
//! The sufficiency flag is `1.0` only when the ROI column holds a real value.

use crate::cohort::{CohortDimension, CohortEngine, CohortRoi};
use crate::config::{PipelineSettings, TargetKind};
use crate::data_context::RaceData;
use crate::errors::PipelineError;
use crate::join::{join_batch, JoinedRow, OutcomeMode};
use crate::models::{DateRange, RaceId, STAKE_UNIT_YEN};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPool;
use statrs::statistics::Statistics;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const INSUFFICIENT_SENTINEL: f64 = -1.0;
pub const NOT_APPLICABLE_SENTINEL: f64 = -2.0;

pub const FEATURE_COLUMNS: [&str; 26] = [
    "distance_m",
    "surface_code",
    "going_code",
    "weather_code",
    "post_position",
    "horse_number",
    "field_size",
    "popularity",
    "win_odds",
    "prev_finish",
    "prev_closing_rank",
    "days_since_last_run",
    "avg_finish_last5",
    "stamina_index",
    "sire_condition_roi",
    "sire_condition_sufficient",
    "jockey_course_roi",
    "jockey_course_sufficient",
    "horse_course_roi",
    "horse_course_sufficient",
    "closing_speed_roi",
    "closing_speed_sufficient",
    "pace_recovery_roi",
    "pace_recovery_sufficient",
    "stamina_rank_roi",
    "stamina_rank_sufficient",
];

const RAW_COLUMN_COUNT: usize = 14;
const STAMINA_INDEX_COLUMN: usize = 13;

pub fn feature_columns() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|name| name.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub race_id: RaceId,
    pub race_date: NaiveDate,
    pub horse_id: String,
    pub horse_number: u8,
    pub popularity: Option<u8>,
    pub values: Vec<f64>,
    /// Latest race date whose outcome fed any column of this row.
    pub history_cutoff: Option<NaiveDate>,
    /// Column that `history_cutoff` came from.
    pub cutoff_column: Option<&'static str>,
}

impl FeatureRow {
    pub fn value(&self, column: &str) -> Option<f64> {
        FEATURE_COLUMNS
            .iter()
            .position(|name| *name == column)
            .and_then(|idx| self.values.get(idx).copied())
    }

    fn record_source(&mut self, column: &'static str, source: Option<NaiveDate>) {
        if let Some(date) = source {
            if self.history_cutoff.map_or(true, |current| date > current) {
                self.history_cutoff = Some(date);
                self.cutoff_column = Some(column);
            }
        }
    }
}

/// Rectangular matrix with explicit column names. `labels` and `payouts` are present
/// only for training matrices.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
    pub labels: Option<Vec<f64>>,
    /// Realised bet payout per row, yen per 100-yen stake.
    pub payouts: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSummary {
    pub name: String,
    pub mean: f64,
    pub std_dev: f64,
    /// Share of rows holding either sentinel.
    pub sentinel_share: f64,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fails on the first row whose outcome-derived inputs are dated on or after its race.
    pub fn verify_point_in_time(&self) -> Result<(), PipelineError> {
        for row in &self.rows {
            if let Some(source_date) = row.history_cutoff {
                if source_date >= row.race_date {
                    return Err(PipelineError::Leakage {
                        race_id: row.race_id.to_string(),
                        race_date: row.race_date,
                        source_date,
                        column: row.cutoff_column.unwrap_or("history_cutoff").to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Keeps the rows for which `keep` holds, along with their labels.
    pub fn filter_rows(&self, keep: impl Fn(&FeatureRow) -> bool) -> FeatureMatrix {
        let kept: Vec<usize> = (0..self.rows.len()).filter(|&idx| keep(&self.rows[idx])).collect();
        let pick = |values: &Vec<f64>| kept.iter().map(|&idx| values[idx]).collect::<Vec<_>>();
        FeatureMatrix {
            columns: self.columns.clone(),
            rows: kept.iter().map(|&idx| self.rows[idx].clone()).collect(),
            labels: self.labels.as_ref().map(pick),
            payouts: self.payouts.as_ref().map(pick),
        }
    }

    pub fn column_summaries(&self) -> Vec<ColumnSummary> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let column: Vec<f64> = self.rows.iter().map(|row| row.values[idx]).collect();
                let real: Vec<f64> = column
                    .iter()
                    .copied()
                    .filter(|value| !is_sentinel(*value))
                    .collect();
                let sentinel_share = if column.is_empty() {
                    0.0
                } else {
                    (column.len() - real.len()) as f64 / column.len() as f64
                };
                let (mean, std_dev) = match real.len() {
                    0 => (f64::NAN, f64::NAN),
                    1 => (real[0], 0.0),
                    _ => (real.iter().mean(), real.iter().std_dev()),
                };
                ColumnSummary {
                    name: name.clone(),
                    mean,
                    std_dev,
                    sentinel_share,
                }
            })
            .collect()
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create feature file {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        write!(writer, "race_id,race_date,horse_id,horse_number")?;
        for column in &self.columns {
            write!(writer, ",{}", column)?;
        }
        if self.labels.is_some() {
            write!(writer, ",label,payout")?;
        }
        writeln!(writer)?;

        for (idx, row) in self.rows.iter().enumerate() {
            write!(
                writer,
                "{},{},{},{}",
                row.race_id,
                row.race_date.format("%Y-%m-%d"),
                row.horse_id,
                row.horse_number
            )?;
            for value in &row.values {
                write!(writer, ",{}", value)?;
            }
            if let (Some(labels), Some(payouts)) = (&self.labels, &self.payouts) {
                write!(writer, ",{},{}", labels[idx], payouts[idx])?;
            }
            writeln!(writer)?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush feature file {}", path.display()))?;
        Ok(())
    }
}

pub fn is_sentinel(value: f64) -> bool {
    value == INSUFFICIENT_SENTINEL || value == NOT_APPLICABLE_SENTINEL
}

pub struct FeatureBuilder<'a> {
    engine: &'a CohortEngine,
    settings: &'a PipelineSettings,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(engine: &'a CohortEngine, settings: &'a PipelineSettings) -> Self {
        Self { engine, settings }
    }

    /// Builds one row per target. Outcomes on `targets` are never read; labels come only
    /// from `labelled`, matched by race and horse number.
    pub fn build(
        &self,
        targets: &[JoinedRow],
        labelled: Option<&[JoinedRow]>,
    ) -> Result<FeatureMatrix, PipelineError> {
        let rows: Vec<FeatureRow> = targets.par_iter().map(|row| self.build_row(row)).collect();

        let (labels, payouts) = match labelled {
            Some(labelled) => {
                let (labels, payouts) = self.labels_for(&rows, labelled)?;
                (Some(labels), Some(payouts))
            }
            None => (None, None),
        };

        let sufficient = rows
            .iter()
            .filter(|row| row.value("sire_condition_sufficient") == Some(1.0))
            .count();
        info!(
            "Built feature matrix: {} rows x {} columns ({} with a sufficient sire cohort)",
            rows.len(),
            FEATURE_COLUMNS.len(),
            sufficient
        );

        Ok(FeatureMatrix {
            columns: feature_columns(),
            rows,
            labels,
            payouts,
        })
    }

    fn build_row(&self, row: &JoinedRow) -> FeatureRow {
        let prior = &row.prior;
        let stamina_applies = row.distance_m >= self.settings.stamina_distance_threshold_m;
        let mut values = Vec::with_capacity(FEATURE_COLUMNS.len());
        values.extend([
            row.distance_m as f64,
            row.surface.code(),
            row.going.code(),
            row.weather_code as f64,
            row.post_position as f64,
            row.horse_number as f64,
            row.field_size as f64,
            or_insufficient(row.popularity.map(f64::from)),
            or_insufficient(row.win_odds),
            or_insufficient(prior.prev_finish.map(f64::from)),
            or_insufficient(prior.prev_closing_rank.map(f64::from)),
            or_insufficient(prior.days_since_last_run.map(|days| days as f64)),
            or_insufficient(prior.avg_finish_last5),
            if stamina_applies {
                or_insufficient(prior.stamina_index)
            } else {
                NOT_APPLICABLE_SENTINEL
            },
        ]);
        debug_assert_eq!(values.len(), RAW_COLUMN_COUNT);

        let mut feature_row = FeatureRow {
            race_id: row.race_id,
            race_date: row.race_date,
            horse_id: row.horse_id.clone(),
            horse_number: row.horse_number,
            popularity: row.popularity,
            values,
            history_cutoff: None,
            cutoff_column: None,
        };
        for column in [
            "prev_finish",
            "prev_closing_rank",
            "days_since_last_run",
            "avg_finish_last5",
        ] {
            feature_row.record_source(column, prior.last_run_date);
        }
        if feature_row.values[STAMINA_INDEX_COLUMN] >= 0.0 {
            feature_row.record_source("stamina_index", prior.last_run_date);
        }

        for (dimension, roi_column) in CohortDimension::ALL
            .iter()
            .zip(FEATURE_COLUMNS[RAW_COLUMN_COUNT..].iter().step_by(2))
        {
            let roi = self.engine.lookup(*dimension, row);
            let (value, flag) = encode_roi(&roi);
            feature_row.values.push(value);
            feature_row.values.push(flag);
            feature_row.record_source(*roi_column, roi.latest_sample());
        }
        feature_row
    }

    fn labels_for(
        &self,
        rows: &[FeatureRow],
        labelled: &[JoinedRow],
    ) -> Result<(Vec<f64>, Vec<f64>), PipelineError> {
        let outcomes: HashMap<(RaceId, u8), f64> = labelled
            .iter()
            .filter_map(|row| {
                row.outcome.as_ref().map(|outcome| {
                    (
                        (row.race_id, row.horse_number),
                        outcome.bet_return(self.settings.bet_kind),
                    )
                })
            })
            .collect();

        let mut labels = Vec::with_capacity(rows.len());
        let mut payouts = Vec::with_capacity(rows.len());
        for row in rows {
            let payout = *outcomes.get(&(row.race_id, row.horse_number)).ok_or_else(|| {
                PipelineError::integrity(
                    format!("race {}", row.race_id),
                    format!("no outcome for horse number {}", row.horse_number),
                )
            })?;
            labels.push(target_value(self.settings.target_kind, payout));
            payouts.push(payout);
        }
        debug!("Attached {} labels", labels.len());
        Ok((labels, payouts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixPurpose {
    /// Labelled rows, restricted to finalized races.
    Training,
    /// Unlabelled rows for every declared entrant.
    Prediction,
}

/// Joins, aggregates and builds the feature matrix for races in `range`, using every
/// earlier finalized race in `data` as history. Each row sees results strictly before
/// its own race date, so a row's features do not depend on the window it is built in.
pub fn build_feature_matrix(
    data: &RaceData,
    range: DateRange,
    settings: &PipelineSettings,
    pool: &ThreadPool,
    purpose: MatrixPurpose,
) -> Result<FeatureMatrix> {
    let (first_date, _) = data
        .date_span()
        .ok_or_else(|| anyhow!("Race data is empty"))?;
    let history_range = DateRange::new(first_date.min(range.start), range.end)?;

    let history = join_batch(data, history_range, OutcomeMode::Include, settings)?;
    let mut targets = join_batch(data, range, OutcomeMode::Exclude, settings)?;
    let engine = CohortEngine::build(&history, settings, pool);

    let labelled = match purpose {
        MatrixPurpose::Training => {
            let labelled = join_batch(data, range, OutcomeMode::Include, settings)?;
            let finalized: HashSet<(RaceId, u8)> = labelled
                .iter()
                .map(|row| (row.race_id, row.horse_number))
                .collect();
            targets.retain(|row| finalized.contains(&(row.race_id, row.horse_number)));
            Some(labelled)
        }
        MatrixPurpose::Prediction => None,
    };

    let builder = FeatureBuilder::new(&engine, settings);
    let matrix = pool.install(|| builder.build(&targets, labelled.as_deref()))?;
    Ok(matrix)
}

/// Training target for a realised payout (yen per 100-yen stake).
pub fn target_value(kind: TargetKind, payout: f64) -> f64 {
    match kind {
        TargetKind::RealizedReturn => payout / STAKE_UNIT_YEN,
        TargetKind::PositiveReturn => {
            if payout > 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

pub fn encode_roi(roi: &CohortRoi) -> (f64, f64) {
    match roi {
        CohortRoi::Sufficient { roi_pct, .. } => (*roi_pct, 1.0),
        CohortRoi::Insufficient { .. } => (INSUFFICIENT_SENTINEL, 0.0),
        CohortRoi::NotApplicable => (NOT_APPLICABLE_SENTINEL, 0.0),
    }
}

fn or_insufficient(value: Option<f64>) -> f64 {
    value.unwrap_or(INSUFFICIENT_SENTINEL)
}
