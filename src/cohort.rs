//! Point-in-time ROI statistics per betting cohort.
//!
//! History rows are partitioned by [`CohortKey`], each partition is sorted by race date
//! and stored with prefix sums of the realised payout, wins and top-3 finishes. A query at date `D` binary-searches
//! for the first observation dated `>= D`, so observations from `D` itself (same-day
//! races) and later never contribute.

use crate::config::{BetKind, MinimumSamples, PipelineSettings};
use crate::join::{JoinedRow, PacePattern};
use crate::models::{DistanceCategory, Going, PopularityBand, Surface, STAKE_UNIT_YEN};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate};
use dashmap::DashMap;
use log::info;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::fmt;

/// Relative score reported when a cohort or its dimension has no usable ROI.
pub const NEUTRAL_RELATIVE_SCORE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CohortDimension {
    SireCondition,
    JockeyCourse,
    HorseCourse,
    ClosingSpeed,
    PaceRecovery,
    StaminaRank,
}

impl CohortDimension {
    pub const ALL: [CohortDimension; 6] = [
        CohortDimension::SireCondition,
        CohortDimension::JockeyCourse,
        CohortDimension::HorseCourse,
        CohortDimension::ClosingSpeed,
        CohortDimension::PaceRecovery,
        CohortDimension::StaminaRank,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CohortDimension::SireCondition => "sire_condition",
            CohortDimension::JockeyCourse => "jockey_course",
            CohortDimension::HorseCourse => "horse_course",
            CohortDimension::ClosingSpeed => "closing_speed",
            CohortDimension::PaceRecovery => "pace_recovery",
            CohortDimension::StaminaRank => "stamina_rank",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|dimension| dimension.as_str() == normalized)
            .ok_or_else(|| {
                anyhow!(
                    "Unknown cohort dimension {} (expected one of: {})",
                    raw,
                    Self::ALL.map(|d| d.as_str()).join(", ")
                )
            })
    }

    pub fn min_samples(self, thresholds: &MinimumSamples) -> usize {
        match self {
            CohortDimension::SireCondition => thresholds.sire_condition,
            CohortDimension::JockeyCourse => thresholds.jockey_course,
            CohortDimension::HorseCourse => thresholds.horse_course,
            CohortDimension::ClosingSpeed => thresholds.closing_speed,
            CohortDimension::PaceRecovery => thresholds.pace_recovery,
            CohortDimension::StaminaRank => thresholds.stamina_rank,
        }
    }
}

impl fmt::Display for CohortDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Previous-race final 3F rank buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosingBucket {
    Fastest,
    Quick,
    Midfield,
    Slow,
}

impl ClosingBucket {
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => ClosingBucket::Fastest,
            2..=3 => ClosingBucket::Quick,
            4..=6 => ClosingBucket::Midfield,
            _ => ClosingBucket::Slow,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClosingBucket::Fastest => "fastest",
            ClosingBucket::Quick => "quick",
            ClosingBucket::Midfield => "midfield",
            ClosingBucket::Slow => "slow",
        }
    }
}

/// In-race stamina index rank buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaminaBucket {
    Top,
    Middle,
    Bottom,
}

impl StaminaBucket {
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0..=3 => StaminaBucket::Top,
            4..=8 => StaminaBucket::Middle,
            _ => StaminaBucket::Bottom,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StaminaBucket::Top => "top",
            StaminaBucket::Middle => "middle",
            StaminaBucket::Bottom => "bottom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CohortKey {
    SireCondition {
        sire_id: String,
        surface: Surface,
        going: Going,
    },
    JockeyCourse {
        jockey_code: String,
        venue: u8,
        surface: Surface,
        distance: DistanceCategory,
    },
    HorseCourse {
        horse_id: String,
        venue: u8,
        surface: Surface,
        distance: DistanceCategory,
    },
    ClosingSpeed {
        bucket: ClosingBucket,
        band: PopularityBand,
    },
    PaceRecovery {
        pattern: PacePattern,
        surface: Surface,
    },
    StaminaRank {
        bucket: StaminaBucket,
    },
}

impl CohortKey {
    pub fn dimension(&self) -> CohortDimension {
        match self {
            CohortKey::SireCondition { .. } => CohortDimension::SireCondition,
            CohortKey::JockeyCourse { .. } => CohortDimension::JockeyCourse,
            CohortKey::HorseCourse { .. } => CohortDimension::HorseCourse,
            CohortKey::ClosingSpeed { .. } => CohortDimension::ClosingSpeed,
            CohortKey::PaceRecovery { .. } => CohortDimension::PaceRecovery,
            CohortKey::StaminaRank { .. } => CohortDimension::StaminaRank,
        }
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CohortKey::SireCondition {
                sire_id,
                surface,
                going,
            } => write!(f, "sire {} / {} / {}", sire_id, surface.as_str(), going.as_str()),
            CohortKey::JockeyCourse {
                jockey_code,
                venue,
                surface,
                distance,
            } => write!(
                f,
                "jockey {} / {} {} {}",
                jockey_code,
                crate::models::venue_name(*venue),
                surface.as_str(),
                distance.as_str()
            ),
            CohortKey::HorseCourse {
                horse_id,
                venue,
                surface,
                distance,
            } => write!(
                f,
                "horse {} / {} {} {}",
                horse_id,
                crate::models::venue_name(*venue),
                surface.as_str(),
                distance.as_str()
            ),
            CohortKey::ClosingSpeed { bucket, band } => {
                write!(f, "closing {} / {}", bucket.as_str(), band.as_str())
            }
            CohortKey::PaceRecovery { pattern, surface } => {
                write!(f, "pace {} / {}", pattern.as_str(), surface.as_str())
            }
            CohortKey::StaminaRank { bucket } => write!(f, "stamina {}", bucket.as_str()),
        }
    }
}

/// Where a row falls within one cohort dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortAssignment {
    Key(CohortKey),
    /// The row lacks the attribute the dimension groups by (no pedigree, first start).
    Unknown,
    /// The dimension does not apply to this race.
    NotApplicable,
}

/// Assigns a row to its cohort. Only pre-race attributes are used, so history and
/// target rows are grouped identically.
pub fn assign_cohort(
    dimension: CohortDimension,
    row: &JoinedRow,
    stamina_distance_threshold_m: u32,
) -> CohortAssignment {
    let key = match dimension {
        CohortDimension::SireCondition => row.sire_id.clone().map(|sire_id| CohortKey::SireCondition {
            sire_id,
            surface: row.surface,
            going: row.going,
        }),
        CohortDimension::JockeyCourse => {
            (!row.jockey_code.is_empty()).then(|| CohortKey::JockeyCourse {
                jockey_code: row.jockey_code.clone(),
                venue: row.venue,
                surface: row.surface,
                distance: row.distance_category(),
            })
        }
        CohortDimension::HorseCourse => Some(CohortKey::HorseCourse {
            horse_id: row.horse_id.clone(),
            venue: row.venue,
            surface: row.surface,
            distance: row.distance_category(),
        }),
        CohortDimension::ClosingSpeed => {
            row.prior.prev_closing_rank.map(|rank| CohortKey::ClosingSpeed {
                bucket: ClosingBucket::from_rank(rank),
                band: row.popularity_band(),
            })
        }
        CohortDimension::PaceRecovery => {
            row.prior.prev_pace_pattern.map(|pattern| CohortKey::PaceRecovery {
                pattern,
                surface: row.surface,
            })
        }
        CohortDimension::StaminaRank => {
            if row.distance_m < stamina_distance_threshold_m {
                return CohortAssignment::NotApplicable;
            }
            row.stamina_rank.map(|rank| CohortKey::StaminaRank {
                bucket: StaminaBucket::from_rank(rank),
            })
        }
    };
    key.map_or(CohortAssignment::Unknown, CohortAssignment::Key)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CohortRoi {
    Sufficient {
        roi_pct: f64,
        samples: usize,
        /// Share of observations that finished first.
        win_rate: f64,
        /// Share of observations that finished in the first three.
        top3_rate: f64,
        /// Date of the most recent observation in the window.
        latest_sample: NaiveDate,
    },
    Insufficient {
        samples: usize,
    },
    NotApplicable,
}

impl CohortRoi {
    pub fn roi_pct(&self) -> Option<f64> {
        match self {
            CohortRoi::Sufficient { roi_pct, .. } => Some(*roi_pct),
            _ => None,
        }
    }

    pub fn win_rate(&self) -> Option<f64> {
        match self {
            CohortRoi::Sufficient { win_rate, .. } => Some(*win_rate),
            _ => None,
        }
    }

    pub fn top3_rate(&self) -> Option<f64> {
        match self {
            CohortRoi::Sufficient { top3_rate, .. } => Some(*top3_rate),
            _ => None,
        }
    }

    pub fn latest_sample(&self) -> Option<NaiveDate> {
        match self {
            CohortRoi::Sufficient { latest_sample, .. } => Some(*latest_sample),
            _ => None,
        }
    }

    pub fn samples(&self) -> usize {
        match self {
            CohortRoi::Sufficient { samples, .. } | CohortRoi::Insufficient { samples } => {
                *samples
            }
            CohortRoi::NotApplicable => 0,
        }
    }

    pub fn is_sufficient(&self) -> bool {
        matches!(self, CohortRoi::Sufficient { .. })
    }
}

/// One settled bet of a cohort.
#[derive(Debug, Clone, Copy)]
struct Observation {
    date: NaiveDate,
    payout: f64,
    finish_position: u8,
}

/// Observations of one cohort ordered by race date. Entry `i` of each prefix vector
/// covers the first `i` observations.
struct Partition {
    dates: Vec<NaiveDate>,
    cumulative_payout: Vec<f64>,
    cumulative_wins: Vec<usize>,
    cumulative_top3: Vec<usize>,
}

impl Partition {
    fn from_observations(mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|observation| observation.date);
        let capacity = observations.len() + 1;
        let mut partition = Self {
            dates: Vec::with_capacity(observations.len()),
            cumulative_payout: Vec::with_capacity(capacity),
            cumulative_wins: Vec::with_capacity(capacity),
            cumulative_top3: Vec::with_capacity(capacity),
        };
        partition.cumulative_payout.push(0.0);
        partition.cumulative_wins.push(0);
        partition.cumulative_top3.push(0);
        let (mut payout, mut wins, mut top3) = (0.0, 0, 0);
        for observation in observations {
            payout += observation.payout;
            wins += usize::from(observation.finish_position == 1);
            top3 += usize::from(observation.finish_position <= 3);
            partition.dates.push(observation.date);
            partition.cumulative_payout.push(payout);
            partition.cumulative_wins.push(wins);
            partition.cumulative_top3.push(top3);
        }
        partition
    }

    /// A lookback reaching past the earliest representable date keeps the whole history.
    fn window(&self, as_of: NaiveDate, lookback_days: Option<u32>) -> (usize, usize) {
        let end = self.dates.partition_point(|date| *date < as_of);
        let window_start = lookback_days
            .and_then(|days| as_of.checked_sub_signed(Duration::days(i64::from(days))));
        let start = match window_start {
            Some(window_start) => self.dates[..end].partition_point(|date| *date < window_start),
            None => 0,
        };
        (start, end)
    }
}

/// Immutable cohort partitions plus a memo of `(key, as_of)` results.
pub struct CohortEngine {
    partitions: HashMap<CohortKey, Partition>,
    cache: DashMap<(CohortKey, NaiveDate), CohortRoi>,
    min_samples: MinimumSamples,
    lookback_days: Option<u32>,
    stamina_distance_threshold_m: u32,
    bet_kind: BetKind,
}

impl CohortEngine {
    /// Builds partitions from rows carrying outcomes. Rows without an outcome are ignored.
    pub fn build(history: &[JoinedRow], settings: &PipelineSettings, pool: &ThreadPool) -> Self {
        let bet_kind = settings.bet_kind;
        let threshold = settings.stamina_distance_threshold_m;

        let grouped: HashMap<CohortKey, Vec<Observation>> = pool.install(|| {
            CohortDimension::ALL
                .par_iter()
                .map(|&dimension| {
                    let mut groups: HashMap<CohortKey, Vec<Observation>> = HashMap::new();
                    for row in history {
                        let Some(outcome) = row.outcome.as_ref() else {
                            continue;
                        };
                        if let CohortAssignment::Key(key) = assign_cohort(dimension, row, threshold)
                        {
                            groups.entry(key).or_default().push(Observation {
                                date: row.race_date,
                                payout: outcome.bet_return(bet_kind),
                                finish_position: outcome.finish_position,
                            });
                        }
                    }
                    groups
                })
                .reduce(HashMap::new, |mut acc, groups| {
                    acc.extend(groups);
                    acc
                })
        });

        let partitions: HashMap<CohortKey, Partition> = pool.install(|| {
            grouped
                .into_par_iter()
                .map(|(key, observations)| (key, Partition::from_observations(observations)))
                .collect()
        });

        info!(
            "Built {} cohort partitions from {} history rows ({} bets)",
            partitions.len(),
            history.len(),
            bet_kind.label()
        );

        Self {
            partitions,
            cache: DashMap::new(),
            min_samples: settings.min_samples,
            lookback_days: settings.cohort_lookback_days,
            stamina_distance_threshold_m: threshold,
            bet_kind,
        }
    }

    pub fn bet_kind(&self) -> BetKind {
        self.bet_kind
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// ROI of `key` from observations dated strictly before `as_of`.
    pub fn query(&self, key: &CohortKey, as_of: NaiveDate) -> CohortRoi {
        if let Some(cached) = self.cache.get(&(key.clone(), as_of)) {
            return *cached;
        }
        *self
            .cache
            .entry((key.clone(), as_of))
            .or_insert_with(|| self.compute(key, as_of))
    }

    /// ROI for the cohort `row` belongs to, as of the row's race date.
    pub fn lookup(&self, dimension: CohortDimension, row: &JoinedRow) -> CohortRoi {
        match assign_cohort(dimension, row, self.stamina_distance_threshold_m) {
            CohortAssignment::Key(key) => self.query(&key, row.race_date),
            CohortAssignment::Unknown => CohortRoi::Insufficient { samples: 0 },
            CohortAssignment::NotApplicable => CohortRoi::NotApplicable,
        }
    }

    fn compute(&self, key: &CohortKey, as_of: NaiveDate) -> CohortRoi {
        let Some(partition) = self.partitions.get(key) else {
            return CohortRoi::Insufficient { samples: 0 };
        };
        let (start, end) = partition.window(as_of, self.lookback_days);
        let samples = end - start;
        if samples == 0 || samples < key.dimension().min_samples(&self.min_samples) {
            return CohortRoi::Insufficient { samples };
        }
        let payout = partition.cumulative_payout[end] - partition.cumulative_payout[start];
        let wins = partition.cumulative_wins[end] - partition.cumulative_wins[start];
        let top3 = partition.cumulative_top3[end] - partition.cumulative_top3[start];
        CohortRoi::Sufficient {
            roi_pct: payout / (samples as f64 * STAKE_UNIT_YEN) * 100.0,
            samples,
            win_rate: wins as f64 / samples as f64,
            top3_rate: top3 as f64 / samples as f64,
            latest_sample: partition.dates[end - 1],
        }
    }

    /// Sufficient cohorts of one dimension ranked by ROI, best first.
    pub fn top_cohorts(
        &self,
        dimension: CohortDimension,
        as_of: NaiveDate,
        top_n: usize,
    ) -> Vec<(CohortKey, CohortRoi)> {
        let mut ranked = self.sufficient_cohorts(dimension, as_of);
        ranked.sort_by(|(key_a, a), (key_b, b)| {
            let roi_a = a.roi_pct().unwrap_or(f64::NEG_INFINITY);
            let roi_b = b.roi_pct().unwrap_or(f64::NEG_INFINITY);
            roi_b
                .total_cmp(&roi_a)
                .then_with(|| b.samples().cmp(&a.samples()))
                .then_with(|| key_a.to_string().cmp(&key_b.to_string()))
        });
        ranked.truncate(top_n);
        ranked
    }

    /// Mean ROI over the dimension's sufficient cohorts as of `as_of`.
    pub fn dimension_mean_roi(&self, dimension: CohortDimension, as_of: NaiveDate) -> Option<f64> {
        let rois: Vec<f64> = self
            .sufficient_cohorts(dimension, as_of)
            .iter()
            .filter_map(|(_, roi)| roi.roi_pct())
            .collect();
        if rois.is_empty() {
            None
        } else {
            Some(rois.iter().sum::<f64>() / rois.len() as f64)
        }
    }

    /// Cohort ROI relative to the dimension mean, scaled so that 100 is average.
    pub fn relative_score(&self, key: &CohortKey, as_of: NaiveDate) -> f64 {
        let Some(roi) = self.query(key, as_of).roi_pct() else {
            return NEUTRAL_RELATIVE_SCORE;
        };
        match self.dimension_mean_roi(key.dimension(), as_of) {
            Some(mean) if mean > 0.0 => roi / mean * 100.0,
            _ => NEUTRAL_RELATIVE_SCORE,
        }
    }

    fn sufficient_cohorts(
        &self,
        dimension: CohortDimension,
        as_of: NaiveDate,
    ) -> Vec<(CohortKey, CohortRoi)> {
        self.partitions
            .iter()
            .filter(|(key, _)| key.dimension() == dimension)
            .filter_map(|(key, _)| {
                let roi = self.query(key, as_of);
                roi.is_sufficient().then(|| (key.clone(), roi))
            })
            .collect()
    }
}

/// Worker pool bounded by the available cores.
pub fn build_worker_pool(threads: Option<usize>) -> Result<ThreadPool> {
    let num_threads = threads
        .unwrap_or_else(num_cpus::get)
        .clamp(1, std::cmp::max(1, num_cpus::get()));
    ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|idx| format!("racing-roi-worker-{idx}"))
        .build()
        .context("Failed to build worker pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{Outcome, PriorForm};
    use crate::models::RaceId;
    use chrono::Datelike;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 3, d).unwrap()
    }

    fn history_row(date: NaiveDate, race_number: u8, win_return: f64) -> JoinedRow {
        JoinedRow {
            race_id: RaceId::new(2023, (300 + date.day()) as u16, 5, race_number),
            race_date: date,
            venue: 5,
            distance_m: 1600,
            surface: Surface::Dirt,
            going: Going::Good,
            weather_code: 1,
            horse_id: format!("H{race_number}"),
            sire_id: Some("S1".into()),
            horse_number: 1,
            post_position: 1,
            jockey_code: "J1".into(),
            trainer_code: "T1".into(),
            field_size: 10,
            popularity: Some(5),
            win_odds: Some(10.0),
            prior: PriorForm::default(),
            stamina_rank: None,
            outcome: Some(Outcome {
                finish_position: if win_return > 0.0 { 1 } else { 5 },
                closing_rank: None,
                win_return,
                place_return: 0.0,
                finalized_on: date,
            }),
        }
    }

    fn engine(rows: &[JoinedRow], min_samples: usize, lookback: Option<u32>) -> CohortEngine {
        let settings = PipelineSettings {
            min_samples: MinimumSamples::uniform(min_samples),
            cohort_lookback_days: lookback,
            ..PipelineSettings::default()
        };
        let pool = build_worker_pool(Some(2)).unwrap();
        CohortEngine::build(rows, &settings, &pool)
    }

    fn sire_key() -> CohortKey {
        CohortKey::SireCondition {
            sire_id: "S1".into(),
            surface: Surface::Dirt,
            going: Going::Good,
        }
    }

    #[test]
    fn roi_is_payout_over_unit_stakes() {
        let rows = vec![
            history_row(day(1), 1, 0.0),
            history_row(day(2), 2, 250.0),
            history_row(day(3), 3, 0.0),
        ];
        let engine = engine(&rows, 3, None);
        let roi = engine.query(&sire_key(), day(10));
        assert_eq!(roi.samples(), 3);
        assert!((roi.roi_pct().unwrap() - 83.333_333).abs() < 1e-4);
        assert_eq!(roi.latest_sample(), Some(day(3)));
    }

    #[test]
    fn win_and_top3_rates_follow_the_query_window() {
        let mut third = history_row(day(3), 3, 0.0);
        if let Some(outcome) = third.outcome.as_mut() {
            outcome.finish_position = 3;
        }
        let rows = vec![
            history_row(day(1), 1, 0.0),
            history_row(day(2), 2, 250.0),
            third,
            history_row(day(4), 4, 0.0),
        ];
        let engine = engine(&rows, 1, None);

        let all = engine.query(&sire_key(), day(10));
        assert_eq!(all.win_rate(), Some(0.25));
        assert_eq!(all.top3_rate(), Some(0.5));

        let before_third = engine.query(&sire_key(), day(3));
        assert_eq!(before_third.win_rate(), Some(0.5));
        assert_eq!(before_third.top3_rate(), Some(0.5));
        assert_eq!(CohortRoi::Insufficient { samples: 2 }.win_rate(), None);
    }

    #[test]
    fn queries_exclude_same_day_and_later_observations() {
        let rows = vec![
            history_row(day(1), 1, 300.0),
            history_row(day(5), 2, 0.0),
            history_row(day(5), 3, 900.0),
        ];
        let engine = engine(&rows, 1, None);
        let on_race_day = engine.query(&sire_key(), day(5));
        assert_eq!(on_race_day.samples(), 1);
        assert_eq!(on_race_day.roi_pct(), Some(300.0));
        assert_eq!(engine.query(&sire_key(), day(1)), CohortRoi::Insufficient { samples: 0 });
    }

    #[test]
    fn below_threshold_is_insufficient_not_zero() {
        let rows = vec![history_row(day(1), 1, 0.0), history_row(day(2), 2, 0.0)];
        let engine = engine(&rows, 3, None);
        assert_eq!(engine.query(&sire_key(), day(9)), CohortRoi::Insufficient { samples: 2 });
    }

    #[test]
    fn lookback_window_trims_old_observations() {
        let rows = vec![
            history_row(day(1), 1, 500.0),
            history_row(day(20), 2, 100.0),
        ];
        let engine = engine(&rows, 1, Some(10));
        let roi = engine.query(&sire_key(), day(25));
        assert_eq!(roi.samples(), 1);
        assert_eq!(roi.roi_pct(), Some(100.0));
    }

    #[test]
    fn lookback_beyond_the_calendar_keeps_full_history() {
        let rows = vec![
            history_row(day(1), 1, 500.0),
            history_row(day(20), 2, 100.0),
        ];
        let engine = engine(&rows, 1, Some(u32::MAX));
        let roi = engine.query(&sire_key(), day(25));
        assert_eq!(roi.samples(), 2);
        assert_eq!(roi.roi_pct(), Some(300.0));
    }

    #[test]
    fn repeated_queries_hit_the_memo() {
        let rows = vec![history_row(day(1), 1, 200.0)];
        let engine = engine(&rows, 1, None);
        let first = engine.query(&sire_key(), day(2));
        let second = engine.query(&sire_key(), day(2));
        assert_eq!(first, second);
        assert_eq!(engine.cache.len(), 1);
    }

    #[test]
    fn top_cohorts_rank_by_roi_and_relative_score_centres_on_mean() {
        let mut rows = vec![history_row(day(1), 1, 400.0)];
        let mut other = history_row(day(2), 2, 0.0);
        other.sire_id = Some("S2".into());
        rows.push(other);
        let engine = engine(&rows, 1, None);

        let top = engine.top_cohorts(CohortDimension::SireCondition, day(3), 5);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].0, sire_key());
        assert_eq!(engine.dimension_mean_roi(CohortDimension::SireCondition, day(3)), Some(200.0));
        assert_eq!(engine.relative_score(&sire_key(), day(3)), 200.0);
        assert_eq!(engine.relative_score(&sire_key(), day(1)), NEUTRAL_RELATIVE_SCORE);
    }

    #[test]
    fn dimensions_parse_from_cli_names() {
        assert_eq!(
            CohortDimension::parse("pace-recovery").unwrap(),
            CohortDimension::PaceRecovery
        );
        assert!(CohortDimension::parse("trainer").is_err());
    }
}
