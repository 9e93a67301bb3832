//! Aligns entrants with their race context, prior form and (optionally) outcomes.

use crate::config::{BetKind, PipelineSettings};
use crate::data_context::RaceData;
use crate::errors::PipelineError;
use crate::models::*;
use anyhow::Result;
use chrono::NaiveDate;
use log::{debug, warn};
use std::collections::HashMap;
use std::hash::Hash;

const RECENT_FORM_RUNS: usize = 5;
const PACE_CLOSER_MAX_RANK: u8 = 3;
const PACE_PLACED_MAX_FINISH: u8 = 3;
const PACE_SLOW_CLOSER_MIN_RANK: u8 = 5;

/// Controls whether realised outcomes are attached to joined rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeMode {
    /// No outcome on any row. Used when computing features.
    Exclude,
    /// Outcome on every row; races without results are skipped.
    Include,
    /// Outcome only for races dated strictly before the given date.
    FinalizedBefore(NaiveDate),
}

impl OutcomeMode {
    fn attaches(self, race_date: NaiveDate) -> bool {
        match self {
            OutcomeMode::Exclude => false,
            OutcomeMode::Include => true,
            OutcomeMode::FinalizedBefore(cutoff) => race_date < cutoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub finish_position: u8,
    /// Rank of the final 3F time within the race (1 = fastest, ties share the lower rank).
    pub closing_rank: Option<u8>,
    /// Yen returned per 100-yen win stake; 0 for a losing bet.
    pub win_return: f64,
    pub place_return: f64,
    pub finalized_on: NaiveDate,
}

impl Outcome {
    pub fn bet_return(&self, kind: BetKind) -> f64 {
        match kind {
            BetKind::Win => self.win_return,
            BetKind::Place => self.place_return,
        }
    }
}

/// Shape of a horse's previous run relative to its closing speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacePattern {
    /// Closed among the fastest but still finished out of the frame.
    Disadvantaged,
    /// Placed without a fast finish.
    Favoured,
    Neutral,
}

impl PacePattern {
    pub fn classify(finish: u8, closing_rank: u8) -> Self {
        if closing_rank <= PACE_CLOSER_MAX_RANK && finish > PACE_PLACED_MAX_FINISH {
            PacePattern::Disadvantaged
        } else if finish <= PACE_PLACED_MAX_FINISH && closing_rank > PACE_SLOW_CLOSER_MIN_RANK {
            PacePattern::Favoured
        } else {
            PacePattern::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacePattern::Disadvantaged => "disadvantaged",
            PacePattern::Favoured => "favoured",
            PacePattern::Neutral => "neutral",
        }
    }
}

/// Form derived only from the horse's runs on earlier dates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorForm {
    pub starts: usize,
    pub last_run_date: Option<NaiveDate>,
    pub prev_finish: Option<u8>,
    pub prev_field_size: Option<u8>,
    pub prev_closing_rank: Option<u8>,
    pub prev_pace_pattern: Option<PacePattern>,
    pub days_since_last_run: Option<i64>,
    pub avg_finish_last5: Option<f64>,
    /// Mean finish percentile (1.0 = won) over earlier long-distance runs.
    pub stamina_index: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct JoinedRow {
    pub race_id: RaceId,
    pub race_date: NaiveDate,
    pub venue: u8,
    pub distance_m: u32,
    pub surface: Surface,
    pub going: Going,
    pub weather_code: u8,
    pub horse_id: String,
    pub sire_id: Option<String>,
    pub horse_number: u8,
    pub post_position: u8,
    pub jockey_code: String,
    pub trainer_code: String,
    pub field_size: u8,
    pub popularity: Option<u8>,
    pub win_odds: Option<f64>,
    pub prior: PriorForm,
    /// Rank of `prior.stamina_index` among the field (1 = strongest).
    pub stamina_rank: Option<u8>,
    pub outcome: Option<Outcome>,
}

impl JoinedRow {
    pub fn distance_category(&self) -> DistanceCategory {
        DistanceCategory::from_distance(self.distance_m)
    }

    pub fn popularity_band(&self) -> PopularityBand {
        PopularityBand::from_popularity(self.popularity)
    }
}

/// One completed run, as seen from later races.
#[derive(Debug, Clone)]
struct PastRun {
    date: NaiveDate,
    finish: u8,
    field_size: u8,
    runners: u8,
    closing_rank: Option<u8>,
    distance_m: u32,
}

struct RaceResults {
    finalized: bool,
    /// Declared entrants, scratched horses included.
    field_size: u8,
    runners: u8,
    closing_ranks: HashMap<u8, u8>,
}

/// Joins every entrant whose race falls in `range`. Rows are ordered by date, race and
/// horse number.
pub fn join_batch(
    data: &RaceData,
    range: DateRange,
    mode: OutcomeMode,
    settings: &PipelineSettings,
) -> Result<Vec<JoinedRow>, PipelineError> {
    let batch = format!("join batch {range}");
    check_integrity(data, range, &batch)?;

    let results: HashMap<RaceId, RaceResults> = data
        .races()
        .iter()
        .take_while(|race| race.date <= range.end)
        .map(|race| (race.id, race_results(data, race)))
        .collect();
    let runs_by_horse = past_runs_by_horse(data, range.end, &results);

    let mut rows = Vec::new();
    let mut missing_pedigree = 0usize;
    for race in data.races().iter().filter(|race| range.contains(race.date)) {
        let Some(race_results) = results.get(&race.id) else {
            continue;
        };
        let attach = mode.attaches(race.date);
        if mode == OutcomeMode::Include && !race_results.finalized {
            continue;
        }
        let payout = data.payout(race.id);

        let first_row = rows.len();
        for entrant in data.entrants_for_race(race.id) {
            if race_results.finalized && !entrant.is_runner() {
                continue;
            }
            let sire_id = match data.horse(&entrant.horse_id) {
                Some(horse) => horse.sire_id.clone(),
                None => {
                    missing_pedigree += 1;
                    None
                }
            };
            let prior = runs_by_horse
                .get(entrant.horse_id.as_str())
                .map(|runs| prior_form(runs, race.date, settings.stamina_history_min_distance_m))
                .unwrap_or_default();

            let outcome = match (attach, entrant.finish_position, payout) {
                (true, Some(finish_position), Some(payout)) => Some(Outcome {
                    finish_position,
                    closing_rank: race_results.closing_ranks.get(&entrant.horse_number).copied(),
                    win_return: payout.win_return(entrant.horse_number),
                    place_return: payout.place_return(entrant.horse_number),
                    finalized_on: race.date,
                }),
                _ => None,
            };

            rows.push(JoinedRow {
                race_id: race.id,
                race_date: race.date,
                venue: race.id.venue,
                distance_m: race.distance_m,
                surface: race.surface,
                going: race.going,
                weather_code: race.weather_code,
                horse_id: entrant.horse_id.clone(),
                sire_id,
                horse_number: entrant.horse_number,
                post_position: entrant.post_position,
                jockey_code: entrant.jockey_code.clone(),
                trainer_code: entrant.trainer_code.clone(),
                field_size: race_results.field_size,
                popularity: entrant.popularity,
                win_odds: entrant.win_odds,
                prior,
                stamina_rank: None,
                outcome,
            });
        }
        assign_stamina_ranks(&mut rows[first_row..]);
    }

    if missing_pedigree > 0 {
        warn!(
            "{}: {} rows have no pedigree record; their sire cohort is insufficient",
            batch, missing_pedigree
        );
    }
    debug!("{}: joined {} rows ({:?})", batch, rows.len(), mode);
    Ok(rows)
}

/// Checks linkage for every race the batch or its history depends on.
fn check_integrity(data: &RaceData, range: DateRange, batch: &str) -> Result<(), PipelineError> {
    for race_id in data.orphan_entrant_races() {
        let in_scope = race_id.date().map_or(true, |date| date <= range.end);
        if in_scope {
            return Err(PipelineError::integrity(
                batch,
                format!("entrants reference race {race_id}, which has no race record"),
            ));
        }
    }

    for race in data.races().iter().take_while(|race| race.date <= range.end) {
        let has_runners = data.entrants_for_race(race.id).any(Entrant::is_runner);
        if !has_runners {
            continue;
        }
        let Some(payout) = data.payout(race.id) else {
            return Err(PipelineError::integrity(
                batch,
                format!("race {} has results but no payout record", race.id),
            ));
        };
        for winner in data
            .entrants_for_race(race.id)
            .filter(|entrant| entrant.finish_position == Some(1))
        {
            if !payout.has_win_entry(winner.horse_number) {
                return Err(PipelineError::integrity(
                    batch,
                    format!(
                        "race {} winner (horse number {}) has no win payout",
                        race.id, winner.horse_number
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn race_results(data: &RaceData, race: &Race) -> RaceResults {
    let runners: Vec<&Entrant> = data
        .entrants_for_race(race.id)
        .filter(|entrant| entrant.is_runner())
        .collect();
    let finalized = !runners.is_empty() && data.payout(race.id).is_some();
    let field_size = data.entrants_for_race(race.id).count();
    let times: Vec<(u8, u32)> = runners
        .iter()
        .filter_map(|entrant| entrant.final_3f_tenths.map(|t| (entrant.horse_number, t)))
        .collect();
    RaceResults {
        finalized,
        field_size: field_size.min(u8::MAX as usize) as u8,
        runners: runners.len().min(u8::MAX as usize) as u8,
        closing_ranks: min_ranks(&times, |a, b| a < b),
    }
}

/// Competition ranking ("min" method): tied values share the best rank.
fn min_ranks<K, T>(values: &[(K, T)], better: impl Fn(T, T) -> bool) -> HashMap<K, u8>
where
    K: Copy + Eq + Hash,
    T: Copy,
{
    values
        .iter()
        .map(|&(key, value)| {
            let ahead = values
                .iter()
                .filter(|&&(_, other)| better(other, value))
                .count();
            (key, (ahead + 1).min(u8::MAX as usize) as u8)
        })
        .collect()
}

fn past_runs_by_horse<'a>(
    data: &'a RaceData,
    through: NaiveDate,
    results: &HashMap<RaceId, RaceResults>,
) -> HashMap<&'a str, Vec<PastRun>> {
    let mut runs: HashMap<&str, Vec<PastRun>> = HashMap::new();
    for race in data.races().iter().take_while(|race| race.date <= through) {
        let Some(race_results) = results.get(&race.id).filter(|r| r.finalized) else {
            continue;
        };
        for entrant in data.entrants_for_race(race.id) {
            let Some(finish) = entrant.finish_position else {
                continue;
            };
            runs.entry(entrant.horse_id.as_str()).or_default().push(PastRun {
                date: race.date,
                finish,
                field_size: race_results.field_size,
                runners: race_results.runners,
                closing_rank: race_results.closing_ranks.get(&entrant.horse_number).copied(),
                distance_m: race.distance_m,
            });
        }
    }
    runs
}

/// Races are visited in date order, so each horse's runs are already sorted.
fn prior_form(runs: &[PastRun], race_date: NaiveDate, stamina_min_distance_m: u32) -> PriorForm {
    let earlier = &runs[..runs.partition_point(|run| run.date < race_date)];
    let Some(previous) = earlier.last() else {
        return PriorForm::default();
    };

    let recent = &earlier[earlier.len().saturating_sub(RECENT_FORM_RUNS)..];
    let avg_finish_last5 =
        recent.iter().map(|run| run.finish as f64).sum::<f64>() / recent.len() as f64;

    let stamina_runs: Vec<f64> = earlier
        .iter()
        .filter(|run| run.distance_m >= stamina_min_distance_m)
        .map(finish_percentile)
        .collect();
    let stamina_index = if stamina_runs.is_empty() {
        None
    } else {
        Some(stamina_runs.iter().sum::<f64>() / stamina_runs.len() as f64)
    };

    PriorForm {
        starts: earlier.len(),
        last_run_date: Some(previous.date),
        prev_finish: Some(previous.finish),
        prev_field_size: Some(previous.field_size),
        prev_closing_rank: previous.closing_rank,
        prev_pace_pattern: previous
            .closing_rank
            .map(|rank| PacePattern::classify(previous.finish, rank)),
        days_since_last_run: Some((race_date - previous.date).num_days()),
        avg_finish_last5: Some(avg_finish_last5),
        stamina_index,
    }
}

fn finish_percentile(run: &PastRun) -> f64 {
    if run.runners <= 1 {
        return 1.0;
    }
    let finish = run.finish.min(run.runners) as f64;
    1.0 - (finish - 1.0) / (run.runners as f64 - 1.0)
}

fn assign_stamina_ranks(race_rows: &mut [JoinedRow]) {
    let indices: Vec<(usize, f64)> = race_rows
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| row.prior.stamina_index.map(|value| (idx, value)))
        .collect();
    let ranks = min_ranks(&indices, |a, b| a > b);
    for (idx, rank) in ranks {
        race_rows[idx].stamina_rank = Some(rank);
    }
}
