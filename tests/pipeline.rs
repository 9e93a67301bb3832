mod common;

use anyhow::{anyhow, Result};
use common::{assert_close, date, sire_history, stayers, Fixture, SIRE_ONE};
use racing_roi::cohort::build_worker_pool;
use racing_roi::config::PipelineSettings;
use racing_roi::context::pipeline_settings;
use racing_roi::data_context::RaceData;
use racing_roi::errors::{pipeline_error, PipelineError};
use racing_roi::features::{
    build_feature_matrix, FeatureMatrix, FeatureRow, MatrixPurpose, INSUFFICIENT_SENTINEL,
    NOT_APPLICABLE_SENTINEL,
};
use racing_roi::join::{join_batch, OutcomeMode};
use racing_roi::model::{ModelFacade, SearchSpace, TrainerBackend, TrainingJob};
use racing_roi::models::{DateRange, PayoutEntry};

const SIRE_ONE_ROI: f64 = 500.0 / 600.0 * 100.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn range(start: (u32, u32), end: (u32, u32)) -> DateRange {
    DateRange::new(date(start.0, start.1), date(end.0, end.1)).expect("valid range")
}

fn matrix(data: &RaceData, range: DateRange, purpose: MatrixPurpose) -> Result<FeatureMatrix> {
    let settings = pipeline_settings(data)?;
    let pool = build_worker_pool(Some(2))?;
    build_feature_matrix(data, range, &settings, &pool, purpose)
}

fn row<'a>(matrix: &'a FeatureMatrix, horse_id: &str) -> &'a FeatureRow {
    matrix
        .rows
        .iter()
        .find(|row| row.horse_id == horse_id)
        .unwrap_or_else(|| panic!("no feature row for {horse_id}"))
}

fn value(row: &FeatureRow, column: &str) -> f64 {
    row.value(column)
        .unwrap_or_else(|| panic!("unknown column {column}"))
}

/// Sire history plus a 20 January race (won by horse 2 at 150 yen) and a 25 January race
/// (won by horse 1 at 900 yen). Both reuse horses from the 4 January race.
fn season() -> Fixture {
    let mut fixture = sire_history();
    fixture.two_runner_race(date(1, 20), 1, 1600, ["A4", "B5"], ["J1", "J2"], Some((2, 150)));
    fixture.two_runner_race(date(1, 25), 1, 1600, ["A4", "B5"], ["J1", "J2"], Some((1, 900)));
    fixture
}

struct UnusedTrainer;

impl TrainerBackend for UnusedTrainer {
    fn train(&self, _job: &TrainingJob<'_>) -> Result<String> {
        Err(anyhow!("trainer should not run"))
    }
}

#[test]
fn sire_cohort_roi_reaches_the_feature_matrix() -> Result<()> {
    init_logging();
    let mut fixture = sire_history();
    fixture.two_runner_race(date(1, 20), 1, 1600, ["T1", "T2"], ["J3", "J2"], None);
    let data = fixture.build();

    let features = matrix(&data, range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;
    assert_eq!(features.len(), 2);
    assert!(features.labels.is_none());
    features.verify_point_in_time()?;

    let sire_one = row(&features, "T1");
    assert_close(value(sire_one, "sire_condition_roi"), SIRE_ONE_ROI);
    assert_eq!(value(sire_one, "sire_condition_sufficient"), 1.0);
    assert_eq!(sire_one.history_cutoff, Some(date(1, 9)));

    let sire_two = row(&features, "T2");
    assert_close(value(sire_two, "sire_condition_roi"), 125.0);
    assert_close(value(sire_two, "jockey_course_roi"), 125.0);
    Ok(())
}

#[test]
fn jockey_without_prior_rides_gets_the_insufficient_sentinel() -> Result<()> {
    let mut fixture = sire_history();
    fixture.two_runner_race(date(1, 20), 1, 1600, ["T1", "T2"], ["J3", "J2"], None);
    let features = matrix(&fixture.build(), range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;

    let newcomer = row(&features, "T1");
    assert_eq!(value(newcomer, "jockey_course_roi"), INSUFFICIENT_SENTINEL);
    assert_eq!(value(newcomer, "jockey_course_sufficient"), 0.0);
    // First start: no prior form either.
    assert_eq!(value(newcomer, "prev_finish"), INSUFFICIENT_SENTINEL);
    assert_eq!(value(newcomer, "horse_course_roi"), INSUFFICIENT_SENTINEL);
    Ok(())
}

#[test]
fn stamina_features_are_not_applicable_below_the_threshold() -> Result<()> {
    let mut fixture = sire_history();
    fixture.two_runner_race(date(1, 20), 1, 2400, ["M1", "M2"], ["J1", "J2"], None);
    fixture.two_runner_race(date(1, 20), 2, 3200, ["L1", "L2"], ["J1", "J2"], None);
    let features = matrix(&fixture.build(), range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;

    let middle = row(&features, "M1");
    assert_eq!(value(middle, "stamina_index"), NOT_APPLICABLE_SENTINEL);
    assert_eq!(value(middle, "stamina_rank_roi"), NOT_APPLICABLE_SENTINEL);
    assert_eq!(value(middle, "stamina_rank_sufficient"), 0.0);
    assert_eq!(value(middle, "jockey_course_roi"), INSUFFICIENT_SENTINEL);

    let long = row(&features, "L1");
    assert_eq!(value(long, "stamina_index"), INSUFFICIENT_SENTINEL);
    assert_eq!(value(long, "stamina_rank_roi"), INSUFFICIENT_SENTINEL);
    assert_eq!(value(long, "stamina_rank_sufficient"), 0.0);
    Ok(())
}

#[test]
fn stayers_get_closing_pace_and_stamina_cohorts() -> Result<()> {
    init_logging();
    let features = matrix(&stayers().build(), range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;
    features.verify_point_in_time()?;

    let winner = row(&features, "P1");
    // Closed fastest last time and is first favourite: five bets at 200 yen.
    assert_close(value(winner, "closing_speed_roi"), 200.0);
    assert_eq!(value(winner, "closing_speed_sufficient"), 1.0);
    assert_close(value(winner, "sire_condition_roi"), 200.0);
    assert_close(value(winner, "stamina_index"), 1.0);

    let loser = row(&features, "P2");
    assert_eq!(value(loser, "closing_speed_roi"), 0.0);
    assert_eq!(value(loser, "closing_speed_sufficient"), 1.0);
    assert_close(value(loser, "stamina_index"), 0.0);

    // Both prior runs were neutral and both horses rank in the top stamina bucket, so
    // each of those cohorts holds ten bets returning 1000 yen.
    for runner in [winner, loser] {
        assert_close(value(runner, "pace_recovery_roi"), 100.0);
        assert_eq!(value(runner, "pace_recovery_sufficient"), 1.0);
        assert_close(value(runner, "stamina_rank_roi"), 100.0);
        assert_eq!(value(runner, "stamina_rank_sufficient"), 1.0);
    }
    Ok(())
}

#[test]
fn stamina_ranks_order_runners_by_stamina_index() -> Result<()> {
    let data = stayers().build();
    let settings = pipeline_settings(&data)?;
    let rows = join_batch(&data, range((1, 20), (1, 20)), OutcomeMode::Exclude, &settings)?;

    let rank = |horse_id: &str| {
        rows.iter()
            .find(|row| row.horse_id == horse_id)
            .and_then(|row| row.stamina_rank)
    };
    assert_eq!(rank("P1"), Some(1));
    assert_eq!(rank("P2"), Some(2));
    assert!(rows.iter().all(|row| row.outcome.is_none()));
    Ok(())
}

#[test]
fn place_bets_drive_cohort_roi_when_configured() -> Result<()> {
    let mut fixture = stayers();
    fixture
        .settings
        .insert("COHORT_BET_KIND".to_string(), "place".to_string());
    let features = matrix(&fixture.build(), range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;

    let winner = row(&features, "P1");
    assert_close(value(winner, "sire_condition_roi"), 110.0);
    assert_close(value(winner, "closing_speed_roi"), 110.0);
    assert_close(value(winner, "pace_recovery_roi"), 55.0);
    assert_eq!(value(row(&features, "P2"), "sire_condition_roi"), 0.0);
    Ok(())
}

#[test]
fn field_size_counts_scratched_entrants() -> Result<()> {
    let mut upcoming = sire_history();
    let race = upcoming.race(date(1, 20), 1, 1600);
    for (number, horse_id) in [(1, "X1"), (2, "X2"), (3, "X3")] {
        upcoming.horse(horse_id, SIRE_ONE);
        upcoming.entry(race, number, horse_id, "J1", None);
    }
    let predicted = matrix(&upcoming.build(), range((1, 20), (1, 20)), MatrixPurpose::Prediction)?;
    assert_eq!(predicted.len(), 3);

    let mut settled = upcoming.clone();
    settled.entrants.retain(|entrant| entrant.race_id != race);
    settled.entry(race, 1, "X1", "J1", Some(1));
    settled.entry(race, 2, "X2", "J1", Some(2));
    settled.entry(race, 3, "X3", "J1", None);
    settled.payout(race, 1, 180);
    let trained = matrix(&settled.build(), range((1, 20), (1, 20)), MatrixPurpose::Training)?;
    // The scratched horse has no training row but still counts towards the field.
    assert_eq!(trained.len(), 2);

    for horse_id in ["X1", "X2"] {
        assert_eq!(value(row(&predicted, horse_id), "field_size"), 3.0);
        assert_eq!(value(row(&trained, horse_id), "field_size"), 3.0);
    }
    Ok(())
}

#[test]
fn lookback_longer_than_the_calendar_keeps_all_history() -> Result<()> {
    let mut fixture = season();
    let unbounded = matrix(&fixture.build(), range((1, 25), (1, 25)), MatrixPurpose::Prediction)?;

    fixture
        .settings
        .insert("COHORT_LOOKBACK_DAYS".to_string(), "100000000".to_string());
    let bounded = matrix(&fixture.build(), range((1, 25), (1, 25)), MatrixPurpose::Prediction)?;

    assert_eq!(bounded.len(), unbounded.len());
    for (left, right) in bounded.rows.iter().zip(&unbounded.rows) {
        assert_eq!(left.values, right.values);
    }
    Ok(())
}

#[test]
fn same_day_results_are_not_counted() -> Result<()> {
    let mut fixture = sire_history();
    fixture.two_runner_race(date(1, 20), 1, 1600, ["T1", "T2"], ["J1", "J2"], Some((2, 150)));
    fixture.two_runner_race(date(1, 20), 2, 1600, ["U1", "U2"], ["J1", "J2"], Some((1, 1000)));
    let features = matrix(&fixture.build(), range((1, 20), (1, 20)), MatrixPurpose::Training)?;

    assert_eq!(features.len(), 4);
    for horse_id in ["T1", "U1"] {
        assert_close(value(row(&features, horse_id), "sire_condition_roi"), SIRE_ONE_ROI);
    }
    let labels = features.labels.as_ref().expect("training matrix has labels");
    let payouts = features.payouts.as_ref().expect("training matrix has payouts");
    let winner = features
        .rows
        .iter()
        .position(|row| row.horse_id == "U1")
        .expect("U1 row");
    assert_eq!(payouts[winner], 1000.0);
    assert_eq!(labels[winner], 10.0);
    Ok(())
}

fn late_runner(matrix: &FeatureMatrix) -> &FeatureRow {
    matrix
        .rows
        .iter()
        .find(|row| row.race_date == date(1, 25) && row.horse_number == 1)
        .expect("25 January runner")
}

#[test]
fn prediction_features_do_not_depend_on_the_window() -> Result<()> {
    let data = season().build();

    let wide = matrix(&data, range((1, 20), (1, 25)), MatrixPurpose::Prediction)?;
    let narrow = matrix(&data, range((1, 25), (1, 25)), MatrixPurpose::Prediction)?;
    let trained = matrix(&data, range((1, 20), (1, 25)), MatrixPurpose::Training)?;

    // The 20 January loss counts in every window: 500 yen over seven bets.
    assert_close(value(late_runner(&wide), "sire_condition_roi"), 500.0 / 700.0 * 100.0);
    assert_eq!(late_runner(&wide).values, late_runner(&narrow).values);
    assert_eq!(late_runner(&wide).values, late_runner(&trained).values);
    assert_eq!(late_runner(&wide).history_cutoff, Some(date(1, 20)));
    wide.verify_point_in_time()?;
    Ok(())
}

#[test]
fn truncating_the_future_leaves_earlier_features_unchanged() -> Result<()> {
    init_logging();
    let full = season().build();
    let truncated = full.restrict_to_date_range(None, Some(date(1, 20)))?;

    let full_matrix = matrix(&full, range((1, 4), (1, 25)), MatrixPurpose::Training)?;
    let truncated_matrix = matrix(&truncated, range((1, 4), (1, 20)), MatrixPurpose::Training)?;
    full_matrix.verify_point_in_time()?;

    assert_eq!(truncated_matrix.len() + 2, full_matrix.len());
    for expected in &truncated_matrix.rows {
        let actual = full_matrix
            .rows
            .iter()
            .find(|row| row.race_id == expected.race_id && row.horse_number == expected.horse_number)
            .expect("row present in the full matrix");
        assert_eq!(actual.values, expected.values, "race {}", expected.race_id);
    }

    let returning = full_matrix
        .rows
        .iter()
        .find(|row| row.race_date == date(1, 20) && row.horse_id == "A4")
        .expect("A4 on 20 January");
    assert_eq!(value(returning, "prev_finish"), 1.0);
    assert_eq!(value(returning, "days_since_last_run"), 16.0);
    Ok(())
}

#[test]
fn appending_a_batch_is_idempotent() -> Result<()> {
    let full = season().build();
    let early = full.restrict_to_date_range(None, Some(date(1, 9)))?;
    let late = full.restrict_to_date_range(Some(date(1, 20)), None)?;

    let merged = early.append(&late)?;
    let merged_again = merged.append(&late)?;
    assert_eq!(merged.races().len(), full.races().len());
    assert_eq!(merged_again.races().len(), full.races().len());
    assert_eq!(merged_again.entrants().len(), full.entrants().len());

    let window = range((1, 4), (1, 25));
    let expected = matrix(&full, window, MatrixPurpose::Training)?;
    for data in [&merged, &merged_again] {
        let actual = matrix(data, window, MatrixPurpose::Training)?;
        assert_eq!(actual.rows, expected.rows);
        assert_eq!(actual.labels, expected.labels);
    }
    Ok(())
}

fn integrity_failure(fixture: &Fixture) -> PipelineError {
    let err = matrix(&fixture.build(), range((1, 4), (1, 9)), MatrixPurpose::Training)
        .expect_err("batch should be rejected");
    pipeline_error(&err)
        .cloned()
        .unwrap_or_else(|| panic!("expected a pipeline error, got {err:#}"))
}

#[test]
fn race_with_results_but_no_payout_aborts_the_batch() {
    let mut fixture = sire_history();
    fixture.payouts.remove(2);
    let err = integrity_failure(&fixture);
    assert!(err.is_data_integrity());
    assert!(err.to_string().contains("no payout record"), "{err}");
}

#[test]
fn entrants_of_unknown_races_abort_the_batch() {
    let mut fixture = sire_history();
    let missing = racing_roi::models::RaceId::new(2021, 107, 5, 9);
    fixture.entry(missing, 1, "X1", "J1", Some(1));
    let err = integrity_failure(&fixture);
    assert!(err.is_data_integrity());
    assert!(err.to_string().contains("no race record"), "{err}");
}

#[test]
fn winner_without_a_win_payout_aborts_the_batch() {
    let mut fixture = sire_history();
    fixture.payouts[0].win = vec![PayoutEntry {
        horse_number: 2,
        amount_yen: 500,
    }];
    let err = integrity_failure(&fixture);
    assert!(err.is_data_integrity());
    assert!(err.to_string().contains("no win payout"), "{err}");
}

#[test]
fn leaked_rows_are_rejected_before_training() -> Result<()> {
    let data = season().build();
    let mut features = matrix(&data, range((1, 4), (1, 25)), MatrixPurpose::Training)?;
    features.verify_point_in_time()?;

    let corrupted = features
        .rows
        .iter()
        .position(|row| row.race_date == date(1, 20))
        .expect("20 January row");
    features.rows[corrupted].history_cutoff = Some(date(1, 20));
    features.rows[corrupted].cutoff_column = Some("sire_condition_roi");

    match features.verify_point_in_time() {
        Err(PipelineError::Leakage {
            column,
            source_date,
            ..
        }) => {
            assert_eq!(column, "sire_condition_roi");
            assert_eq!(source_date, date(1, 20));
        }
        other => panic!("expected leakage, got {other:?}"),
    }

    let facade = ModelFacade::new(UnusedTrainer, PipelineSettings::default());
    let err = facade
        .fit(&features, &SearchSpace::default())
        .expect_err("leaked matrix must not train");
    assert!(pipeline_error(&err).map_or(false, PipelineError::is_leakage));
    Ok(())
}
