use crate::config::{PipelineSettings, TargetKind};
use crate::database::ModelRunRecord;
use crate::errors::PipelineError;
use crate::features::FeatureMatrix;
use crate::lightgbm::{Booster, Objective};
use crate::models::{RaceId, STAKE_UNIT_YEN};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

pub const DEFAULT_EARLY_STOPPING_ROUNDS: u32 = 100;
pub const DEFAULT_MAX_TRIALS: usize = 10;
pub const DEFAULT_SEARCH_SEED: u64 = 4242;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyperparameters {
    pub num_iterations: u32,
    pub learning_rate: f64,
    pub num_leaves: u32,
    pub max_depth: i32,
    pub min_data_in_leaf: u32,
    pub min_gain_to_split: f64,
    pub lambda_l1: f64,
    pub lambda_l2: f64,
    pub feature_fraction: f64,
    pub bagging_fraction: f64,
    pub bagging_freq: u32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            num_iterations: 800,
            learning_rate: 0.05,
            num_leaves: 15,
            max_depth: 5,
            min_data_in_leaf: 100,
            min_gain_to_split: 0.01,
            lambda_l1: 0.0,
            lambda_l2: 5.0,
            feature_fraction: 0.6,
            bagging_fraction: 0.6,
            bagging_freq: 5,
        }
    }
}

impl Hyperparameters {
    fn cli_args(&self) -> Vec<String> {
        vec![
            format!("num_iterations={}", self.num_iterations),
            format!("learning_rate={}", self.learning_rate),
            format!("num_leaves={}", self.num_leaves),
            format!("max_depth={}", self.max_depth),
            format!("min_data_in_leaf={}", self.min_data_in_leaf),
            format!("min_gain_to_split={}", self.min_gain_to_split),
            format!("lambda_l1={}", self.lambda_l1),
            format!("lambda_l2={}", self.lambda_l2),
            format!("feature_fraction={}", self.feature_fraction),
            format!("bagging_fraction={}", self.bagging_fraction),
            format!("bagging_freq={}", self.bagging_freq),
        ]
    }
}

/// Bounded random search around the default hyperparameters.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    pub max_trials: usize,
    pub early_stopping_round: u32,
    pub seed: u64,
    pub learning_rate: (f64, f64),
    pub num_leaves: (u32, u32),
    pub max_depth: (i32, i32),
    pub min_data_in_leaf: (u32, u32),
    pub lambda_l2: (f64, f64),
    pub feature_fraction: (f64, f64),
    pub bagging_fraction: (f64, f64),
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            max_trials: DEFAULT_MAX_TRIALS,
            early_stopping_round: DEFAULT_EARLY_STOPPING_ROUNDS,
            seed: DEFAULT_SEARCH_SEED,
            learning_rate: (0.01, 0.1),
            num_leaves: (7, 63),
            max_depth: (3, 8),
            min_data_in_leaf: (20, 200),
            lambda_l2: (0.0, 10.0),
            feature_fraction: (0.4, 1.0),
            bagging_fraction: (0.4, 1.0),
        }
    }
}

impl SearchSpace {
    /// Trial candidates: the defaults first, then seeded random samples.
    pub fn candidates(&self) -> Vec<Hyperparameters> {
        let trials = self.max_trials.max(1);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut candidates = Vec::with_capacity(trials);
        candidates.push(Hyperparameters::default());
        while candidates.len() < trials {
            candidates.push(Hyperparameters {
                learning_rate: rng.gen_range(self.learning_rate.0..=self.learning_rate.1),
                num_leaves: rng.gen_range(self.num_leaves.0..=self.num_leaves.1),
                max_depth: rng.gen_range(self.max_depth.0..=self.max_depth.1),
                min_data_in_leaf: rng.gen_range(self.min_data_in_leaf.0..=self.min_data_in_leaf.1),
                lambda_l2: rng.gen_range(self.lambda_l2.0..=self.lambda_l2.1),
                feature_fraction: rng.gen_range(self.feature_fraction.0..=self.feature_fraction.1),
                bagging_fraction: rng.gen_range(self.bagging_fraction.0..=self.bagging_fraction.1),
                ..Hyperparameters::default()
            });
        }
        candidates
    }
}

/// Dense rows with their labels.
#[derive(Debug, Clone, Default)]
pub struct LabeledSet {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
}

impl LabeledSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub struct TrainingJob<'a> {
    pub objective: Objective,
    pub params: &'a Hyperparameters,
    pub early_stopping_round: u32,
    pub train: &'a LabeledSet,
    pub validation: &'a LabeledSet,
}

/// Fits one model and returns it in LightGBM text format.
pub trait TrainerBackend: Send + Sync {
    fn train(&self, job: &TrainingJob<'_>) -> Result<String>;
}

/// Runs the LightGBM command line trainer.
pub struct LightGbmCli {
    executable: PathBuf,
    work_dir: PathBuf,
}

impl LightGbmCli {
    pub fn locate() -> Result<Self> {
        Ok(Self {
            executable: resolve_lightgbm_executable()?,
            work_dir: std::env::temp_dir(),
        })
    }
}

impl TrainerBackend for LightGbmCli {
    fn train(&self, job: &TrainingJob<'_>) -> Result<String> {
        let run_id = Uuid::new_v4();
        let train_path = self.work_dir.join(format!("racing-roi-{run_id}-train.libsvm"));
        let validation_path = self.work_dir.join(format!("racing-roi-{run_id}-valid.libsvm"));
        let model_path = self.work_dir.join(format!("racing-roi-{run_id}-model.txt"));

        write_libsvm_dataset(job.train, &train_path)?;
        write_libsvm_dataset(job.validation, &validation_path)?;

        let metric = match job.objective {
            Objective::Regression => "l2",
            Objective::Binary => "binary_logloss",
        };
        let mut args = vec![
            String::from("task=train"),
            format!("objective={}", job.objective.as_str()),
            format!("metric={metric}"),
            format!("data={}", train_path.to_string_lossy()),
            format!("valid_data={}", validation_path.to_string_lossy()),
            format!("output_model={}", model_path.to_string_lossy()),
        ];
        args.extend(job.params.cli_args());
        if job.early_stopping_round > 0 {
            args.push(format!("early_stopping_round={}", job.early_stopping_round));
        }
        args.push(String::from("verbosity=-1"));

        let status = Command::new(&self.executable)
            .args(&args)
            .status()
            .with_context(|| format!("Failed to spawn {}", self.executable.display()));

        let _ = fs::remove_file(&train_path);
        let _ = fs::remove_file(&validation_path);

        let status = status?;
        if !status.success() {
            let _ = fs::remove_file(&model_path);
            return Err(anyhow!("lightgbm training failed with status {status}"));
        }
        let text = fs::read_to_string(&model_path)
            .with_context(|| format!("LightGBM produced no model at {}", model_path.display()));
        let _ = fs::remove_file(&model_path);
        text
    }
}

fn write_libsvm_dataset(set: &LabeledSet, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for (features, label) in set.features.iter().zip(&set.labels) {
        let mut line = format!("{}", label);
        for (idx, value) in features.iter().enumerate() {
            line.push_str(&format!(" {}:{:.10}", idx, value));
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

fn resolve_lightgbm_executable() -> Result<PathBuf> {
    let binary = if cfg!(windows) { "lightgbm.exe" } else { "lightgbm" };
    let vendor_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("vendor").join(binary);
    if vendor_path.exists() {
        return Ok(vendor_path);
    }
    if let Some(path) = find_in_path(binary) {
        return Ok(path);
    }
    Err(anyhow!(
        "{binary} executable not found in vendor/ or PATH; install the LightGBM CLI to train models"
    ))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_value = std::env::var_os("PATH")?;
    std::env::split_paths(&path_value)
        .map(|entry| entry.join(binary))
        .find(|candidate| candidate.exists())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMetrics {
    pub rmse: f64,
    pub races: usize,
    /// Share of races where the top-scored horse returned a payout.
    pub top_pick_hit_rate: f64,
    /// Return of staking one unit on the top-scored horse of every race, in percent.
    pub top_pick_roi_pct: f64,
}

impl ValidationMetrics {
    /// Higher ROI wins; equal ROI falls back to lower RMSE.
    fn better_than(&self, other: &ValidationMetrics) -> bool {
        match self.top_pick_roi_pct.total_cmp(&other.top_pick_roi_pct) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.rmse < other.rmse,
        }
    }
}

/// Scores rows and evaluates them race by race.
pub fn evaluate(
    scores: &[f64],
    labels: &[f64],
    payouts: &[f64],
    race_ids: &[RaceId],
) -> Option<ValidationMetrics> {
    if scores.is_empty() || scores.iter().any(|score| !score.is_finite()) {
        return None;
    }
    let squared: f64 = scores
        .iter()
        .zip(labels)
        .map(|(score, label)| (score - label).powi(2))
        .sum();
    let rmse = (squared / scores.len() as f64).sqrt();

    let mut top_pick: HashMap<RaceId, usize> = HashMap::new();
    for (idx, race_id) in race_ids.iter().enumerate() {
        top_pick
            .entry(*race_id)
            .and_modify(|best| {
                if scores[idx] > scores[*best] {
                    *best = idx;
                }
            })
            .or_insert(idx);
    }
    let races = top_pick.len();
    let hits = top_pick.values().filter(|&&idx| payouts[idx] > 0.0).count();
    let returned: f64 = top_pick.values().map(|&idx| payouts[idx]).sum();

    Some(ValidationMetrics {
        rmse,
        races,
        top_pick_hit_rate: hits as f64 / races as f64,
        top_pick_roi_pct: returned / (races as f64 * STAKE_UNIT_YEN) * 100.0,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub trial: usize,
    pub hyperparameters: Hyperparameters,
    pub trees: usize,
    pub metrics: ValidationMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSummary {
    pub objective: String,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub validation_start_date: NaiveDate,
    pub trials_attempted: usize,
    pub trials: Vec<TrialResult>,
    pub best_trial: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub race_id: RaceId,
    pub horse_id: String,
    pub horse_number: u8,
    pub score: f64,
}

/// A fitted booster with the column layout it was trained on.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    booster: Booster,
    model_text: String,
    columns: Vec<String>,
    pub params: Option<Hyperparameters>,
    pub metrics: Option<ValidationMetrics>,
}

impl TrainedModel {
    pub fn from_model_text(text: &str, columns: Vec<String>) -> Result<Self> {
        let booster = Booster::from_model_text(text)
            .map_err(|err| PipelineError::InvalidModel(err.to_string()))?;
        if booster.num_features() != columns.len() {
            return Err(PipelineError::InvalidModel(format!(
                "model expects {} features but {} columns were supplied",
                booster.num_features(),
                columns.len()
            ))
            .into());
        }
        Ok(Self {
            booster,
            model_text: text.to_string(),
            columns,
            params: None,
            metrics: None,
        })
    }

    pub fn from_run_record(record: &ModelRunRecord) -> Result<Self> {
        let mut model = Self::from_model_text(&record.tree_text, record.feature_columns.clone())?;
        model.params = serde_json::from_value(record.hyperparameters.clone()).ok();
        model.metrics = serde_json::from_value(record.metrics.clone()).ok();
        Ok(model)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, columns: Vec<String>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        Self::from_model_text(&text, columns)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &self.model_text)
            .with_context(|| format!("Failed to write model file {}", path.display()))
    }

    pub fn objective(&self) -> Objective {
        self.booster.objective()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn num_trees(&self) -> usize {
        self.booster.num_trees()
    }

    pub fn run_record(&self, name: &str) -> Result<ModelRunRecord> {
        Ok(ModelRunRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            hyperparameters: serde_json::to_value(&self.params)?,
            metrics: serde_json::to_value(&self.metrics)?,
            feature_columns: self.columns.clone(),
            tree_text: self.model_text.clone(),
        })
    }

    /// Scores every row. The matrix must use the training column layout.
    pub fn predict(&self, matrix: &FeatureMatrix) -> Result<Vec<Prediction>, PipelineError> {
        if matrix.columns != self.columns {
            return Err(PipelineError::InvalidModel(format!(
                "feature columns differ from the model's ({} vs {})",
                matrix.columns.len(),
                self.columns.len()
            )));
        }
        matrix
            .rows
            .iter()
            .map(|row| {
                let score = self.booster.predict(&row.values).ok_or_else(|| {
                    PipelineError::InvalidModel(format!(
                        "non-finite score for race {} horse {}",
                        row.race_id, row.horse_number
                    ))
                })?;
                Ok(Prediction {
                    race_id: row.race_id,
                    horse_id: row.horse_id.clone(),
                    horse_number: row.horse_number,
                    score,
                })
            })
            .collect()
    }

    fn score_set(&self, set: &LabeledSet) -> Vec<f64> {
        set.features
            .iter()
            .map(|values| self.booster.predict(values).unwrap_or(f64::NAN))
            .collect()
    }
}

pub fn objective_for(target: TargetKind) -> Objective {
    match target {
        TargetKind::RealizedReturn => Objective::Regression,
        TargetKind::PositiveReturn => Objective::Binary,
    }
}

struct Split {
    train: LabeledSet,
    validation: LabeledSet,
    validation_payouts: Vec<f64>,
    validation_races: Vec<RaceId>,
    validation_start: NaiveDate,
}

/// Fits models on feature matrices through a [`TrainerBackend`].
pub struct ModelFacade<T: TrainerBackend> {
    trainer: T,
    settings: PipelineSettings,
}

impl<T: TrainerBackend> ModelFacade<T> {
    pub fn new(trainer: T, settings: PipelineSettings) -> Self {
        Self { trainer, settings }
    }

    pub fn fit(&self, matrix: &FeatureMatrix, search: &SearchSpace) -> Result<(TrainedModel, TrainingSummary)> {
        matrix.verify_point_in_time()?;
        if matrix.is_empty() {
            return Err(PipelineError::EmptyFeatureMatrix.into());
        }
        let (Some(labels), Some(payouts)) = (&matrix.labels, &matrix.payouts) else {
            return Err(PipelineError::Training("feature matrix has no labels".into()).into());
        };
        if labels.len() != matrix.len() || payouts.len() != matrix.len() {
            return Err(PipelineError::Training(format!(
                "label count {} does not match row count {}",
                labels.len(),
                matrix.len()
            ))
            .into());
        }

        let min_popularity = self.settings.min_popularity_for_training;
        let filtered;
        let matrix = if min_popularity > 1 {
            filtered = matrix.filter_rows(|row| row.popularity.map_or(false, |p| p >= min_popularity));
            info!(
                "Restricted training rows to popularity >= {}: {} rows",
                min_popularity,
                filtered.len()
            );
            if filtered.is_empty() {
                return Err(PipelineError::EmptyFeatureMatrix.into());
            }
            &filtered
        } else {
            matrix
        };

        let split = self.chronological_split(matrix)?;
        let objective = objective_for(self.settings.target_kind);
        info!(
            "Training {} model on {} rows, validating on {} rows from {}",
            objective.as_str(),
            split.train.len(),
            split.validation.len(),
            split.validation_start
        );

        let candidates = search.candidates();
        let pb = ProgressBar::new(candidates.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} trials ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut best: Option<(usize, TrainedModel)> = None;
        let mut trials = Vec::new();
        let mut last_failure = None;
        for (trial_idx, params) in candidates.iter().enumerate() {
            let trial = trial_idx + 1;
            let job = TrainingJob {
                objective,
                params,
                early_stopping_round: search.early_stopping_round,
                train: &split.train,
                validation: &split.validation,
            };
            match self.run_trial(&job, matrix, &split) {
                Ok(model) => {
                    let metrics = model.metrics.unwrap_or(ValidationMetrics {
                        rmse: f64::INFINITY,
                        races: 0,
                        top_pick_hit_rate: 0.0,
                        top_pick_roi_pct: 0.0,
                    });
                    info!(
                        "Trial {}: {} trees, rmse={:.4}, top-pick ROI={:.2}%, hit rate={:.3}",
                        trial,
                        model.num_trees(),
                        metrics.rmse,
                        metrics.top_pick_roi_pct,
                        metrics.top_pick_hit_rate
                    );
                    trials.push(TrialResult {
                        trial,
                        hyperparameters: params.clone(),
                        trees: model.num_trees(),
                        metrics,
                    });
                    let improves = best.as_ref().map_or(true, |(_, current)| {
                        current.metrics.map_or(true, |m| metrics.better_than(&m))
                    });
                    if improves {
                        best = Some((trial, model));
                    }
                }
                Err(err) => {
                    warn!("Trial {} failed: {}", trial, err);
                    last_failure = Some(err.to_string());
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let Some((best_trial, model)) = best else {
            return Err(PipelineError::Training(format!(
                "all {} trials failed; last error: {}",
                candidates.len(),
                last_failure.unwrap_or_else(|| "unknown".into())
            ))
            .into());
        };

        let summary = TrainingSummary {
            objective: objective.as_str().to_string(),
            train_rows: split.train.len(),
            validation_rows: split.validation.len(),
            validation_start_date: split.validation_start,
            trials_attempted: candidates.len(),
            trials,
            best_trial,
        };
        Ok((model, summary))
    }

    fn run_trial(
        &self,
        job: &TrainingJob<'_>,
        matrix: &FeatureMatrix,
        split: &Split,
    ) -> Result<TrainedModel> {
        let text = self
            .trainer
            .train(job)
            .map_err(|err| PipelineError::Training(err.to_string()))?;
        let mut model = TrainedModel::from_model_text(&text, matrix.columns.clone())
            .map_err(|err| PipelineError::Training(err.to_string()))?;
        if model.objective() != job.objective {
            return Err(PipelineError::Training(format!(
                "trainer returned a {} model for a {} job",
                model.objective().as_str(),
                job.objective.as_str()
            ))
            .into());
        }

        let scores = model.score_set(&split.validation);
        let metrics = evaluate(
            &scores,
            &split.validation.labels,
            &split.validation_payouts,
            &split.validation_races,
        )
        .ok_or_else(|| PipelineError::Training("validation scores are not finite".into()))?;
        model.params = Some(job.params.clone());
        model.metrics = Some(metrics);
        Ok(model)
    }

    /// The last `validation_fraction` of race dates (at least one) form the validation set.
    fn chronological_split(&self, matrix: &FeatureMatrix) -> Result<Split> {
        let dates: BTreeSet<NaiveDate> = matrix.rows.iter().map(|row| row.race_date).collect();
        if dates.len() < 2 {
            return Err(PipelineError::Training(format!(
                "need at least two race dates for a chronological split, found {}",
                dates.len()
            ))
            .into());
        }
        let validation_dates = ((dates.len() as f64 * self.settings.validation_fraction).round()
            as usize)
            .clamp(1, dates.len() - 1);
        let validation_start = *dates
            .iter()
            .nth(dates.len() - validation_dates)
            .ok_or_else(|| anyhow!("validation split out of range"))?;

        let labels = matrix.labels.as_deref().unwrap_or_default();
        let payouts = matrix.payouts.as_deref().unwrap_or_default();
        let mut split = Split {
            train: LabeledSet::default(),
            validation: LabeledSet::default(),
            validation_payouts: Vec::new(),
            validation_races: Vec::new(),
            validation_start,
        };
        for (idx, row) in matrix.rows.iter().enumerate() {
            if row.race_date < validation_start {
                split.train.features.push(row.values.clone());
                split.train.labels.push(labels[idx]);
            } else {
                split.validation.features.push(row.values.clone());
                split.validation.labels.push(labels[idx]);
                split.validation_payouts.push(payouts[idx]);
                split.validation_races.push(row.race_id);
            }
        }
        Ok(split)
    }
}
