use chrono::NaiveDate;
use thiserror::Error;

/// Failures the pipeline distinguishes from generic I/O errors.
///
/// These travel inside `anyhow::Error`; callers that need the variant use
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Broken race/entrant/payout linkage or malformed raw fields. Aborts the batch.
    #[error("Data integrity failure in {batch}: {detail}")]
    DataIntegrity { batch: String, detail: String },

    /// Outcome-derived data dated at or after the race it was used for.
    #[error(
        "Lookahead leakage in race {race_id} ({race_date}): column {column} uses outcomes from {source_date}"
    )]
    Leakage {
        race_id: String,
        race_date: NaiveDate,
        source_date: NaiveDate,
        column: String,
    },

    #[error("Feature matrix is empty; nothing to train on")]
    EmptyFeatureMatrix,

    #[error("Model training failed: {0}")]
    Training(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),
}

impl PipelineError {
    pub fn integrity(batch: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::DataIntegrity {
            batch: batch.into(),
            detail: detail.into(),
        }
    }

    pub fn is_data_integrity(&self) -> bool {
        matches!(self, Self::DataIntegrity { .. })
    }

    pub fn is_leakage(&self) -> bool {
        matches!(self, Self::Leakage { .. })
    }
}

/// Returns the pipeline error carried by an `anyhow::Error`, if any.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.downcast_ref::<PipelineError>()
}
