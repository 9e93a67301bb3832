use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::collections::HashMap;

pub const DEFAULT_STAMINA_DISTANCE_THRESHOLD_M: u32 = 3000;
pub const DEFAULT_STAMINA_HISTORY_MIN_DISTANCE_M: u32 = 2400;

/// Which realised return a cohort bet is settled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetKind {
    Win,
    Place,
}

impl BetKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "win" | "tansho" => Ok(Self::Win),
            "place" | "fukusho" => Ok(Self::Place),
            other => Err(anyhow!(
                "COHORT_BET_KIND must be WIN or PLACE (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Place => "place",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Return multiple per unit stake (payout / 100).
    RealizedReturn,
    /// 1.0 when the bet paid anything, else 0.0.
    PositiveReturn,
}

impl TargetKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "realized_return" | "roi" => Ok(Self::RealizedReturn),
            "positive_return" | "binary" => Ok(Self::PositiveReturn),
            other => Err(anyhow!(
                "TARGET_KIND must be REALIZED_RETURN or POSITIVE_RETURN (value: {})",
                other
            )),
        }
    }
}

/// Minimum prior bets per cohort before an ROI is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumSamples {
    pub sire_condition: usize,
    pub jockey_course: usize,
    pub horse_course: usize,
    pub closing_speed: usize,
    pub pace_recovery: usize,
    pub stamina_rank: usize,
}

impl Default for MinimumSamples {
    fn default() -> Self {
        Self {
            sire_condition: 30,
            jockey_course: 20,
            horse_course: 3,
            closing_speed: 30,
            pace_recovery: 30,
            stamina_rank: 30,
        }
    }
}

impl MinimumSamples {
    pub fn uniform(samples: usize) -> Self {
        Self {
            sire_condition: samples,
            jockey_course: samples,
            horse_course: samples,
            closing_speed: samples,
            pace_recovery: samples,
            stamina_rank: samples,
        }
    }
}

/// Settings shared by feature construction at training and inference time.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_samples: MinimumSamples,
    /// `None` means full history up to (excluding) the as-of date.
    pub cohort_lookback_days: Option<u32>,
    pub stamina_distance_threshold_m: u32,
    pub stamina_history_min_distance_m: u32,
    pub bet_kind: BetKind,
    pub target_kind: TargetKind,
    pub validation_fraction: f64,
    pub min_popularity_for_training: u8,
    pub training_start_date: Option<NaiveDate>,
    pub training_end_date: Option<NaiveDate>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_samples: MinimumSamples::default(),
            cohort_lookback_days: None,
            stamina_distance_threshold_m: DEFAULT_STAMINA_DISTANCE_THRESHOLD_M,
            stamina_history_min_distance_m: DEFAULT_STAMINA_HISTORY_MIN_DISTANCE_M,
            bet_kind: BetKind::Win,
            target_kind: TargetKind::RealizedReturn,
            validation_fraction: 0.2,
            min_popularity_for_training: 1,
            training_start_date: None,
            training_end_date: None,
        }
    }
}

impl PipelineSettings {
    /// Missing keys fall back to defaults; present keys must parse.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let min_samples = MinimumSamples {
            sire_condition: optional_setting_usize(
                settings,
                "MIN_SAMPLES_SIRE_CONDITION",
                1,
                defaults.min_samples.sire_condition,
            )?,
            jockey_course: optional_setting_usize(
                settings,
                "MIN_SAMPLES_JOCKEY_COURSE",
                1,
                defaults.min_samples.jockey_course,
            )?,
            horse_course: optional_setting_usize(
                settings,
                "MIN_SAMPLES_HORSE_COURSE",
                1,
                defaults.min_samples.horse_course,
            )?,
            closing_speed: optional_setting_usize(
                settings,
                "MIN_SAMPLES_CLOSING_SPEED",
                1,
                defaults.min_samples.closing_speed,
            )?,
            pace_recovery: optional_setting_usize(
                settings,
                "MIN_SAMPLES_PACE_RECOVERY",
                1,
                defaults.min_samples.pace_recovery,
            )?,
            stamina_rank: optional_setting_usize(
                settings,
                "MIN_SAMPLES_STAMINA_RANK",
                1,
                defaults.min_samples.stamina_rank,
            )?,
        };

        let lookback = optional_setting_usize(settings, "COHORT_LOOKBACK_DAYS", 0, 0)?;
        let cohort_lookback_days = if lookback == 0 {
            None
        } else {
            Some(u32::try_from(lookback).map_err(|_| {
                anyhow!("Setting COHORT_LOOKBACK_DAYS is too large (value: {lookback})")
            })?)
        };

        let stamina_distance_threshold_m = optional_setting_metres(
            settings,
            "STAMINA_DISTANCE_THRESHOLD",
            defaults.stamina_distance_threshold_m,
        )?;
        let stamina_history_min_distance_m = optional_setting_metres(
            settings,
            "STAMINA_HISTORY_MIN_DISTANCE",
            defaults.stamina_history_min_distance_m,
        )?;

        let bet_kind = match optional_setting(settings, "COHORT_BET_KIND") {
            Some(raw) => BetKind::parse(raw)?,
            None => defaults.bet_kind,
        };
        let target_kind = match optional_setting(settings, "TARGET_KIND") {
            Some(raw) => TargetKind::parse(raw)?,
            None => defaults.target_kind,
        };
        let validation_fraction = optional_setting_f64(
            settings,
            "VALIDATION_FRACTION",
            Some(0.0),
            Some(0.9),
            defaults.validation_fraction,
        )?;
        let min_popularity_for_training = optional_setting_usize(
            settings,
            "MIN_POPULARITY_FOR_TRAINING",
            1,
            defaults.min_popularity_for_training as usize,
        )?;
        let min_popularity_for_training = u8::try_from(min_popularity_for_training)
            .map_err(|_| anyhow!("Setting MIN_POPULARITY_FOR_TRAINING must be <= 255"))?;

        let training_start_date = optional_setting_date(settings, "TRAINING_START_DATE")?;
        let training_end_date = optional_setting_date(settings, "TRAINING_END_DATE")?;
        if let (Some(start), Some(end)) = (training_start_date, training_end_date) {
            if end < start {
                return Err(anyhow!(
                    "TRAINING_END_DATE ({}) must be >= TRAINING_START_DATE ({})",
                    end,
                    start
                ));
            }
        }

        Ok(Self {
            min_samples,
            cohort_lookback_days,
            stamina_distance_threshold_m,
            stamina_history_min_distance_m,
            bet_kind,
            target_kind,
            validation_fraction,
            min_popularity_for_training,
            training_start_date,
            training_end_date,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_date(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<NaiveDate>> {
    optional_setting(settings, key)
        .map(|raw| parse_setting_date(key, raw))
        .transpose()
}

fn parse_setting_date(key: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Setting {} must be a date in YYYY-MM-DD format (value: {})",
            key,
            raw
        )
    })
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
    default: f64,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
    default: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn optional_setting_metres(
    settings: &HashMap<String, String>,
    key: &str,
    default: u32,
) -> Result<u32> {
    let value = optional_setting_usize(settings, key, 1, default as usize)?;
    u32::try_from(value).map_err(|_| anyhow!("Setting {} is too large (value: {})", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_settings_use_defaults() {
        let parsed = PipelineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.min_samples, MinimumSamples::default());
        assert_eq!(parsed.cohort_lookback_days, None);
        assert_eq!(parsed.stamina_distance_threshold_m, 3000);
        assert_eq!(parsed.bet_kind, BetKind::Win);
        assert_eq!(parsed.target_kind, TargetKind::RealizedReturn);
    }

    #[test]
    fn present_settings_override_defaults() {
        let parsed = PipelineSettings::from_settings_map(&settings(&[
            ("MIN_SAMPLES_SIRE_CONDITION", "3"),
            ("COHORT_LOOKBACK_DAYS", "365"),
            ("COHORT_BET_KIND", "place"),
            ("TARGET_KIND", "positive_return"),
            ("TRAINING_START_DATE", "2018-01-01"),
            ("TRAINING_END_DATE", "2020-12-31"),
        ]))
        .unwrap();
        assert_eq!(parsed.min_samples.sire_condition, 3);
        assert_eq!(parsed.cohort_lookback_days, Some(365));
        assert_eq!(parsed.bet_kind, BetKind::Place);
        assert_eq!(parsed.target_kind, TargetKind::PositiveReturn);
        assert_eq!(
            parsed.training_end_date,
            NaiveDate::from_ymd_opt(2020, 12, 31)
        );
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(PipelineSettings::from_settings_map(&settings(&[(
            "MIN_SAMPLES_JOCKEY_COURSE",
            "2.5"
        )]))
        .is_err());
        assert!(PipelineSettings::from_settings_map(&settings(&[(
            "VALIDATION_FRACTION",
            "1.5"
        )]))
        .is_err());
        assert!(PipelineSettings::from_settings_map(&settings(&[
            ("TRAINING_START_DATE", "2021-01-01"),
            ("TRAINING_END_DATE", "2020-01-01"),
        ]))
        .is_err());
        assert!(PipelineSettings::from_settings_map(&settings(&[(
            "TRAINING_START_DATE",
            "20200101"
        )]))
        .is_err());
    }

    #[test]
    fn stamina_distances_must_fit_in_metres() {
        let parsed = PipelineSettings::from_settings_map(&settings(&[
            ("STAMINA_DISTANCE_THRESHOLD", "3200"),
            ("STAMINA_HISTORY_MIN_DISTANCE", "2000"),
        ]))
        .unwrap();
        assert_eq!(parsed.stamina_distance_threshold_m, 3200);
        assert_eq!(parsed.stamina_history_min_distance_m, 2000);

        for key in ["STAMINA_DISTANCE_THRESHOLD", "STAMINA_HISTORY_MIN_DISTANCE"] {
            let err = PipelineSettings::from_settings_map(&settings(&[(key, "4294967296")]))
                .unwrap_err();
            assert!(err.to_string().contains("too large"), "{key}: {err}");
        }
    }
}
