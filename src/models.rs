use crate::errors::PipelineError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payout amounts are quoted per 100 yen staked.
pub const STAKE_UNIT_YEN: f64 = 100.0;

const SPRINT_MAX_DISTANCE_M: u32 = 1400;
const MIDDLE_MAX_DISTANCE_M: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaceId {
    pub year: u16,
    /// MMDD
    pub month_day: u16,
    pub venue: u8,
    pub race_number: u8,
}

impl RaceId {
    pub fn new(year: u16, month_day: u16, venue: u8, race_number: u8) -> Self {
        Self {
            year,
            month_day,
            venue,
            race_number,
        }
    }

    /// Builds an id from the raw `kaisai_nen`, `kaisai_tsukihi`, `keibajo_code` and
    /// `race_bango` columns.
    pub fn from_raw_parts(
        year: &str,
        month_day: &str,
        venue: &str,
        race_number: &str,
    ) -> Result<Self, PipelineError> {
        let label = format!("{year}{month_day}{venue}{race_number}");
        let parse = |raw: &str, width: usize, field: &str| -> Result<u16, PipelineError> {
            let trimmed = raw.trim();
            if trimmed.len() != width || !trimmed.chars().all(|c| c.is_ascii_digit()) {
                return Err(PipelineError::integrity(
                    format!("race {label}"),
                    format!("malformed {field} field \"{raw}\""),
                ));
            }
            trimmed.parse::<u16>().map_err(|_| {
                PipelineError::integrity(
                    format!("race {label}"),
                    format!("malformed {field} field \"{raw}\""),
                )
            })
        };

        let id = Self {
            year: parse(year, 4, "kaisai_nen")?,
            month_day: parse(month_day, 4, "kaisai_tsukihi")?,
            venue: parse(venue, 2, "keibajo_code")? as u8,
            race_number: parse(race_number, 2, "race_bango")? as u8,
        };
        id.date()?;
        Ok(id)
    }

    /// Parses the 12-character `YYYYMMDDVVRR` form.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.len() != 12 || !trimmed.is_ascii() {
            return Err(PipelineError::integrity(
                format!("race {raw}"),
                "race id must have the form YYYYMMDDVVRR",
            ));
        }
        Self::from_raw_parts(
            &trimmed[0..4],
            &trimmed[4..8],
            &trimmed[8..10],
            &trimmed[10..12],
        )
    }

    pub fn date(&self) -> Result<NaiveDate, PipelineError> {
        let month = (self.month_day / 100) as u32;
        let day = (self.month_day % 100) as u32;
        NaiveDate::from_ymd_opt(self.year as i32, month, day).ok_or_else(|| {
            PipelineError::integrity(
                format!("race {self}"),
                format!("invalid race date {:04}{:04}", self.year, self.month_day),
            )
        })
    }
}

impl fmt::Display for RaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}{:04}{:02}{:02}",
            self.year, self.month_day, self.venue, self.race_number
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Surface {
    Turf,
    Dirt,
    Other,
}

impl Surface {
    /// Track codes starting with 1 are turf, 2 dirt; everything else (jumps) is other.
    pub fn from_track_code(track_code: &str) -> Self {
        match track_code.trim().chars().next() {
            Some('1') => Surface::Turf,
            Some('2') => Surface::Dirt,
            _ => Surface::Other,
        }
    }

    pub fn code(self) -> f64 {
        match self {
            Surface::Turf => 1.0,
            Surface::Dirt => 2.0,
            Surface::Other => 3.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Surface::Turf => "turf",
            Surface::Dirt => "dirt",
            Surface::Other => "other",
        }
    }
}

/// Track condition ("baba jotai") for the surface the race ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Going {
    Good,
    Yielding,
    Soft,
    Heavy,
    Unknown,
}

impl Going {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "1" => Going::Good,
            "2" => Going::Yielding,
            "3" => Going::Soft,
            "4" => Going::Heavy,
            _ => Going::Unknown,
        }
    }

    pub fn code(self) -> f64 {
        match self {
            Going::Good => 1.0,
            Going::Yielding => 2.0,
            Going::Soft => 3.0,
            Going::Heavy => 4.0,
            Going::Unknown => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Going::Good => "good",
            Going::Yielding => "yielding",
            Going::Soft => "soft",
            Going::Heavy => "heavy",
            Going::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceCategory {
    Sprint,
    Middle,
    Long,
}

impl DistanceCategory {
    pub fn from_distance(distance_m: u32) -> Self {
        if distance_m <= SPRINT_MAX_DISTANCE_M {
            DistanceCategory::Sprint
        } else if distance_m <= MIDDLE_MAX_DISTANCE_M {
            DistanceCategory::Middle
        } else {
            DistanceCategory::Long
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceCategory::Sprint => "sprint",
            DistanceCategory::Middle => "middle",
            DistanceCategory::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub id: RaceId,
    pub date: NaiveDate,
    pub distance_m: u32,
    pub track_code: String,
    pub surface: Surface,
    pub weather_code: u8,
    pub going: Going,
}

impl Race {
    pub fn distance_category(&self) -> DistanceCategory {
        DistanceCategory::from_distance(self.distance_m)
    }
}

pub fn venue_name(venue: u8) -> String {
    match venue {
        1 => "Sapporo".to_string(),
        2 => "Hakodate".to_string(),
        3 => "Fukushima".to_string(),
        4 => "Niigata".to_string(),
        5 => "Tokyo".to_string(),
        6 => "Nakayama".to_string(),
        7 => "Chukyo".to_string(),
        8 => "Kyoto".to_string(),
        9 => "Hanshin".to_string(),
        10 => "Kokura".to_string(),
        other => format!("{other:02}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entrant {
    pub race_id: RaceId,
    /// Pedigree registration number (`ketto_toroku_bango`).
    pub horse_id: String,
    pub post_position: u8,
    pub horse_number: u8,
    pub jockey_code: String,
    pub trainer_code: String,
    /// `None` for scratches, disqualifications and non-finishers.
    pub finish_position: Option<u8>,
    pub elapsed_time_tenths: Option<u32>,
    pub final_3f_tenths: Option<u32>,
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
}

impl Entrant {
    pub fn is_runner(&self) -> bool {
        self.finish_position.is_some()
    }
}

/// Parses a confirmed finishing position; `00`, `99` and blanks mean the horse did not finish.
pub fn parse_finish_position(raw: &str) -> Option<u8> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match trimmed.parse::<u8>() {
        Ok(0) | Ok(99) | Err(_) => None,
        Ok(value) => Some(value),
    }
}

/// Converts the `MSST` race time encoding (e.g. `1345` = 1:34.5) into tenths of a second.
pub fn parse_elapsed_time(raw: &str) -> Option<u32> {
    let value = parse_positive_number(raw)?;
    let minutes = value / 1000;
    let seconds = (value / 10) % 100;
    let tenths = value % 10;
    if seconds >= 60 {
        return None;
    }
    Some(minutes * 600 + seconds * 10 + tenths)
}

/// Final 3 furlong times are already stored in tenths (`345` = 34.5s).
pub fn parse_final_3f(raw: &str) -> Option<u32> {
    parse_positive_number(raw)
}

/// Win odds are stored as tenths (`0123` = 12.3).
pub fn parse_win_odds(raw: &str) -> Option<f64> {
    parse_positive_number(raw).map(|value| value as f64 / 10.0)
}

pub fn parse_popularity(raw: &str) -> Option<u8> {
    parse_positive_number(raw).and_then(|value| u8::try_from(value).ok())
}

fn parse_positive_number(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u32>().ok().filter(|value| *value > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutEntry {
    pub horse_number: u8,
    /// Yen returned per 100 yen staked.
    pub amount_yen: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub race_id: RaceId,
    /// More than one entry on a dead heat.
    pub win: Vec<PayoutEntry>,
    pub place: Vec<PayoutEntry>,
}

impl Payout {
    pub fn win_return(&self, horse_number: u8) -> f64 {
        sum_for_horse(&self.win, horse_number)
    }

    pub fn place_return(&self, horse_number: u8) -> f64 {
        sum_for_horse(&self.place, horse_number)
    }

    pub fn has_win_entry(&self, horse_number: u8) -> bool {
        self.win.iter().any(|entry| entry.horse_number == horse_number)
    }
}

fn sum_for_horse(entries: &[PayoutEntry], horse_number: u8) -> f64 {
    entries
        .iter()
        .filter(|entry| entry.horse_number == horse_number)
        .map(|entry| entry.amount_yen as f64)
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Horse {
    pub horse_id: String,
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub sire_id: Option<String>,
    pub sire_name: Option<String>,
    pub dam_id: Option<String>,
    pub dam_name: Option<String>,
}

/// Market popularity groups: favourites, middle prices and long shots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PopularityBand {
    Favourite,
    MidPrice,
    LongShot,
    Unknown,
}

impl PopularityBand {
    pub fn from_popularity(popularity: Option<u8>) -> Self {
        match popularity {
            Some(1..=3) => PopularityBand::Favourite,
            Some(4..=8) => PopularityBand::MidPrice,
            Some(p) if p >= 9 => PopularityBand::LongShot,
            _ => PopularityBand::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PopularityBand::Favourite => "favourite",
            PopularityBand::MidPrice => "mid_price",
            PopularityBand::LongShot => "long_shot",
            PopularityBand::Unknown => "unknown",
        }
    }
}

/// Inclusive date range used for record store queries and join batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> anyhow::Result<Self> {
        if start > end {
            return Err(anyhow::anyhow!(
                "Date range start {} occurs after end {}",
                start,
                end
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}
