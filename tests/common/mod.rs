#![allow(dead_code)]

use chrono::{Datelike, NaiveDate};
use racing_roi::data_context::RaceData;
use racing_roi::models::{Entrant, Going, Horse, Payout, PayoutEntry, Race, RaceId, Surface};
use std::collections::HashMap;

pub const VENUE_TOKYO: u8 = 5;
pub const SIRE_ONE: &str = "S1";
pub const SIRE_TWO: &str = "S2";

pub fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, month, day).expect("valid fixture date")
}

/// Raw records for an in-memory batch.
#[derive(Default, Clone)]
pub struct Fixture {
    pub races: Vec<Race>,
    pub entrants: Vec<Entrant>,
    pub payouts: Vec<Payout>,
    pub horses: Vec<Horse>,
    pub settings: HashMap<String, String>,
}

impl Fixture {
    pub fn new() -> Self {
        let mut fixture = Self::default();
        for key in [
            "MIN_SAMPLES_SIRE_CONDITION",
            "MIN_SAMPLES_JOCKEY_COURSE",
            "MIN_SAMPLES_HORSE_COURSE",
            "MIN_SAMPLES_CLOSING_SPEED",
            "MIN_SAMPLES_PACE_RECOVERY",
            "MIN_SAMPLES_STAMINA_RANK",
        ] {
            fixture.settings.insert(key.to_string(), "3".to_string());
        }
        fixture
    }

    pub fn race(&mut self, day: NaiveDate, race_number: u8, distance_m: u32) -> RaceId {
        let id = RaceId::new(
            day.year() as u16,
            (day.month() * 100 + day.day()) as u16,
            VENUE_TOKYO,
            race_number,
        );
        self.races.push(Race {
            id,
            date: day,
            distance_m,
            track_code: "11".to_string(),
            surface: Surface::Turf,
            weather_code: 1,
            going: Going::Good,
        });
        id
    }

    pub fn horse(&mut self, horse_id: &str, sire_id: &str) {
        if self.horses.iter().any(|horse| horse.horse_id == horse_id) {
            return;
        }
        self.horses.push(Horse {
            horse_id: horse_id.to_string(),
            name: format!("Horse {horse_id}"),
            birth_date: None,
            sire_id: Some(sire_id.to_string()),
            sire_name: None,
            dam_id: None,
            dam_name: None,
        });
    }

    pub fn entry(
        &mut self,
        race_id: RaceId,
        horse_number: u8,
        horse_id: &str,
        jockey_code: &str,
        finish_position: Option<u8>,
    ) {
        self.entrants.push(Entrant {
            race_id,
            horse_id: horse_id.to_string(),
            post_position: horse_number,
            horse_number,
            jockey_code: jockey_code.to_string(),
            trainer_code: "T01".to_string(),
            finish_position,
            elapsed_time_tenths: finish_position.map(|pos| 960 + pos as u32),
            final_3f_tenths: finish_position.map(|pos| 340 + pos as u32),
            win_odds: Some(2.0 + horse_number as f64),
            popularity: Some(horse_number),
        });
    }

    pub fn payout(&mut self, race_id: RaceId, winner: u8, win_yen: u32) {
        self.payouts.push(Payout {
            race_id,
            win: vec![PayoutEntry {
                horse_number: winner,
                amount_yen: win_yen,
            }],
            place: vec![PayoutEntry {
                horse_number: winner,
                amount_yen: 110,
            }],
        });
    }

    /// Horse number 1 is by [`SIRE_ONE`], horse number 2 by [`SIRE_TWO`]. `result` is the
    /// winning horse number and its win payout; `None` leaves the race unrun.
    pub fn two_runner_race(
        &mut self,
        day: NaiveDate,
        race_number: u8,
        distance_m: u32,
        horses: [&str; 2],
        jockeys: [&str; 2],
        result: Option<(u8, u32)>,
    ) -> RaceId {
        let id = self.race(day, race_number, distance_m);
        self.horse(horses[0], SIRE_ONE);
        self.horse(horses[1], SIRE_TWO);
        for (idx, (horse_id, jockey)) in horses.iter().zip(jockeys).enumerate() {
            let horse_number = idx as u8 + 1;
            let finish = result.map(|(winner, _)| if winner == horse_number { 1 } else { 2 });
            self.entry(id, horse_number, horse_id, jockey, finish);
        }
        if let Some((winner, win_yen)) = result {
            self.payout(id, winner, win_yen);
        }
        id
    }

    pub fn build(&self) -> RaceData {
        RaceData::from_records(
            self.races.clone(),
            self.entrants.clone(),
            self.payouts.clone(),
            self.horses.clone(),
            self.settings.clone(),
        )
        .expect("fixture records are consistent")
    }
}

/// Six 1600m races from 4 to 9 January. The SIRE_ONE runner wins only the first, paying
/// 500 yen; the SIRE_TWO runner wins the other five at 150 yen.
pub fn sire_history() -> Fixture {
    let mut fixture = Fixture::new();
    for day in 4..=9 {
        let result = if day == 4 { (1, 500) } else { (2, 150) };
        let horse_one = format!("A{day}");
        let horse_two = format!("B{day}");
        fixture.two_runner_race(
            date(1, day),
            1,
            1600,
            [horse_one.as_str(), horse_two.as_str()],
            ["J1", "J2"],
            Some(result),
        );
    }
    fixture
}

/// Six 3200m races from 4 to 9 January between P1 (by [`SIRE_ONE`]) and P2 (by
/// [`SIRE_TWO`]). P1 wins every one at 200 yen and also closes fastest. The same pair
/// is declared for an unrun 3200m race on 20 January.
pub fn stayers() -> Fixture {
    let mut fixture = Fixture::new();
    for day in 4..=9 {
        fixture.two_runner_race(date(1, day), 1, 3200, ["P1", "P2"], ["J1", "J2"], Some((1, 200)));
    }
    fixture.two_runner_race(date(1, 20), 1, 3200, ["P1", "P2"], ["J1", "J2"], None);
    fixture
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}
