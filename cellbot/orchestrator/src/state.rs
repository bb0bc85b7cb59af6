use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Station cursor of the inspection cycle.
///
/// Advances strictly forward, `Home -> Station1 -> Station2 -> Station3 ->
/// Complete -> Home`. Only a manual override may jump elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    /// Waiting for the conveyance.
    #[default]
    Home,
    /// First station slot.
    Station1,
    /// Second station slot.
    Station2,
    /// Third station slot.
    Station3,
    /// All stations done; reporting and waiting for departure.
    Complete,
}

impl WorkState {
    /// State for station slot `index` (zero based).
    #[must_use]
    pub const fn for_slot(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Station1),
            1 => Some(Self::Station2),
            2 => Some(Self::Station3),
            _ => None,
        }
    }

    /// Station slot of this state, if it is a station.
    #[must_use]
    pub const fn slot(self) -> Option<usize> {
        match self {
            Self::Station1 => Some(0),
            Self::Station2 => Some(1),
            Self::Station3 => Some(2),
            Self::Home | Self::Complete => None,
        }
    }

    /// Forward successor when `slots` stations are configured.
    #[must_use]
    pub fn next(self, slots: usize) -> Self {
        match self {
            Self::Home => Self::for_slot(0).filter(|_| slots > 0).unwrap_or(Self::Complete),
            Self::Complete => Self::Home,
            station => station
                .slot()
                .map(|slot| slot + 1)
                .filter(|next| *next < slots)
                .and_then(Self::for_slot)
                .unwrap_or(Self::Complete),
        }
    }
}

/// What happened at one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationResult {
    /// Station name.
    pub station: String,
    /// The station's mission succeeded.
    pub success: bool,
    /// The station is not part of this item's variant and did not run.
    pub skipped: bool,
    /// Wall time in seconds.
    pub elapsed_s: f64,
    /// Pose corrections that left the arm where it was.
    pub arm_pointing_failures: u32,
    /// Captures stored.
    pub captures: usize,
    /// Failure description.
    pub detail: Option<String>,
}

impl StationResult {
    /// Result of a station that did not run for this variant.
    #[must_use]
    pub fn skipped(station: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            success: true,
            skipped: true,
            elapsed_s: 0.0,
            arm_pointing_failures: 0,
            captures: 0,
            detail: None,
        }
    }

    /// Failed result with a reason.
    #[must_use]
    pub fn failed(station: impl Into<String>, elapsed_s: f64, detail: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            success: false,
            skipped: false,
            elapsed_s,
            arm_pointing_failures: 0,
            captures: 0,
            detail: Some(detail.into()),
        }
    }
}

/// Battery reading taken at a cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BatterySample {
    /// Charge in percent.
    pub charge_percent: f64,
    /// Lowest cell temperature.
    pub min_temp_c: f64,
    /// Highest cell temperature.
    pub max_temp_c: f64,
}

/// One pass through the stations for one conveyed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionCycle {
    /// Unique id.
    pub id: Uuid,
    /// Sequence number, starting at 1.
    pub sequence: u64,
    /// Item classification read at arrival.
    pub classification: Option<String>,
    /// Stations required for this item, in station order.
    pub required: Vec<String>,
    /// Results so far, one per visited slot.
    pub results: Vec<StationResult>,
    /// Arrival time.
    pub started_at: DateTime<Utc>,
    /// Time completion was reported.
    pub ended_at: Option<DateTime<Utc>>,
    /// Completion was reported to the plant.
    pub completion_reported: bool,
    /// The cycle ran (or finished) under bypass.
    pub bypassed: bool,
    /// Battery at arrival.
    pub battery_start: Option<BatterySample>,
    /// Battery when completion was reported.
    pub battery_end: Option<BatterySample>,
    /// Minutes spent docked since the previous cycle.
    pub dock_wait_min: f64,
}

impl InspectionCycle {
    /// Starts a cycle.
    #[must_use]
    pub fn start(sequence: u64, classification: Option<String>, required: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            classification,
            required,
            results: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            completion_reported: false,
            bypassed: false,
            battery_start: None,
            battery_end: None,
            dock_wait_min: 0.0,
        }
    }

    /// Whether `station` must run for this item.
    #[must_use]
    pub fn requires(&self, station: &str) -> bool {
        self.required.iter().any(|s| s == station)
    }

    /// Stations that ran and succeeded.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| !r.skipped && r.success).count()
    }

    /// Stations that ran and failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.skipped && !r.success).count()
    }

    /// Whether every required station ran and succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.bypassed && self.failed() == 0 && self.completed() == self.required.len()
    }

    /// Total arm-pointing failures.
    #[must_use]
    pub fn arm_pointing_failures(&self) -> u32 {
        self.results.iter().map(|r| r.arm_pointing_failures).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_order_walks_every_station() {
        let mut state = WorkState::Home;
        let mut seen = vec![state];
        for _ in 0..5 {
            state = state.next(3);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                WorkState::Home,
                WorkState::Station1,
                WorkState::Station2,
                WorkState::Station3,
                WorkState::Complete,
                WorkState::Home,
            ]
        );
    }

    #[test]
    fn short_order_completes_early() {
        assert_eq!(WorkState::Station2.next(2), WorkState::Complete);
        assert_eq!(WorkState::Home.next(0), WorkState::Complete);
    }

    #[test]
    fn cycle_counts_ignore_skipped_stations() {
        let mut cycle = InspectionCycle::start(1, Some("VAN".into()), vec!["a".into(), "c".into()]);
        cycle.results.push(StationResult {
            arm_pointing_failures: 1,
            ..StationResult::skipped("a")
        });
        cycle.results.last_mut().unwrap().skipped = false;
        cycle.results.push(StationResult::skipped("b"));
        cycle.results.push(StationResult::failed("c", 3.0, "timeout"));
        assert_eq!(cycle.completed(), 1);
        assert_eq!(cycle.failed(), 1);
        assert!(!cycle.succeeded());
        assert_eq!(cycle.arm_pointing_failures(), 1);
        assert!(cycle.requires("c"));
        assert!(!cycle.requires("b"));
    }
}
