use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::state::InspectionCycle;

/// Column names of the per-cycle block.
pub const CYCLE_HEADER: [&str; 17] = [
    "cycle#",
    "start time",
    "end time",
    "cycle-time(min)",
    "required-inspections",
    "completed-inspections",
    "failed-inspections",
    "arm-pointing-failures",
    "dock-wait-time(min)",
    "battery-start",
    "battery-end",
    "battery-delta",
    "battery-min-temp-start",
    "battery-max-temp-start",
    "battery-min-temp-end",
    "battery-max-temp-end",
    "mission-succeeded",
];

/// Column names of the summary block appended at the end of a run.
pub const SUMMARY_HEADER: [&str; 16] = [
    "cycles",
    "success-rate",
    "cycle-time-mean",
    "cycle-time-median",
    "cycle-time-stdev",
    "cycle-time-min",
    "cycle-time-q1",
    "cycle-time-q3",
    "cycle-time-max",
    "battery-delta-mean",
    "battery-delta-median",
    "battery-delta-stdev",
    "battery-delta-min",
    "battery-delta-q1",
    "battery-delta-q3",
    "battery-delta-max",
];

/// Cycle log failures.
#[derive(Debug, Error)]
pub enum CycleLogError {
    /// The file could not be read or written.
    #[error("cycle log io error at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The first line is not the cycle header.
    #[error("{path} does not start with the cycle log header")]
    MissingHeader {
        /// Offending path.
        path: PathBuf,
    },
    /// A row could not be parsed.
    #[error("line {line}: {reason}")]
    MalformedRow {
        /// One-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },
}

/// One completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRecord {
    /// Cycle sequence number.
    pub cycle: u64,
    /// Arrival time.
    pub start: DateTime<Utc>,
    /// Completion time.
    pub end: DateTime<Utc>,
    /// End minus start, in minutes.
    pub cycle_time_min: f64,
    /// Stations required for the item.
    pub required: usize,
    /// Stations that ran and succeeded.
    pub completed: usize,
    /// Stations that ran and failed.
    pub failed: usize,
    /// Pose corrections that were not applied.
    pub arm_pointing_failures: u32,
    /// Minutes docked before this cycle.
    pub dock_wait_min: f64,
    /// Charge at arrival, percent.
    pub battery_start: f64,
    /// Charge at completion, percent.
    pub battery_end: f64,
    /// `battery_end - battery_start`; negative when the cycle drained charge.
    pub battery_delta: f64,
    /// Lowest cell temperature at arrival.
    pub min_temp_start: f64,
    /// Highest cell temperature at arrival.
    pub max_temp_start: f64,
    /// Lowest cell temperature at completion.
    pub min_temp_end: f64,
    /// Highest cell temperature at completion.
    pub max_temp_end: f64,
    /// Every required station ran and succeeded.
    pub succeeded: bool,
}

impl CycleRecord {
    /// Builds the row for a reported cycle. A cycle without an end time is
    /// closed at the current instant.
    #[must_use]
    pub fn from_cycle(cycle: &InspectionCycle) -> Self {
        let end = cycle.ended_at.unwrap_or_else(Utc::now);
        #[allow(clippy::cast_precision_loss)]
        let cycle_time_min = (end - cycle.started_at).num_milliseconds() as f64 / 60_000.0;
        let start_battery = cycle.battery_start.unwrap_or_default();
        let end_battery = cycle.battery_end.unwrap_or(start_battery);
        Self {
            cycle: cycle.sequence,
            start: cycle.started_at,
            end,
            cycle_time_min,
            required: cycle.required.len(),
            completed: cycle.completed(),
            failed: cycle.failed(),
            arm_pointing_failures: cycle.arm_pointing_failures(),
            dock_wait_min: cycle.dock_wait_min,
            battery_start: start_battery.charge_percent,
            battery_end: end_battery.charge_percent,
            battery_delta: end_battery.charge_percent - start_battery.charge_percent,
            min_temp_start: start_battery.min_temp_c,
            max_temp_start: start_battery.max_temp_c,
            min_temp_end: end_battery.min_temp_c,
            max_temp_end: end_battery.max_temp_c,
            succeeded: cycle.succeeded(),
        }
    }

    fn to_row(&self) -> String {
        let timestamp = |at: &DateTime<Utc>| at.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        [
            self.cycle.to_string(),
            timestamp(&self.start),
            timestamp(&self.end),
            self.cycle_time_min.to_string(),
            self.required.to_string(),
            self.completed.to_string(),
            self.failed.to_string(),
            self.arm_pointing_failures.to_string(),
            self.dock_wait_min.to_string(),
            self.battery_start.to_string(),
            self.battery_end.to_string(),
            self.battery_delta.to_string(),
            self.min_temp_start.to_string(),
            self.max_temp_start.to_string(),
            self.min_temp_end.to_string(),
            self.max_temp_end.to_string(),
            self.succeeded.to_string(),
        ]
        .join(",")
    }

    fn from_row(row: &str, line: usize) -> Result<Self, CycleLogError> {
        let fields: Vec<&str> = row.split(',').map(str::trim).collect();
        if fields.len() != CYCLE_HEADER.len() {
            return Err(CycleLogError::MalformedRow {
                line,
                reason: format!("expected {} fields, found {}", CYCLE_HEADER.len(), fields.len()),
            });
        }
        let timestamp = |index: usize| {
            DateTime::parse_from_rfc3339(fields[index])
                .map(|at| at.with_timezone(&Utc))
                .map_err(|err| CycleLogError::MalformedRow {
                    line,
                    reason: format!("{}: {err}", CYCLE_HEADER[index]),
                })
        };
        Ok(Self {
            cycle: parse(&fields, 0, line)?,
            start: timestamp(1)?,
            end: timestamp(2)?,
            cycle_time_min: parse(&fields, 3, line)?,
            required: parse(&fields, 4, line)?,
            completed: parse(&fields, 5, line)?,
            failed: parse(&fields, 6, line)?,
            arm_pointing_failures: parse(&fields, 7, line)?,
            dock_wait_min: parse(&fields, 8, line)?,
            battery_start: parse(&fields, 9, line)?,
            battery_end: parse(&fields, 10, line)?,
            battery_delta: parse(&fields, 11, line)?,
            min_temp_start: parse(&fields, 12, line)?,
            max_temp_start: parse(&fields, 13, line)?,
            min_temp_end: parse(&fields, 14, line)?,
            max_temp_end: parse(&fields, 15, line)?,
            succeeded: parse(&fields, 16, line)?,
        })
    }
}

fn parse<T>(fields: &[&str], index: usize, line: usize) -> Result<T, CycleLogError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fields[index]
        .parse()
        .map_err(|err: T::Err| CycleLogError::MalformedRow {
            line,
            reason: format!("{}: {err}", CYCLE_HEADER[index]),
        })
}

/// Descriptive statistics over one column.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Stats {
    /// Arithmetic mean.
    pub mean: f64,
    /// Median.
    pub median: f64,
    /// Sample standard deviation; zero below two values.
    pub stdev: f64,
    /// Smallest value.
    pub min: f64,
    /// First quartile.
    pub q1: f64,
    /// Third quartile.
    pub q3: f64,
    /// Largest value.
    pub max: f64,
}

impl Stats {
    /// Statistics of `values`, `None` when empty. Quartiles interpolate
    /// linearly between closest ranks.
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        #[allow(clippy::cast_precision_loss)]
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let stdev = if sorted.len() < 2 {
            0.0
        } else {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        };
        Some(Self {
            mean,
            median: quantile(&sorted, 0.5),
            stdev,
            min: sorted[0],
            q1: quantile(&sorted, 0.25),
            q3: quantile(&sorted, 0.75),
            max: sorted[sorted.len() - 1],
        })
    }

    fn cells(&self) -> [f64; 7] {
        [self.mean, self.median, self.stdev, self.min, self.q1, self.q3, self.max]
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Aggregate over every cycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryRecord {
    /// Number of cycles.
    pub cycles: usize,
    /// Fraction of cycles that succeeded.
    pub success_rate: f64,
    /// Cycle time in minutes.
    pub cycle_time: Stats,
    /// Battery delta in percent.
    pub battery_delta: Stats,
}

impl SummaryRecord {
    /// Summary of `records`, `None` when there are none.
    #[must_use]
    pub fn from_records(records: &[CycleRecord]) -> Option<Self> {
        let times: Vec<f64> = records.iter().map(|r| r.cycle_time_min).collect();
        let deltas: Vec<f64> = records.iter().map(|r| r.battery_delta).collect();
        let succeeded = records.iter().filter(|r| r.succeeded).count();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = succeeded as f64 / records.len().max(1) as f64;
        Some(Self {
            cycles: records.len(),
            success_rate,
            cycle_time: Stats::from_values(&times)?,
            battery_delta: Stats::from_values(&deltas)?,
        })
    }

    fn to_row(&self) -> String {
        let mut cells = vec![self.cycles.to_string(), self.success_rate.to_string()];
        cells.extend(self.cycle_time.cells().iter().map(ToString::to_string));
        cells.extend(self.battery_delta.cells().iter().map(ToString::to_string));
        cells.join(",")
    }
}

/// Append-only CSV of completed cycles.
#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
}

impl CycleLog {
    /// Refers to an existing log without touching it.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the log for appending, writing the header when the file is new
    /// or empty.
    ///
    /// # Errors
    ///
    /// Fails when the file or its directory cannot be created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, CycleLogError> {
        let log = Self::open(path);
        if let Some(parent) = log.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| log.io(source))?;
        }
        let empty = fs::metadata(&log.path).map_or(true, |meta| meta.len() == 0);
        if empty {
            log.append_line(&CYCLE_HEADER.join(","))?;
        }
        Ok(log)
    }

    /// Path of the CSV file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one cycle row.
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn append(&self, record: &CycleRecord) -> Result<(), CycleLogError> {
        self.append_line(&record.to_row())
    }

    /// Appends the summary block: a blank line, its header, and one row.
    ///
    /// # Errors
    ///
    /// Fails on write errors.
    pub fn append_summary(&self, summary: &SummaryRecord) -> Result<(), CycleLogError> {
        self.append_line("")?;
        self.append_line(&SUMMARY_HEADER.join(","))?;
        self.append_line(&summary.to_row())
    }

    /// Reads the per-cycle block, stopping at the summary block.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, lacks the header, or holds a
    /// malformed row.
    pub fn read_records(&self) -> Result<Vec<CycleRecord>, CycleLogError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| self.io(source))?;
        let mut lines = raw.lines().enumerate();
        match lines.next() {
            Some((_, header)) if header.trim() == CYCLE_HEADER.join(",") => {}
            _ => {
                return Err(CycleLogError::MissingHeader {
                    path: self.path.clone(),
                })
            }
        }
        lines
            .map(|(index, row)| (index + 1, row))
            .take_while(|(_, row)| !row.trim().is_empty())
            .map(|(line, row)| CycleRecord::from_row(row, line))
            .collect()
    }

    fn append_line(&self, line: &str) -> Result<(), CycleLogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io(source))?;
        writeln!(file, "{line}").map_err(|source| self.io(source))
    }

    fn io(&self, source: std::io::Error) -> CycleLogError {
        CycleLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BatterySample, StationResult};
    use chrono::Duration;
    use tempfile::tempdir;

    fn record(cycle: u64, minutes: f64, delta: f64, succeeded: bool) -> CycleRecord {
        let start = DateTime::parse_from_rfc3339("2024-03-01T08:00:00.125Z")
            .unwrap()
            .with_timezone(&Utc);
        CycleRecord {
            cycle,
            start,
            end: start + Duration::seconds(90),
            cycle_time_min: minutes,
            required: 3,
            completed: if succeeded { 3 } else { 2 },
            failed: usize::from(!succeeded),
            arm_pointing_failures: 1,
            dock_wait_min: 0.0,
            battery_start: 88.4,
            battery_end: 88.4 + delta,
            battery_delta: delta,
            min_temp_start: 21.5,
            max_temp_start: 27.25,
            min_temp_end: 22.0,
            max_temp_end: 29.1,
            succeeded,
        }
    }

    #[test]
    fn rows_read_back_unchanged() {
        let dir = tempdir().unwrap();
        let log = CycleLog::create(dir.path().join("logs/cycles.csv")).unwrap();
        let written = vec![record(1, 1.5, -1.2, true), record(2, 2.0 / 3.0, -0.8, false)];
        for row in &written {
            log.append(row).unwrap();
        }
        assert_eq!(log.read_records().unwrap(), written);
    }

    #[test]
    fn reopening_keeps_single_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles.csv");
        CycleLog::create(&path).unwrap().append(&record(1, 1.0, -1.0, true)).unwrap();
        CycleLog::create(&path).unwrap().append(&record(2, 1.0, -1.0, true)).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.matches("cycle#").count(), 1);
        assert_eq!(CycleLog::open(&path).read_records().unwrap().len(), 2);
    }

    #[test]
    fn summary_block_is_skipped_when_reading() {
        let dir = tempdir().unwrap();
        let log = CycleLog::create(dir.path().join("cycles.csv")).unwrap();
        let records = vec![record(1, 1.0, -1.0, true), record(2, 3.0, -2.0, false)];
        for row in &records {
            log.append(row).unwrap();
        }
        let summary = SummaryRecord::from_records(&records).unwrap();
        log.append_summary(&summary).unwrap();

        assert_eq!(log.read_records().unwrap(), records);
        let raw = fs::read_to_string(log.path()).unwrap();
        let tail: Vec<&str> = raw.lines().rev().take(2).collect();
        assert!(tail[1].starts_with("cycles,success-rate"));
        assert!(tail[0].starts_with("2,0.5,2,2,"));
    }

    #[test]
    fn missing_header_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles.csv");
        fs::write(&path, "1,2,3\n").unwrap();
        assert!(matches!(
            CycleLog::open(&path).read_records(),
            Err(CycleLogError::MissingHeader { .. })
        ));
    }

    #[test]
    fn malformed_row_reports_line() {
        let dir = tempdir().unwrap();
        let log = CycleLog::create(dir.path().join("cycles.csv")).unwrap();
        log.append(&record(1, 1.0, -1.0, true)).unwrap();
        log.append_line("2,oops").unwrap();
        match log.read_records() {
            Err(CycleLogError::MalformedRow { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn statistics_use_sample_stdev_and_interpolated_quartiles() {
        let stats = Stats::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.median - 2.5).abs() < 1e-12);
        assert!((stats.q1 - 1.75).abs() < 1e-12);
        assert!((stats.q3 - 3.25).abs() < 1e-12);
        assert!((stats.stdev - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(Stats::from_values(&[7.0]).unwrap().stdev, 0.0);
        assert!(Stats::from_values(&[]).is_none());
        assert!(SummaryRecord::from_records(&[]).is_none());
    }

    #[test]
    fn record_from_cycle_counts_stations() {
        let mut cycle = InspectionCycle::start(4, None, vec!["station_1".into(), "station_2".into()]);
        cycle.battery_start = Some(BatterySample {
            charge_percent: 80.0,
            min_temp_c: 20.0,
            max_temp_c: 25.0,
        });
        cycle.battery_end = Some(BatterySample {
            charge_percent: 78.5,
            min_temp_c: 21.0,
            max_temp_c: 26.0,
        });
        cycle.results.push(StationResult {
            station: "station_1".into(),
            success: true,
            skipped: false,
            elapsed_s: 30.0,
            arm_pointing_failures: 2,
            captures: 1,
            detail: None,
        });
        cycle.results.push(StationResult::failed("station_2", 10.0, "timeout"));
        cycle.ended_at = Some(cycle.started_at + Duration::seconds(120));

        let row = CycleRecord::from_cycle(&cycle);
        assert_eq!(row.cycle, 4);
        assert!((row.cycle_time_min - 2.0).abs() < 1e-9);
        assert_eq!((row.required, row.completed, row.failed), (2, 1, 1));
        assert_eq!(row.arm_pointing_failures, 2);
        assert!((row.battery_delta + 1.5).abs() < 1e-9);
        assert!(!row.succeeded);
    }
}
