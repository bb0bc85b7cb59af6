use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Per-station settings keyed by station name.
    #[serde(default = "default_stations")]
    pub stations: IndexMap<String, StationSettings>,
    /// Hole inspection (pose-corrected capture) settings.
    #[serde(default)]
    pub hole_inspection: HoleInspection,
    /// Battery and registration thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Named waypoints outside the stations.
    #[serde(default)]
    pub waypoints: Waypoints,
    /// Dock the agent charges on.
    #[serde(default = "default_dock_id")]
    pub dock_id: u32,
    /// Control loop timing and station order.
    #[serde(default)]
    pub cycle: CycleSettings,
    /// Mission engine tuning.
    #[serde(default)]
    pub mission: MissionSettings,
    /// Registration tuning.
    #[serde(default)]
    pub registration: RegistrationSettings,
    /// Classification string to the stations that run for it.
    #[serde(default)]
    pub variants: IndexMap<String, Vec<String>>,
    /// Plant tag names.
    #[serde(default)]
    pub signals: SignalTags,
    /// Hand depth camera intrinsics.
    #[serde(default)]
    pub camera: CameraIntrinsics,
    #[serde(skip)]
    pub(crate) source_dir: PathBuf,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            stations: default_stations(),
            hole_inspection: HoleInspection::default(),
            thresholds: Thresholds::default(),
            waypoints: Waypoints::default(),
            dock_id: default_dock_id(),
            cycle: CycleSettings::default(),
            mission: MissionSettings::default(),
            registration: RegistrationSettings::default(),
            variants: IndexMap::new(),
            signals: SignalTags::default(),
            camera: CameraIntrinsics::default(),
            source_dir: PathBuf::from("."),
        }
    }
}

impl CellConfig {
    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if !(0.0..=100.0).contains(&t.battery_low) || !(0.0..=100.0).contains(&t.battery_enough) {
            return Err(ConfigError::Invalid(
                "battery thresholds must lie within 0..=100".into(),
            ));
        }
        if t.battery_low >= t.battery_enough {
            return Err(ConfigError::Invalid(format!(
                "battery_low ({}) must be below battery_enough ({})",
                t.battery_low, t.battery_enough
            )));
        }
        if !(t.fitness > 0.0 && t.fitness <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "fitness threshold {} outside (0, 1]",
                t.fitness
            )));
        }
        let order = &self.cycle.station_order;
        if order.is_empty() || order.len() > 3 {
            return Err(ConfigError::Invalid(format!(
                "station_order needs 1 to 3 entries, got {}",
                order.len()
            )));
        }
        if let Some(missing) = order.iter().find(|name| !self.stations.contains_key(*name)) {
            return Err(ConfigError::Invalid(format!(
                "station_order names unknown station `{missing}`"
            )));
        }
        for (variant, stations) in &self.variants {
            if let Some(missing) = stations.iter().find(|name| !order.contains(name)) {
                return Err(ConfigError::Invalid(format!(
                    "variant `{variant}` names station `{missing}` outside station_order"
                )));
            }
        }
        if self.cycle.tick_ms == 0 {
            return Err(ConfigError::Invalid("cycle.tick_ms must be positive".into()));
        }
        if self.mission.retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "mission.retry_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Directory the configuration was loaded from.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Resolves a path relative to the configuration file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.source_dir.join(candidate)
        }
    }

    /// Absolute paths of the master arm-correction dataset files.
    #[must_use]
    pub fn correction_files(&self) -> CorrectionFiles {
        let data = &self.hole_inspection.arm_correction_data;
        let root = self.resolve_path(&data.path);
        let join = |file: &Path| {
            if file.is_absolute() {
                file.to_path_buf()
            } else {
                root.join(file)
            }
        };
        CorrectionFiles {
            hand_depth: join(&data.hand_depth),
            hand_color: join(&data.hand_color),
            depth_color: join(&data.depth_color),
            arm_pose: join(&data.arm_pose),
        }
    }

    /// Stations to run for a classification, in station order.
    ///
    /// Unknown or empty classifications run every configured station.
    #[must_use]
    pub fn stations_for(&self, classification: Option<&str>) -> Vec<String> {
        let selected = classification
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| self.variants.get(value));
        match selected {
            Some(stations) => self
                .cycle
                .station_order
                .iter()
                .filter(|name| stations.contains(name))
                .cloned()
                .collect(),
            None => self.cycle.station_order.clone(),
        }
    }
}

/// Settings for one inspection station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StationSettings {
    /// Waypoint the agent navigates to before the station mission.
    pub waypoint: String,
    /// Capture resolution, e.g. `1920x1080`.
    #[serde(default)]
    pub resolution: String,
    /// Absolute focus value for the capture camera.
    #[serde(default)]
    pub focus_absolute: u32,
    /// Arm joint pose used for the capture.
    #[serde(default)]
    pub arm_position: ArmPosition,
    /// Base graph element ids making up the station mission.
    #[serde(default)]
    pub elements: Vec<String>,
    /// Element ids that trigger sensor pose correction before capture.
    #[serde(default)]
    pub pose_correction: Vec<String>,
    /// Answer keyword override for operator questions raised in this station.
    #[serde(default)]
    pub default_answer: Option<String>,
}

/// Six-joint arm configuration in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[allow(missing_docs)]
pub struct ArmPosition {
    pub sh0: f64,
    pub sh1: f64,
    pub el0: f64,
    pub el1: f64,
    pub wr0: f64,
    pub wr1: f64,
}

/// Pose-corrected hole inspection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HoleInspection {
    /// Region of interest `[x, y, width, height]` in pixels.
    #[serde(default)]
    pub region: [u32; 4],
    /// Template image matched inside the region.
    #[serde(default)]
    pub template_image_path: PathBuf,
    /// Master dataset file names.
    #[serde(default)]
    pub arm_correction_data: ArmCorrectionData,
}

/// File names of the master arm-correction dataset, relative to `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmCorrectionData {
    /// Hand depth frame (JSON).
    pub hand_depth: PathBuf,
    /// Hand color image.
    pub hand_color: PathBuf,
    /// Depth rendered in color, for operators.
    pub depth_color: PathBuf,
    /// End-effector pose at capture time (JSON).
    pub arm_pose: PathBuf,
    /// Dataset directory, relative to the configuration file.
    pub path: PathBuf,
}

impl Default for ArmCorrectionData {
    fn default() -> Self {
        Self {
            hand_depth: PathBuf::from("hand_depth.json"),
            hand_color: PathBuf::from("hand_color.png"),
            depth_color: PathBuf::from("depth_color.png"),
            arm_pose: PathBuf::from("arm_pose.json"),
            path: PathBuf::from("master"),
        }
    }
}

/// Resolved master dataset files.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CorrectionFiles {
    pub hand_depth: PathBuf,
    pub hand_color: PathBuf,
    pub depth_color: PathBuf,
    pub arm_pose: PathBuf,
}

/// Battery and registration thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Below this charge (percent) the agent is sent to charge.
    #[serde(default = "default_battery_low")]
    pub battery_low: f64,
    /// At or above this charge (percent) charging ends.
    #[serde(default = "default_battery_enough")]
    pub battery_enough: f64,
    /// Minimum registration fitness for a correction to be applied.
    #[serde(default = "default_fitness")]
    pub fitness: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            battery_low: default_battery_low(),
            battery_enough: default_battery_enough(),
            fitness: default_fitness(),
        }
    }
}

/// Named waypoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waypoints {
    /// Parking position between cycles.
    #[serde(default = "default_home")]
    pub home: String,
    /// Position reached after the last station.
    #[serde(default = "default_complete")]
    pub complete: String,
    /// Waypoint in front of the dock.
    #[serde(default = "default_dock")]
    pub dock: String,
}

impl Default for Waypoints {
    fn default() -> Self {
        Self {
            home: default_home(),
            complete: default_complete(),
            dock: default_dock(),
        }
    }
}

/// Control loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSettings {
    /// Control loop period in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Deadline of one station mission in seconds.
    #[serde(default = "default_mission_timeout_s")]
    pub mission_timeout_s: u64,
    /// Stations in execution order.
    #[serde(default = "default_station_order")]
    pub station_order: Vec<String>,
    /// Hold final completion until an operator confirms, if any station failed.
    #[serde(default)]
    pub require_confirmation_on_failure: bool,
    /// Status monitor period in milliseconds.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            mission_timeout_s: default_mission_timeout_s(),
            station_order: default_station_order(),
            require_confirmation_on_failure: false,
            status_interval_ms: default_status_interval_ms(),
        }
    }
}

/// Mission engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionSettings {
    /// Directory holding `graph.json` and its snapshots.
    #[serde(default = "default_graph_dir")]
    pub graph_dir: PathBuf,
    /// Seconds between play requests.
    #[serde(default = "default_play_interval_s")]
    pub play_interval_s: u64,
    /// Milliseconds between status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempts per remote call, first included.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between failed attempts in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Regular expression matching questions that only ask the mission to wait.
    #[serde(default = "default_benign_pattern")]
    pub benign_question_pattern: String,
    /// Option keyword chosen when answering other questions.
    #[serde(default = "default_answer_keyword")]
    pub answer_keyword: String,
    /// Concurrent artifact downloads.
    #[serde(default = "default_artifact_workers")]
    pub artifact_workers: usize,
}

impl Default for MissionSettings {
    fn default() -> Self {
        Self {
            graph_dir: default_graph_dir(),
            play_interval_s: default_play_interval_s(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            benign_question_pattern: default_benign_pattern(),
            answer_keyword: default_answer_keyword(),
            artifact_workers: default_artifact_workers(),
        }
    }
}

/// Point-cloud registration tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSettings {
    /// ICP iteration budget.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Correspondences farther than this (meters) are ignored.
    #[serde(default = "default_max_correspondence")]
    pub max_correspondence_distance: f64,
    /// Robust kernel scale in meters.
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Neighbours used for normal estimation.
    #[serde(default = "default_normal_neighbors")]
    pub normal_neighbors: usize,
    /// Registration passes per correction.
    #[serde(default = "default_correction_attempts")]
    pub attempts: u32,
    /// Duration of the corrective arm move in seconds.
    #[serde(default = "default_move_duration_s")]
    pub move_duration_s: f64,
    /// Keep every n-th valid pixel when building clouds.
    #[serde(default = "default_pixel_stride")]
    pub pixel_stride: u32,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_correspondence_distance: default_max_correspondence(),
            sigma: default_sigma(),
            normal_neighbors: default_normal_neighbors(),
            attempts: default_correction_attempts(),
            move_duration_s: default_move_duration_s(),
            pixel_stride: default_pixel_stride(),
        }
    }
}

/// Plant tag names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTags {
    /// Conveyance arrived at the cell.
    #[serde(default = "tag_arrival")]
    pub arrival: String,
    /// Conveyance left the cell.
    #[serde(default = "tag_departure")]
    pub departure: String,
    /// Classification string of the conveyed item.
    #[serde(default = "tag_classification")]
    pub classification: String,
    /// Overall cycle completion.
    #[serde(default = "tag_cycle_complete")]
    pub cycle_complete: String,
    /// Overall cycle error.
    #[serde(default = "tag_cycle_error")]
    pub cycle_error: String,
    /// Bypass engaged.
    #[serde(default = "tag_bypass_on")]
    pub bypass_on: String,
    /// Last work complete, written together with bypass.
    #[serde(default = "tag_last_work_complete")]
    pub last_work_complete: String,
    /// Cycle time in minutes.
    #[serde(default = "tag_cycle_time")]
    pub cycle_time: String,
    /// Operator confirmation of a held completion.
    #[serde(default = "tag_confirmation")]
    pub confirmation: String,
    /// Per-station completion tag overrides.
    #[serde(default)]
    pub station_complete: IndexMap<String, String>,
    /// Per-station error tag overrides.
    #[serde(default)]
    pub station_error: IndexMap<String, String>,
}

impl Default for SignalTags {
    fn default() -> Self {
        Self {
            arrival: tag_arrival(),
            departure: tag_departure(),
            classification: tag_classification(),
            cycle_complete: tag_cycle_complete(),
            cycle_error: tag_cycle_error(),
            bypass_on: tag_bypass_on(),
            last_work_complete: tag_last_work_complete(),
            cycle_time: tag_cycle_time(),
            confirmation: tag_confirmation(),
            station_complete: IndexMap::new(),
            station_error: IndexMap::new(),
        }
    }
}

impl SignalTags {
    /// Completion tag of a station, `<station>_complete` unless overridden.
    #[must_use]
    pub fn complete_tag(&self, station: &str) -> String {
        self.station_complete
            .get(station)
            .cloned()
            .unwrap_or_else(|| format!("{station}_complete"))
    }

    /// Error tag of a station, `<station>_error` unless overridden.
    #[must_use]
    pub fn error_tag(&self, station: &str) -> String {
        self.station_error
            .get(station)
            .cloned()
            .unwrap_or_else(|| format!("{station}_error"))
    }
}

/// Pinhole intrinsics of the hand depth camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length along x in pixels.
    pub fx: f64,
    /// Focal length along y in pixels.
    pub fy: f64,
    /// Principal point x.
    pub cx: f64,
    /// Principal point y.
    pub cy: f64,
    /// Raw depth units per meter (1.0 when frames are already metric).
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f64,
    /// Closer points are discarded (meters).
    #[serde(default = "default_min_depth")]
    pub min_depth: f64,
    /// Farther points are discarded (meters).
    #[serde(default = "default_max_depth")]
    pub max_depth: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            fx: 217.0,
            fy: 217.0,
            cx: 112.0,
            cy: 87.0,
            depth_scale: default_depth_scale(),
            min_depth: default_min_depth(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_stations() -> IndexMap<String, StationSettings> {
    default_station_order()
        .into_iter()
        .map(|name| {
            let settings = StationSettings {
                waypoint: format!("{name}_wp"),
                resolution: "1920x1080".into(),
                ..StationSettings::default()
            };
            (name, settings)
        })
        .collect()
}

fn default_station_order() -> Vec<String> {
    vec!["station_1".into(), "station_2".into(), "station_3".into()]
}

const fn default_dock_id() -> u32 {
    520
}
const fn default_battery_low() -> f64 {
    20.0
}
const fn default_battery_enough() -> f64 {
    80.0
}
const fn default_fitness() -> f64 {
    0.5
}
fn default_home() -> String {
    "home".into()
}
fn default_complete() -> String {
    "complete".into()
}
fn default_dock() -> String {
    "dock".into()
}
const fn default_tick_ms() -> u64 {
    200
}
const fn default_mission_timeout_s() -> u64 {
    600
}
const fn default_status_interval_ms() -> u64 {
    1000
}
fn default_graph_dir() -> PathBuf {
    PathBuf::from("graph")
}
const fn default_play_interval_s() -> u64 {
    10
}
const fn default_poll_interval_ms() -> u64 {
    250
}
const fn default_retry_attempts() -> u32 {
    4
}
const fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_benign_pattern() -> String {
    "(?i)\\bwait(ing)?\\b".into()
}
fn default_answer_keyword() -> String {
    "skip".into()
}
const fn default_artifact_workers() -> usize {
    4
}
const fn default_max_iterations() -> usize {
    30
}
const fn default_max_correspondence() -> f64 {
    0.05
}
const fn default_sigma() -> f64 {
    0.01
}
const fn default_normal_neighbors() -> usize {
    8
}
const fn default_correction_attempts() -> u32 {
    2
}
const fn default_move_duration_s() -> f64 {
    2.0
}
const fn default_pixel_stride() -> u32 {
    2
}
const fn default_depth_scale() -> f64 {
    1.0
}
const fn default_min_depth() -> f64 {
    0.1
}
const fn default_max_depth() -> f64 {
    2.0
}
fn tag_arrival() -> String {
    "agv_arrived".into()
}
fn tag_departure() -> String {
    "agv_departed".into()
}
fn tag_classification() -> String {
    "body_type".into()
}
fn tag_cycle_complete() -> String {
    "work_complete".into()
}
fn tag_cycle_error() -> String {
    "work_error".into()
}
fn tag_bypass_on() -> String {
    "bypass_on".into()
}
fn tag_last_work_complete() -> String {
    "last_work_complete".into()
}
fn tag_cycle_time() -> String {
    "cycle_time_min".into()
}
fn tag_confirmation() -> String {
    "operator_confirm".into()
}
