use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cell_config::StationSettings;
use cell_links::{LeaseToken, LinkError, NavigationApi};
use cell_mission::{
    with_retry_when, ActionGraph, CaptureHook, CaptureSink, ExecutionOptions, MissionElement,
    MissionEngine, RetryPolicy,
};
use cell_pose_corrector::{ArmCorrectionDataset, PoseCorrector, RegistrationTarget};
use tokio::{sync::OnceCell, time::Instant};
use tracing::{info, instrument, warn};

use crate::{gate::ResourceGate, state::StationResult};

/// Runs one station's physical work.
#[async_trait]
pub trait StationRunner: Send + Sync {
    /// Executes `station` and reports the outcome. Never fails; problems are
    /// folded into the result.
    async fn run_station(&self, station: &str, settings: &StationSettings) -> StationResult;
}

/// Station runner that drives to the station waypoint and plays the
/// station's slice of the base action graph.
pub struct MissionStationRunner {
    engine: Arc<MissionEngine>,
    graph: Arc<ActionGraph>,
    navigation: Arc<dyn NavigationApi>,
    gate: Arc<ResourceGate>,
    sink: Arc<dyn CaptureSink>,
    retry: RetryPolicy,
    navigation_timeout: Duration,
    mission_timeout: Duration,
}

impl std::fmt::Debug for MissionStationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionStationRunner")
            .field("graph", &self.graph.name)
            .field("mission_timeout", &self.mission_timeout)
            .finish_non_exhaustive()
    }
}

impl MissionStationRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        engine: Arc<MissionEngine>,
        graph: Arc<ActionGraph>,
        navigation: Arc<dyn NavigationApi>,
        gate: Arc<ResourceGate>,
        sink: Arc<dyn CaptureSink>,
    ) -> Self {
        Self {
            engine,
            graph,
            navigation,
            gate,
            sink,
            retry: RetryPolicy::default(),
            navigation_timeout: Duration::from_secs(120),
            mission_timeout: Duration::from_secs(600),
        }
    }

    /// Sets the retry policy for navigation.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-station mission timeout.
    #[must_use]
    pub const fn with_mission_timeout(mut self, timeout: Duration) -> Self {
        self.mission_timeout = timeout;
        self
    }

    /// Sets the navigation timeout.
    #[must_use]
    pub const fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    /// Station's slice of the base graph with pose correction flags applied.
    fn station_graph(&self, settings: &StationSettings) -> Result<ActionGraph, String> {
        let mut graph = self
            .graph
            .subset(&settings.elements)
            .map_err(|err| err.to_string())?;
        for element in &mut graph.elements {
            if settings.pose_correction.contains(&element.id) {
                element.pose_correction = true;
            }
        }
        Ok(graph)
    }
}

#[async_trait]
impl StationRunner for MissionStationRunner {
    #[instrument(skip(self, settings), fields(waypoint = %settings.waypoint))]
    async fn run_station(&self, station: &str, settings: &StationSettings) -> StationResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_secs_f64();

        let graph = match self.station_graph(settings) {
            Ok(graph) => graph,
            Err(detail) => {
                warn!(%detail, "station graph could not be built");
                return StationResult::failed(station, elapsed(), detail);
            }
        };

        let lease = match self.gate.lease().await {
            Ok(lease) => lease,
            Err(err) => return StationResult::failed(station, elapsed(), err.to_string()),
        };
        let navigation = with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.navigation
                .navigate_to(&lease, &settings.waypoint, self.navigation_timeout)
        })
        .await;
        if let Err(err) = navigation {
            warn!(error = %err, "navigation to station failed");
            return StationResult::failed(station, elapsed(), format!("navigation: {err}"));
        }

        let options = ExecutionOptions {
            timeout: self.mission_timeout,
            answer_keyword: settings.default_answer.clone(),
        };
        let report = self
            .engine
            .execute_with(&graph, &options, Arc::clone(&self.sink))
            .await;
        let arm_pointing_failures = report.corrections.iter().filter(|c| !c.applied).count();
        let captures = report.retrievals.succeeded.iter().map(|r| r.stored).sum();
        info!(
            success = report.success,
            elapsed_s = report.elapsed_s,
            captures,
            "station mission finished"
        );
        StationResult {
            station: station.to_string(),
            success: report.success,
            skipped: false,
            elapsed_s: elapsed(),
            arm_pointing_failures: u32::try_from(arm_pointing_failures).unwrap_or(u32::MAX),
            captures,
            detail: report.failure.map(|failure| failure.to_string()),
        }
    }
}

/// Runs the pose corrector before flagged captures.
///
/// The master cloud is indexed on the first flagged capture and the target
/// is reused for every later one.
pub struct PoseCorrectionHook {
    corrector: PoseCorrector,
    master: ArmCorrectionDataset,
    target: OnceCell<Option<Arc<RegistrationTarget>>>,
    fitness_threshold: f64,
}

impl std::fmt::Debug for PoseCorrectionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseCorrectionHook")
            .field("fitness_threshold", &self.fitness_threshold)
            .field("indexed", &self.target.initialized())
            .finish_non_exhaustive()
    }
}

impl PoseCorrectionHook {
    /// Hook correcting against `master`.
    #[must_use]
    pub fn new(corrector: PoseCorrector, master: ArmCorrectionDataset, fitness_threshold: f64) -> Self {
        Self {
            corrector,
            master,
            target: OnceCell::new(),
            fitness_threshold,
        }
    }

    /// Indexed master, built once. `None` when the master cannot be used.
    async fn target(&self) -> Option<&Arc<RegistrationTarget>> {
        self.target
            .get_or_init(|| self.corrector.prepare(&self.master))
            .await
            .as_ref()
    }
}

#[async_trait]
impl CaptureHook for PoseCorrectionHook {
    async fn before_capture(&self, element: &MissionElement, lease: &LeaseToken) -> bool {
        let applied = match self.target().await {
            Some(target) => {
                self.corrector
                    .correct_against(lease, target, self.fitness_threshold)
                    .await
            }
            None => false,
        };
        if !applied {
            warn!(element = %element.id, "capturing from the uncorrected pose");
        }
        applied
    }
}
