use std::{sync::Arc, time::Duration};

use cell_config::{CameraIntrinsics, RegistrationSettings};
use cell_links::{CaptureApi, LeaseToken, MotionApi, Pose};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tracing::{info, instrument, warn};

use crate::{
    cloud::PointCloud,
    dataset::ArmCorrectionDataset,
    error::CorrectionError,
    icp::{register, IcpParams, RegistrationTarget},
    telemetry::CorrectorTelemetry,
    transform::corrected_pose,
};

/// One capture-and-register pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrectionAttempt {
    /// Registration fitness.
    pub fitness: f64,
    /// Inlier RMSE in meters.
    pub inlier_rmse: f64,
    /// Pose the arm was sent to, when fitness cleared the threshold.
    pub applied: Option<Pose>,
}

/// Re-aims the hand camera at a recorded reference view.
pub struct PoseCorrector {
    motion: Arc<dyn MotionApi>,
    capture: Arc<dyn CaptureApi>,
    intrinsics: CameraIntrinsics,
    params: IcpParams,
    attempts: u32,
    pixel_stride: u32,
    move_duration: Duration,
    telemetry: Option<CorrectorTelemetry>,
}

impl std::fmt::Debug for PoseCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseCorrector")
            .field("params", &self.params)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl PoseCorrector {
    /// Corrector with default registration tuning.
    #[must_use]
    pub fn new(motion: Arc<dyn MotionApi>, capture: Arc<dyn CaptureApi>) -> Self {
        let settings = RegistrationSettings::default();
        Self {
            motion,
            capture,
            intrinsics: CameraIntrinsics::default(),
            params: IcpParams::from(&settings),
            attempts: settings.attempts,
            pixel_stride: settings.pixel_stride,
            move_duration: Duration::from_secs_f64(settings.move_duration_s),
            telemetry: None,
        }
    }

    /// Applies registration tuning from configuration.
    #[must_use]
    pub fn with_settings(mut self, settings: &RegistrationSettings) -> Self {
        self.params = IcpParams::from(settings);
        self.attempts = settings.attempts.max(1);
        self.pixel_stride = settings.pixel_stride.max(1);
        self.move_duration = Duration::from_secs_f64(settings.move_duration_s.max(0.0));
        self
    }

    /// Sets the hand camera intrinsics.
    #[must_use]
    pub const fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: CorrectorTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Camera intrinsics in use.
    #[must_use]
    pub const fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    /// Pixel stride used to build clouds.
    #[must_use]
    pub const fn pixel_stride(&self) -> u32 {
        self.pixel_stride
    }

    /// Aligns the camera with `master`.
    ///
    /// Returns whether a corrective move was issued. A registration whose
    /// fitness does not exceed `fitness_threshold` is discarded and the arm
    /// stays where it is. Capture, registration and motion failures are
    /// logged and also reported as `false`.
    ///
    /// Indexes the master cloud on every call. Callers correcting against
    /// the same master repeatedly should [`prepare`](Self::prepare) it once
    /// and use [`correct_against`](Self::correct_against).
    pub async fn correct(
        &self,
        lease: &LeaseToken,
        master: &ArmCorrectionDataset,
        fitness_threshold: f64,
    ) -> bool {
        match self.prepare(master).await {
            Some(target) => self.correct_against(lease, &target, fitness_threshold).await,
            None => false,
        }
    }

    /// Builds the registration target (KD-tree and normals) for `master`.
    ///
    /// `None` when the master cloud is empty or indexing failed, both logged.
    #[instrument(skip(self, master), fields(master_points = master.cloud.len()))]
    pub async fn prepare(&self, master: &ArmCorrectionDataset) -> Option<Arc<RegistrationTarget>> {
        if master.cloud.is_empty() {
            warn!("master cloud is empty; skipping correction");
            self.log(LogLevel::Warn, "correction.skipped", json!({ "reason": "empty master" }));
            return None;
        }
        let cloud = PointCloud::clone(&master.cloud);
        let k = self.params.normal_neighbors;
        match tokio::task::spawn_blocking(move || RegistrationTarget::new(cloud, k)).await {
            Ok(target) => Some(Arc::new(target)),
            Err(err) => {
                warn!(error = %err, "indexing master cloud failed");
                self.log(
                    LogLevel::Warn,
                    "correction.skipped",
                    json!({ "reason": "indexing failed", "error": err.to_string() }),
                );
                None
            }
        }
    }

    /// Aligns the camera with an already indexed master.
    ///
    /// Same outcome rules as [`correct`](Self::correct).
    #[instrument(skip(self, lease, target), fields(master_points = target.cloud().len()))]
    pub async fn correct_against(
        &self,
        lease: &LeaseToken,
        target: &Arc<RegistrationTarget>,
        fitness_threshold: f64,
    ) -> bool {
        for attempt in 1..=self.attempts {
            match self.attempt(lease, target, fitness_threshold).await {
                Ok(outcome) if outcome.applied.is_some() => {
                    info!(attempt, fitness = outcome.fitness, "pose correction applied");
                    self.log(
                        LogLevel::Info,
                        "correction.applied",
                        json!({ "attempt": attempt, "outcome": outcome }),
                    );
                    self.event("pose.corrected", json!({ "attempt": attempt, "outcome": outcome }));
                    return true;
                }
                Ok(outcome) => {
                    info!(
                        attempt,
                        fitness = outcome.fitness,
                        threshold = fitness_threshold,
                        "registration below fitness threshold"
                    );
                    self.log(
                        LogLevel::Info,
                        "correction.low_fitness",
                        json!({ "attempt": attempt, "outcome": outcome, "threshold": fitness_threshold }),
                    );
                }
                Err(err) => {
                    warn!(attempt, error = %err, "correction attempt failed");
                    self.log(
                        LogLevel::Warn,
                        "correction.attempt_failed",
                        json!({ "attempt": attempt, "error": err.to_string() }),
                    );
                }
            }
        }
        self.event("pose.uncorrected", json!({ "attempts": self.attempts }));
        false
    }

    async fn attempt(
        &self,
        lease: &LeaseToken,
        target: &Arc<RegistrationTarget>,
        fitness_threshold: f64,
    ) -> Result<CorrectionAttempt, CorrectionError> {
        let frame = self.capture.capture_depth().await?;
        let nominal = self.motion.end_effector_pose().await?;
        let source = PointCloud::from_depth(&frame, &self.intrinsics, self.pixel_stride);

        let target = Arc::clone(target);
        let params = self.params;
        let result = tokio::task::spawn_blocking(move || register(&source, &target, &params))
            .await
            .map_err(|err| CorrectionError::Task(err.to_string()))??;

        if result.fitness <= fitness_threshold {
            return Ok(CorrectionAttempt {
                fitness: result.fitness,
                inlier_rmse: result.inlier_rmse,
                applied: None,
            });
        }
        let pose = corrected_pose(&nominal, &result.transform);
        self.motion
            .move_end_effector(lease, &pose, self.move_duration)
            .await?;
        Ok(CorrectionAttempt {
            fitness: result.fitness,
            inlier_rmse: result.inlier_rmse,
            applied: Some(pose),
        })
    }

    fn log(&self, level: LogLevel, operation: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, operation, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_links::{AgentCall, AuthorityApi, DepthFrame, SimulatedAgent, StatusApi};
    use chrono::Utc;
    use shared_event_bus::MemoryEventBus;

    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 48;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 60.0,
            fy: 60.0,
            cx: 31.5,
            cy: 23.5,
            ..CameraIntrinsics::default()
        }
    }

    /// Wavy panel at ~0.6 m. Columns from `far_from` on see a wall at ~1.5 m.
    fn frame(far_from: u32) -> DepthFrame {
        sized_frame(WIDTH, HEIGHT, far_from)
    }

    fn sized_frame(width: u32, height: u32, far_from: u32) -> DepthFrame {
        let mut depths = Vec::with_capacity((width * height) as usize);
        for v in 0..height {
            for u in 0..width {
                let (fu, fv) = (f64::from(u), f64::from(v));
                let wave = (0.4 * fu).sin() * (0.35 * fv).cos();
                let z = if u >= far_from {
                    0.05f64.mul_add(wave, 1.5)
                } else {
                    0.02f64.mul_add(wave, 0.6)
                };
                #[allow(clippy::cast_possible_truncation)]
                depths.push(z as f32);
            }
        }
        DepthFrame {
            width,
            height,
            depths,
            captured_at: Utc::now(),
        }
    }

    async fn setup(capture: DepthFrame) -> (Arc<SimulatedAgent>, LeaseToken, ArmCorrectionDataset) {
        let agent = Arc::new(SimulatedAgent::powered());
        let lease = agent.acquire().await.unwrap();
        agent.power_on(&lease).await.unwrap();
        let nominal = Pose::at(0.7, 0.05, 0.4);
        agent.set_pose(nominal);
        agent.set_depth_frame(capture);
        let master = ArmCorrectionDataset::from_capture(&frame(WIDTH), nominal, &intrinsics(), 1);
        (agent, lease, master)
    }

    fn corrector(agent: &Arc<SimulatedAgent>) -> PoseCorrector {
        PoseCorrector::new(agent.clone(), agent.clone()).with_intrinsics(intrinsics())
    }

    fn moves(agent: &SimulatedAgent) -> Vec<Pose> {
        agent
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::MoveEndEffector(pose) => Some(pose),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn matching_view_moves_to_nominal() {
        let (agent, lease, master) = setup(frame(WIDTH)).await;
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = CorrectorTelemetry::builder("pose_corrector")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let corrector = corrector(&agent).with_telemetry(telemetry);

        assert!(corrector.correct(&lease, &master, 0.5).await);
        let moves = moves(&agent);
        assert_eq!(moves.len(), 1);
        let moved = moves[0].position;
        assert!((moved.x - 0.7).abs() < 1e-6);
        assert!((moved.y - 0.05).abs() < 1e-6);
        assert!((moved.z - 0.4).abs() < 1e-6);
        tokio::task::yield_now().await;
        assert_eq!(bus.events_of("pose.corrected").len(), 1);
    }

    #[tokio::test]
    async fn low_fitness_issues_no_move() {
        // Only the left third of the view still shows the panel.
        let (agent, lease, master) = setup(frame(WIDTH / 3)).await;
        let corrector = corrector(&agent);

        assert!(!corrector.correct(&lease, &master, 0.5).await);
        assert!(moves(&agent).is_empty());
        let captures = agent.count_calls(|call| matches!(call, AgentCall::CaptureDepth));
        assert_eq!(captures, RegistrationSettings::default().attempts as usize);
    }

    #[tokio::test]
    async fn capture_failures_are_not_errors() {
        let (agent, lease, master) = setup(frame(WIDTH)).await;
        agent.fail_next("capture_depth", 10);
        assert!(!corrector(&agent).correct(&lease, &master, 0.5).await);
        assert!(moves(&agent).is_empty());
    }

    #[tokio::test]
    async fn motion_refusal_reports_no_correction() {
        let (agent, lease, master) = setup(frame(WIDTH)).await;
        agent.set_estop(true);
        assert!(!corrector(&agent).correct(&lease, &master, 0.5).await);
    }

    #[tokio::test]
    async fn empty_master_is_skipped() {
        let (agent, lease, _) = setup(frame(WIDTH)).await;
        // Every pixel of frame(0) sees the far wall, beyond this max depth.
        let tight = CameraIntrinsics {
            max_depth: 1.0,
            ..intrinsics()
        };
        let empty = ArmCorrectionDataset::from_capture(&frame(0), Pose::default(), &tight, 1);
        assert!(empty.cloud.is_empty());
        assert!(!corrector(&agent).correct(&lease, &empty, 0.5).await);
        assert_eq!(agent.count_calls(|call| matches!(call, AgentCall::CaptureDepth)), 0);
    }

    #[tokio::test]
    async fn full_frame_with_integer_principal_point_is_corrected() {
        // With cx = 112 the whole centre column of an un-jittered capture
        // shares x = 0, far more points than one KD-tree bucket holds.
        let intrinsics = CameraIntrinsics::default();
        let view = sized_frame(224, 174, 224);
        let agent = Arc::new(SimulatedAgent::powered());
        let lease = agent.acquire().await.unwrap();
        agent.power_on(&lease).await.unwrap();
        let nominal = Pose::at(0.65, 0.0, 0.45);
        agent.set_pose(nominal);
        agent.set_depth_frame(view.clone());
        let master = ArmCorrectionDataset::from_capture(&view, nominal, &intrinsics, 1);
        let corrector = PoseCorrector::new(agent.clone(), agent.clone()).with_intrinsics(intrinsics);

        assert!(corrector.correct(&lease, &master, 0.5).await);
        assert_eq!(moves(&agent).len(), 1);
    }

    #[tokio::test]
    async fn prepared_master_serves_repeated_corrections() {
        let (agent, lease, master) = setup(frame(WIDTH)).await;
        let corrector = corrector(&agent);
        let target = corrector.prepare(&master).await.unwrap();
        assert_eq!(target.cloud().len(), master.cloud.len());

        assert!(corrector.correct_against(&lease, &target, 0.5).await);
        assert!(corrector.correct_against(&lease, &target, 0.5).await);
        assert_eq!(moves(&agent).len(), 2);
    }

    #[tokio::test]
    async fn empty_master_prepares_nothing() {
        let (agent, _, _) = setup(frame(WIDTH)).await;
        let empty = ArmCorrectionDataset {
            cloud: Arc::new(PointCloud::default()),
            ..ArmCorrectionDataset::from_capture(&frame(WIDTH), Pose::default(), &intrinsics(), 1)
        };
        assert!(corrector(&agent).prepare(&empty).await.is_none());
    }
}
