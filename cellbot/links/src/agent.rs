use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by any collaborator call.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    /// Network or RPC hiccup; worth retrying.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The remote end is not connected.
    #[error("not connected")]
    NotConnected,
    /// Control authority is not held.
    #[error("control authority not held")]
    NoAuthority,
    /// Actuation power is off.
    #[error("actuation power is off")]
    PowerOff,
    /// The agent is not localized on its current map.
    #[error("agent is not localized")]
    NotLocalized,
    /// The remote end refused the command.
    #[error("command rejected: {0}")]
    Rejected(String),
    /// The command did not finish before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl LinkError {
    /// Whether retrying the same call without fixing a precondition can help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Exclusive control token. Renewed (advanced) before each request that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Resource the lease covers (usually `body`).
    pub resource: String,
    /// Epoch assigned when the lease was first acquired.
    pub epoch: String,
    /// Monotonic sequence, incremented by every advance.
    pub sequence: u64,
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.resource, self.epoch, self.sequence)
    }
}

/// Cartesian position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

/// Unit quaternion, scalar first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    /// Scalar part.
    pub w: f64,
    /// X component.
    pub x: f64,
    /// Y component.
    pub y: f64,
    /// Z component.
    pub z: f64,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

/// Position plus orientation of the end effector in the agent body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Pose {
    /// Translation component.
    pub position: Position,
    /// Orientation component.
    pub rotation: Rotation,
}

impl Pose {
    /// Pose with identity rotation at the given position.
    #[must_use]
    pub const fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Position { x, y, z },
            rotation: Rotation {
                w: 1.0,
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        }
    }
}

/// Battery telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge in percent (0-100).
    pub charge_percent: f64,
    /// Whether the agent is currently charging.
    pub charging: bool,
    /// Lowest cell temperature in degrees Celsius.
    pub min_temp_c: f64,
    /// Highest cell temperature in degrees Celsius.
    pub max_temp_c: f64,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            charge_percent: 100.0,
            charging: false,
            min_temp_c: 25.0,
            max_temp_c: 25.0,
        }
    }
}

/// Snapshot of agent health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Transport-level connectivity.
    pub connected: bool,
    /// Actuation power enabled.
    pub motors_powered: bool,
    /// Emergency stop latched.
    pub estop_engaged: bool,
    /// Whether this client holds the control lease.
    pub lease_held: bool,
    /// Whether the agent sits on its dock.
    pub docked: bool,
    /// Battery telemetry.
    pub battery: BatteryState,
    /// Sample time.
    pub sampled_at: DateTime<Utc>,
}

impl AgentStatus {
    /// Connected, powered, not e-stopped and holding authority.
    #[must_use]
    pub const fn is_operable(&self) -> bool {
        self.connected && self.motors_powered && !self.estop_engaged && self.lease_held
    }
}

/// Raw depth frame in meters, row-major. Zero or NaN marks an invalid pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthFrame {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Per-pixel depth, `depths[y * width + x]`.
    pub depths: Vec<f32>,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

impl DepthFrame {
    /// Depth at a pixel, `None` if out of bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.depths.get((y * self.width + x) as usize).copied()
    }

    /// Whether the buffer length matches the declared dimensions.
    #[must_use]
    pub fn has_valid_buffer_size(&self) -> bool {
        self.depths.len() == (self.width * self.height) as usize
    }
}

/// Half-open capture time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `at` falls inside the window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Metadata for a capture stored on the agent's data back-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Back-end identifier.
    pub id: String,
    /// Capture channel (camera / sensor name).
    pub channel: String,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

/// Downloaded capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Metadata.
    pub meta: ArtifactMeta,
    /// Encoded payload.
    pub bytes: Vec<u8>,
}

/// Control authority (lease) management.
#[async_trait]
pub trait AuthorityApi: Send + Sync {
    /// Acquires (or takes) the exclusive lease.
    async fn acquire(&self) -> Result<LeaseToken, LinkError>;
    /// Advances a held lease; the returned token must be used for the next request.
    async fn advance(&self, token: &LeaseToken) -> Result<LeaseToken, LinkError>;
    /// Returns the lease to the agent.
    async fn release(&self, token: &LeaseToken) -> Result<(), LinkError>;
}

/// Read-only health telemetry plus power control.
#[async_trait]
pub trait StatusApi: Send + Sync {
    /// Samples current status.
    async fn status(&self) -> Result<AgentStatus, LinkError>;
    /// Enables actuation power.
    async fn power_on(&self, lease: &LeaseToken) -> Result<(), LinkError>;
}

/// Arm motion.
#[async_trait]
pub trait MotionApi: Send + Sync {
    /// Current end-effector pose in the body frame.
    async fn end_effector_pose(&self) -> Result<Pose, LinkError>;
    /// Moves the end effector to `pose` within `duration`.
    async fn move_end_effector(
        &self,
        lease: &LeaseToken,
        pose: &Pose,
        duration: Duration,
    ) -> Result<(), LinkError>;
}

/// Sensor capture and capture back-end access.
#[async_trait]
pub trait CaptureApi: Send + Sync {
    /// Grabs a depth frame from the hand depth camera.
    async fn capture_depth(&self) -> Result<DepthFrame, LinkError>;
    /// Lists captures stored within a time window.
    async fn list_artifacts(&self, window: &TimeWindow) -> Result<Vec<ArtifactMeta>, LinkError>;
    /// Downloads one capture.
    async fn download_artifact(&self, meta: &ArtifactMeta) -> Result<Artifact, LinkError>;
}

/// Localization, waypoint navigation, docking.
#[async_trait]
pub trait NavigationApi: Send + Sync {
    /// Whether the agent is localized on its current map.
    async fn is_localized(&self) -> Result<bool, LinkError>;
    /// Attempts to localize against the nearest fiducial.
    async fn localize(&self, lease: &LeaseToken) -> Result<(), LinkError>;
    /// Navigates to a recorded waypoint.
    async fn navigate_to(
        &self,
        lease: &LeaseToken,
        waypoint: &str,
        timeout: Duration,
    ) -> Result<(), LinkError>;
    /// Docks on the given dock.
    async fn dock(&self, lease: &LeaseToken, dock_id: u32) -> Result<(), LinkError>;
    /// Leaves the dock.
    async fn undock(&self, lease: &LeaseToken) -> Result<(), LinkError>;
}

/// Bundle of capability handles composed by the orchestrator.
#[derive(Clone)]
pub struct AgentLinks {
    /// Lease management.
    pub authority: Arc<dyn AuthorityApi>,
    /// Health telemetry.
    pub status: Arc<dyn StatusApi>,
    /// Arm motion.
    pub motion: Arc<dyn MotionApi>,
    /// Sensor capture.
    pub capture: Arc<dyn CaptureApi>,
    /// Navigation.
    pub navigation: Arc<dyn NavigationApi>,
}

impl AgentLinks {
    /// Builds a bundle from one object implementing every capability.
    pub fn from_agent<A>(agent: Arc<A>) -> Self
    where
        A: AuthorityApi + StatusApi + MotionApi + CaptureApi + NavigationApi + 'static,
    {
        Self {
            authority: agent.clone(),
            status: agent.clone(),
            motion: agent.clone(),
            capture: agent.clone(),
            navigation: agent,
        }
    }
}

impl fmt::Debug for AgentLinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLinks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operable_requires_every_condition() {
        let mut status = AgentStatus {
            connected: true,
            motors_powered: true,
            estop_engaged: false,
            lease_held: true,
            docked: false,
            battery: BatteryState::default(),
            sampled_at: Utc::now(),
        };
        assert!(status.is_operable());
        status.lease_held = false;
        assert!(!status.is_operable());
        status.lease_held = true;
        status.estop_engaged = true;
        assert!(!status.is_operable());
    }

    #[test]
    fn window_is_half_open() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(5);
        let window = TimeWindow::new(start, end);
        assert!(window.contains(start));
        assert!(!window.contains(end));
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(LinkError::Transport("reset".into()).is_transient());
        assert!(!LinkError::NoAuthority.is_transient());
        assert!(!LinkError::NotLocalized.is_transient());
    }
}
