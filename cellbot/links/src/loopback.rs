use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::agent::{
    AgentStatus, Artifact, ArtifactMeta, AuthorityApi, BatteryState, CaptureApi, DepthFrame,
    LeaseToken, LinkError, MotionApi, NavigationApi, Pose, StatusApi, TimeWindow,
};

/// Battery drained by one navigation leg in the simulation, in percent.
const NAVIGATION_DRAIN: f64 = 0.4;
/// Battery gained per status sample while docked and charging, in percent.
const CHARGE_RATE: f64 = 2.0;

/// Journaled call made against the simulated agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    /// Lease acquired.
    Acquire,
    /// Power enabled.
    PowerOn,
    /// Localization requested.
    Localize,
    /// Navigation to a waypoint.
    NavigateTo(String),
    /// Dock command.
    Dock(u32),
    /// Undock command.
    Undock,
    /// End-effector motion.
    MoveEndEffector(Pose),
    /// Depth capture.
    CaptureDepth,
    /// Artifact listing.
    ListArtifacts,
    /// Artifact download.
    Download(String),
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    powered: bool,
    estop: bool,
    localized: bool,
    docked: bool,
    lease: Option<LeaseToken>,
    battery: BatteryState,
    pose: Pose,
    depth: Option<DepthFrame>,
    artifacts: Vec<Artifact>,
    failures: HashMap<&'static str, usize>,
    calls: Vec<AgentCall>,
}

/// In-process stand-in for the mobile manipulator.
///
/// Every capability is backed by one mutex-guarded state block. Transient
/// failures can be injected per operation with [`SimulatedAgent::fail_next`].
#[derive(Debug)]
pub struct SimulatedAgent {
    state: Mutex<SimState>,
}

impl Default for SimulatedAgent {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimState {
                connected: true,
                powered: false,
                estop: false,
                localized: true,
                docked: false,
                lease: None,
                battery: BatteryState {
                    charge_percent: 90.0,
                    ..BatteryState::default()
                },
                pose: Pose::default(),
                depth: None,
                artifacts: Vec::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }
}

impl SimulatedAgent {
    /// Agent already powered and holding no lease.
    #[must_use]
    pub fn powered() -> Self {
        let agent = Self::default();
        agent.state.lock().powered = true;
        agent
    }

    /// Makes the next `count` calls of `operation` fail with a transport error.
    ///
    /// Operation names: `status`, `acquire`, `advance`, `power_on`, `pose`,
    /// `move`, `capture_depth`, `list_artifacts`, `download`, `is_localized`,
    /// `localize`, `navigate`, `dock`, `undock`.
    pub fn fail_next(&self, operation: &'static str, count: usize) {
        self.state.lock().failures.insert(operation, count);
    }

    /// Overrides the battery state.
    pub fn set_battery(&self, charge_percent: f64, charging: bool) {
        let mut state = self.state.lock();
        state.battery.charge_percent = charge_percent;
        state.battery.charging = charging;
    }

    /// Overrides connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Overrides localization.
    pub fn set_localized(&self, localized: bool) {
        self.state.lock().localized = localized;
    }

    /// Latches or clears the emergency stop.
    pub fn set_estop(&self, engaged: bool) {
        self.state.lock().estop = engaged;
    }

    /// Sets the frame returned by `capture_depth`.
    pub fn set_depth_frame(&self, frame: DepthFrame) {
        self.state.lock().depth = Some(frame);
    }

    /// Sets the current end-effector pose.
    pub fn set_pose(&self, pose: Pose) {
        self.state.lock().pose = pose;
    }

    /// Stores a capture stamped now, as an inspection action would.
    pub fn record_capture(&self, channel: &str, bytes: Vec<u8>) -> ArtifactMeta {
        let meta = ArtifactMeta {
            id: format!("cap-{}", Uuid::new_v4()),
            channel: channel.to_string(),
            captured_at: Utc::now(),
        };
        self.state.lock().artifacts.push(Artifact {
            meta: meta.clone(),
            bytes,
        });
        meta
    }

    /// Drops the held lease, as if another client took it.
    pub fn revoke_lease(&self) {
        self.state.lock().lease = None;
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<AgentCall> {
        self.state.lock().calls.clone()
    }

    /// Number of journaled calls matching a predicate.
    pub fn count_calls(&self, predicate: impl Fn(&AgentCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn enter(&self, operation: &'static str, call: Option<AgentCall>) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if let Some(call) = call {
            state.calls.push(call);
        }
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinkError::Transport(format!("injected {operation} failure")));
            }
        }
        Ok(())
    }

    fn check_lease(&self, lease: &LeaseToken) -> Result<(), LinkError> {
        let state = self.state.lock();
        match &state.lease {
            Some(held) if held.epoch == lease.epoch => Ok(()),
            _ => Err(LinkError::NoAuthority),
        }
    }

    fn check_motion(&self, lease: &LeaseToken) -> Result<(), LinkError> {
        self.check_lease(lease)?;
        let state = self.state.lock();
        if !state.powered || state.estop {
            return Err(LinkError::PowerOff);
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorityApi for SimulatedAgent {
    async fn acquire(&self) -> Result<LeaseToken, LinkError> {
        self.enter("acquire", Some(AgentCall::Acquire))?;
        let mut state = self.state.lock();
        let token = match &state.lease {
            Some(held) => held.clone(),
            None => LeaseToken {
                resource: "body".into(),
                epoch: Uuid::new_v4().to_string(),
                sequence: 0,
            },
        };
        state.lease = Some(token.clone());
        Ok(token)
    }

    async fn advance(&self, token: &LeaseToken) -> Result<LeaseToken, LinkError> {
        self.enter("advance", None)?;
        self.check_lease(token)?;
        let mut state = self.state.lock();
        let next = LeaseToken {
            sequence: state.lease.as_ref().map_or(0, |held| held.sequence) + 1,
            ..token.clone()
        };
        state.lease = Some(next.clone());
        Ok(next)
    }

    async fn release(&self, token: &LeaseToken) -> Result<(), LinkError> {
        self.check_lease(token)?;
        self.state.lock().lease = None;
        Ok(())
    }
}

#[async_trait]
impl StatusApi for SimulatedAgent {
    async fn status(&self) -> Result<AgentStatus, LinkError> {
        self.enter("status", None)?;
        let mut state = self.state.lock();
        if state.docked && state.battery.charging {
            state.battery.charge_percent = (state.battery.charge_percent + CHARGE_RATE).min(100.0);
        }
        Ok(AgentStatus {
            connected: state.connected,
            motors_powered: state.powered,
            estop_engaged: state.estop,
            lease_held: state.lease.is_some(),
            docked: state.docked,
            battery: state.battery,
            sampled_at: Utc::now(),
        })
    }

    async fn power_on(&self, lease: &LeaseToken) -> Result<(), LinkError> {
        self.enter("power_on", Some(AgentCall::PowerOn))?;
        self.check_lease(lease)?;
        let mut state = self.state.lock();
        if state.estop {
            return Err(LinkError::Rejected("emergency stop latched".into()));
        }
        state.powered = true;
        Ok(())
    }
}

#[async_trait]
impl MotionApi for SimulatedAgent {
    async fn end_effector_pose(&self) -> Result<Pose, LinkError> {
        self.enter("pose", None)?;
        Ok(self.state.lock().pose)
    }

    async fn move_end_effector(
        &self,
        lease: &LeaseToken,
        pose: &Pose,
        _duration: Duration,
    ) -> Result<(), LinkError> {
        self.enter("move", Some(AgentCall::MoveEndEffector(*pose)))?;
        self.check_motion(lease)?;
        self.state.lock().pose = *pose;
        Ok(())
    }
}

#[async_trait]
impl CaptureApi for SimulatedAgent {
    async fn capture_depth(&self) -> Result<DepthFrame, LinkError> {
        self.enter("capture_depth", Some(AgentCall::CaptureDepth))?;
        self.state
            .lock()
            .depth
            .clone()
            .ok_or_else(|| LinkError::Rejected("depth camera has no frame".into()))
    }

    async fn list_artifacts(&self, window: &TimeWindow) -> Result<Vec<ArtifactMeta>, LinkError> {
        self.enter("list_artifacts", Some(AgentCall::ListArtifacts))?;
        Ok(self
            .state
            .lock()
            .artifacts
            .iter()
            .filter(|artifact| window.contains(artifact.meta.captured_at))
            .map(|artifact| artifact.meta.clone())
            .collect())
    }

    async fn download_artifact(&self, meta: &ArtifactMeta) -> Result<Artifact, LinkError> {
        self.enter("download", Some(AgentCall::Download(meta.id.clone())))?;
        self.state
            .lock()
            .artifacts
            .iter()
            .find(|artifact| artifact.meta.id == meta.id)
            .cloned()
            .ok_or_else(|| LinkError::Rejected(format!("unknown artifact {}", meta.id)))
    }
}

#[async_trait]
impl NavigationApi for SimulatedAgent {
    async fn is_localized(&self) -> Result<bool, LinkError> {
        self.enter("is_localized", None)?;
        Ok(self.state.lock().localized)
    }

    async fn localize(&self, lease: &LeaseToken) -> Result<(), LinkError> {
        self.enter("localize", Some(AgentCall::Localize))?;
        self.check_lease(lease)?;
        self.state.lock().localized = true;
        Ok(())
    }

    async fn navigate_to(
        &self,
        lease: &LeaseToken,
        waypoint: &str,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        self.enter("navigate", Some(AgentCall::NavigateTo(waypoint.to_string())))?;
        self.check_motion(lease)?;
        let mut state = self.state.lock();
        if !state.localized {
            return Err(LinkError::NotLocalized);
        }
        state.docked = false;
        state.battery.charging = false;
        state.battery.charge_percent = (state.battery.charge_percent - NAVIGATION_DRAIN).max(0.0);
        Ok(())
    }

    async fn dock(&self, lease: &LeaseToken, dock_id: u32) -> Result<(), LinkError> {
        self.enter("dock", Some(AgentCall::Dock(dock_id)))?;
        self.check_motion(lease)?;
        let mut state = self.state.lock();
        state.docked = true;
        state.battery.charging = true;
        Ok(())
    }

    async fn undock(&self, lease: &LeaseToken) -> Result<(), LinkError> {
        self.enter("undock", Some(AgentCall::Undock))?;
        self.check_motion(lease)?;
        let mut state = self.state.lock();
        state.docked = false;
        state.battery.charging = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn motion_requires_lease_and_power() {
        let agent = SimulatedAgent::default();
        let lease = agent.acquire().await.unwrap();
        let err = agent
            .move_end_effector(&lease, &Pose::at(0.5, 0.0, 0.3), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::PowerOff);
        agent.power_on(&lease).await.unwrap();
        agent
            .move_end_effector(&lease, &Pose::at(0.5, 0.0, 0.3), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(agent.end_effector_pose().await.unwrap(), Pose::at(0.5, 0.0, 0.3));
    }

    #[tokio::test]
    async fn advance_increments_sequence() {
        let agent = SimulatedAgent::powered();
        let lease = agent.acquire().await.unwrap();
        let next = agent.advance(&lease).await.unwrap();
        assert_eq!(next.sequence, lease.sequence + 1);
        agent.revoke_lease();
        assert_eq!(agent.advance(&next).await.unwrap_err(), LinkError::NoAuthority);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let agent = SimulatedAgent::powered();
        agent.fail_next("status", 2);
        assert!(agent.status().await.is_err());
        assert!(agent.status().await.is_err());
        assert!(agent.status().await.is_ok());
    }

    #[tokio::test]
    async fn docking_charges_battery() {
        let agent = SimulatedAgent::powered();
        let lease = agent.acquire().await.unwrap();
        agent.set_battery(15.0, false);
        agent.dock(&lease, 520).await.unwrap();
        let status = agent.status().await.unwrap();
        assert!(status.docked);
        assert!(status.battery.charging);
        assert!(status.battery.charge_percent > 15.0);
    }
}
