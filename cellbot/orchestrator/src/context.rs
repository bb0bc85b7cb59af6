use cell_mission::CancelFlag;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::state::{InspectionCycle, WorkState};

/// Who asked for bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassSource {
    /// Operator toggle.
    Manual,
    /// Battery scheduler.
    Automatic,
}

/// Bypass flags. Manual and automatic bypass are tracked separately and
/// share one externally visible signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BypassState {
    /// Operator bypass.
    pub manual: bool,
    /// Battery-driven bypass.
    pub automatic: bool,
}

impl BypassState {
    /// Whether either flag is set.
    #[must_use]
    pub const fn is_active(self) -> bool {
        self.manual || self.automatic
    }

    /// Sets the flag owned by `source`.
    pub fn set(&mut self, on: bool, source: BypassSource) {
        match source {
            BypassSource::Manual => self.manual = on,
            BypassSource::Automatic => self.automatic = on,
        }
    }
}

/// Mutable state owned by the orchestrator task. Nothing else writes it;
/// readers get [`ContextSnapshot`]s through an [`OrchestratorHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorContext {
    /// Automatic cycling enabled. Off means manual or maintenance mode.
    pub automatic: bool,
    /// Station cursor.
    pub state: WorkState,
    /// Bypass flags.
    pub bypass: BypassState,
    /// Cycle in progress.
    pub cycle: Option<InspectionCycle>,
    /// Operator confirmed a held completion.
    pub confirmed: bool,
    /// Cycles started so far.
    pub cycles_started: u64,
    /// Docked minutes not yet attributed to a cycle.
    pub pending_dock_wait_min: f64,
}

impl Default for OrchestratorContext {
    fn default() -> Self {
        Self {
            automatic: true,
            state: WorkState::Home,
            bypass: BypassState::default(),
            cycle: None,
            confirmed: false,
            cycles_started: 0,
            pending_dock_wait_min: 0.0,
        }
    }
}

impl OrchestratorContext {
    /// Read-only view for other tasks.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            automatic: self.automatic,
            state: self.state,
            bypass: self.bypass,
            cycle_sequence: self.cycle.as_ref().map(|c| c.sequence),
            completion_reported: self.cycle.as_ref().is_some_and(|c| c.completion_reported),
            cycles_started: self.cycles_started,
        }
    }
}

/// Copy of the context published after every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ContextSnapshot {
    /// Automatic cycling enabled.
    pub automatic: bool,
    /// Station cursor.
    pub state: WorkState,
    /// Bypass flags.
    pub bypass: BypassState,
    /// Sequence of the cycle in progress.
    pub cycle_sequence: Option<u64>,
    /// Completion already reported for the cycle in progress.
    pub completion_reported: bool,
    /// Cycles started so far.
    pub cycles_started: u64,
}

/// Operator requests, applied at the top of the next tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    /// Enables or disables automatic cycling.
    SetAutomatic(bool),
    /// Engages or clears manual bypass.
    SetManualBypass(bool),
    /// Releases a completion held for confirmation.
    ConfirmCompletion,
    /// Forces the station cursor.
    OverrideState(WorkState),
    /// Stops the loop.
    Shutdown,
}

/// Cloneable control surface for a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<OrchestratorCommand>,
    snapshots: watch::Receiver<ContextSnapshot>,
    cancel: CancelFlag,
}

impl OrchestratorHandle {
    pub(crate) const fn new(
        commands: mpsc::UnboundedSender<OrchestratorCommand>,
        snapshots: watch::Receiver<ContextSnapshot>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            commands,
            snapshots,
            cancel,
        }
    }

    /// Queues a command. Returns `false` once the orchestrator is gone.
    pub fn send(&self, command: OrchestratorCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Enables or disables automatic cycling.
    pub fn set_automatic(&self, on: bool) -> bool {
        self.send(OrchestratorCommand::SetAutomatic(on))
    }

    /// Engages or clears manual bypass.
    pub fn set_manual_bypass(&self, on: bool) -> bool {
        self.send(OrchestratorCommand::SetManualBypass(on))
    }

    /// Releases a held completion.
    pub fn confirm_completion(&self) -> bool {
        self.send(OrchestratorCommand::ConfirmCompletion)
    }

    /// Forces the station cursor.
    pub fn override_state(&self, state: WorkState) -> bool {
        self.send(OrchestratorCommand::OverrideState(state))
    }

    /// Stops the loop and cancels an in-flight mission at its next check.
    pub fn shutdown(&self) -> bool {
        self.cancel.cancel();
        self.send(OrchestratorCommand::Shutdown)
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        *self.snapshots.borrow()
    }

    /// Waits until the next snapshot is published.
    pub async fn changed(&mut self) -> bool {
        self.snapshots.changed().await.is_ok()
    }
}
