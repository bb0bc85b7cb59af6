#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Inspection cycle orchestrator.
//!
//! A single task owns the [`Orchestrator`] and ticks it at a fixed cadence.
//! Each tick checks the signal bus, agent authority and power, and the
//! battery before moving the station cursor at most one step. Stations run
//! through a [`StationRunner`], usually the mission engine. Bypass lets the
//! conveyance through without inspection, either on operator request or
//! while the agent charges.
//!
//! Operators steer the loop with an [`OrchestratorHandle`]; a
//! [`StatusMonitor`] samples health on its own task without touching cycle
//! state.

/// Operator commands, bypass flags and the owned context.
pub mod context;
/// CSV cycle log and run summary.
pub mod cycle_log;
/// Authority gate and battery scheduler.
pub mod gate;
/// Status sampling task.
pub mod monitor;
/// The control loop.
pub mod orchestrator;
/// Cycle data model.
pub mod state;
/// Station execution.
pub mod station;
/// Structured logging and events.
pub mod telemetry;

pub use context::{
    BypassSource, BypassState, ContextSnapshot, OrchestratorCommand, OrchestratorContext,
    OrchestratorHandle,
};
pub use cycle_log::{
    CycleLog, CycleLogError, CycleRecord, Stats, SummaryRecord, CYCLE_HEADER, SUMMARY_HEADER,
};
pub use gate::{BatteryScheduler, ResourceGate};
pub use monitor::{CellStatus, StatusMonitor};
pub use orchestrator::{IdleReason, Orchestrator, OrchestratorBuilder, TickOutcome};
pub use state::{BatterySample, InspectionCycle, StationResult, WorkState};
pub use station::{MissionStationRunner, PoseCorrectionHook, StationRunner};
pub use telemetry::{OrchestratorTelemetry, OrchestratorTelemetryBuilder};
