#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Narrow capability interfaces the inspection cell uses to talk to the
//! mobile manipulator and the plant signal bus.
//!
//! The control core never sees a monolithic robot object: each component is
//! handed only the capabilities it needs ([`AuthorityApi`], [`StatusApi`],
//! [`MotionApi`], [`CaptureApi`], [`NavigationApi`], [`SignalBus`]).
//! [`loopback`] provides an in-process simulated agent used by tests and the
//! `cellctl run --simulate` mode.

/// Agent-side value types and capability traits.
pub mod agent;

/// Simulated agent implementing every capability trait.
pub mod loopback;

/// Plant signal bus interface and in-memory implementation.
pub mod signals;

pub use agent::{
    AgentLinks, AgentStatus, Artifact, ArtifactMeta, AuthorityApi, BatteryState, CaptureApi,
    DepthFrame, LeaseToken, LinkError, MotionApi, NavigationApi, Pose, Position, Rotation,
    StatusApi, TimeWindow,
};
pub use loopback::{AgentCall, SimulatedAgent};
pub use signals::{MemorySignalBus, SignalBus, TagValue};
