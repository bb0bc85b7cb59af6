#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Mission execution engine.
//!
//! A mission is an ordered [`ActionGraph`] loaded onto the agent and played
//! under a renewed lease while the engine polls element feedback, answers
//! operator questions with a fixed policy, and retrieves the captures each
//! completed element produced. Remote calls go through [`with_retry`].

/// Capture retrieval workers and sinks.
pub mod artifacts;
/// Mission service interface.
pub mod client;
/// The engine.
pub mod engine;
/// Element feedback tracking.
pub mod feedback;
/// Action graph model and loader.
pub mod graph;
/// Scripted mission service for tests and simulation.
pub mod loopback;
/// Operator question policy.
pub mod questions;
/// Bounded retry wrapper.
pub mod retry;
/// Structured logging and events.
pub mod telemetry;

pub use artifacts::{
    ArtifactError, ArtifactExpectation, ArtifactRetriever, CaptureSink, DirectoryCaptureSink,
    MemoryCaptureSink, RetrievalRequest, RetrievalSummary,
};
pub use client::{MissionClient, MissionLoadError, MissionState, MissionStatus};
pub use engine::{
    CaptureHook, CorrectionRecord, ExecutionOptions, MissionEngine, MissionEngineBuilder,
    MissionFailure, MissionReport,
};
pub use feedback::{ElementProgress, ElementState, FeedbackEvent, FeedbackTracker, NodeFeedback};
pub use graph::{
    ActionDescriptor, ActionGraph, CameraOverride, Escalation, FailureBehavior, GraphError,
    MissionElement, NavigationTarget,
};
pub use loopback::{ScriptedMissionClient, StatusFrame};
pub use questions::{AnswerOption, Question, QuestionDecision, QuestionPolicy};
pub use retry::{with_retry, with_retry_when, CancelFlag, RetryError, RetryPolicy};
pub use telemetry::{MissionTelemetry, MissionTelemetryBuilder};
