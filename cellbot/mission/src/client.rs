use async_trait::async_trait;
use cell_links::{LeaseToken, LinkError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    feedback::{ElementProgress, NodeFeedback},
    graph::ActionGraph,
    questions::Question,
};

/// Overall mission state reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    /// Loaded, no play request received yet.
    NotStarted,
    /// Executing.
    Running,
    /// Waiting for a play request or an answer.
    Paused,
    /// Every element finished.
    Succeeded,
    /// The mission gave up.
    Failed,
    /// Stopped by a client.
    Stopped,
    /// Internal error on the agent.
    Error,
}

impl MissionState {
    /// Whether the poll loop should keep going.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::NotStarted | Self::Running | Self::Paused)
    }
}

/// One status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionStatus {
    /// Overall state.
    pub state: MissionState,
    /// Outstanding operator questions.
    #[serde(default)]
    pub questions: Vec<Question>,
    /// Element-wise feedback.
    #[serde(default)]
    pub progress: Vec<ElementProgress>,
}

/// Failure to load a graph onto the agent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MissionLoadError {
    /// The agent rejected the graph.
    #[error("graph failed validation ({detail}); elements {failed_elements:?}, nodes {failed_nodes:?}")]
    Validation {
        /// Indices of the offending elements.
        failed_elements: Vec<usize>,
        /// Offending node ids.
        failed_nodes: Vec<String>,
        /// Compiler message.
        detail: String,
    },
    /// The load request itself failed.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Mission service on the agent.
#[async_trait]
pub trait MissionClient: Send + Sync {
    /// Loads a graph, returning the node-to-element mapping.
    async fn load(
        &self,
        lease: &LeaseToken,
        graph: &ActionGraph,
    ) -> Result<Vec<NodeFeedback>, MissionLoadError>;

    /// Polls mission state, questions and element feedback.
    async fn status(&self) -> Result<MissionStatus, LinkError>;

    /// Lets the mission run until `pause_deadline`.
    async fn play(&self, lease: &LeaseToken, pause_deadline: DateTime<Utc>)
        -> Result<(), LinkError>;

    /// Answers an operator question.
    async fn answer(&self, question_id: u64, code: i64) -> Result<(), LinkError>;
}
