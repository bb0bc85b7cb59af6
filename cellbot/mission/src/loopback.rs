use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use cell_links::{LeaseToken, LinkError, SimulatedAgent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    client::{MissionClient, MissionLoadError, MissionState, MissionStatus},
    feedback::{ElementProgress, ElementState, NodeFeedback},
    graph::ActionGraph,
    questions::Question,
};

/// One scripted status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    /// Mission state.
    pub state: MissionState,
    /// Element feedback.
    pub progress: Vec<ElementProgress>,
    /// Outstanding questions.
    pub questions: Vec<Question>,
    /// Capture channels recorded on the agent when the frame is served.
    pub captures: Vec<String>,
}

impl StatusFrame {
    /// Frame with a state and nothing else.
    #[must_use]
    pub const fn new(state: MissionState) -> Self {
        Self {
            state,
            progress: Vec::new(),
            questions: Vec::new(),
            captures: Vec::new(),
        }
    }

    /// Adds an element state by graph index.
    #[must_use]
    pub fn element(mut self, index: usize, state: ElementState) -> Self {
        self.progress
            .push(ElementProgress::new(ScriptedMissionClient::node_id(index), state));
        self
    }

    /// Adds a question.
    #[must_use]
    pub fn question(mut self, question: Question) -> Self {
        self.questions.push(question);
        self
    }

    /// Records a capture on this channel when served.
    #[must_use]
    pub fn capture(mut self, channel: &str) -> Self {
        self.captures.push(channel.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    frames: VecDeque<StatusFrame>,
    last: Option<StatusFrame>,
    auto_walk: bool,
    load_error: Option<MissionLoadError>,
    status_failures: usize,
    play_failures: usize,
    played: bool,
    loads: usize,
    status_calls: usize,
    plays: Vec<(LeaseToken, DateTime<Utc>)>,
    answers: Vec<(u64, i64)>,
    answered_ids: Vec<u64>,
    sticky_questions: bool,
}

/// Mission service stand-in that replays scripted status frames.
///
/// Before the first play request every poll reports `NotStarted`. After it,
/// each poll consumes the next frame and the last one repeats. Answered
/// questions are removed from later frames.
#[derive(Debug, Default)]
pub struct ScriptedMissionClient {
    agent: Option<Arc<SimulatedAgent>>,
    state: Mutex<ScriptState>,
}

impl ScriptedMissionClient {
    /// Client replaying `frames`.
    #[must_use]
    pub fn new(frames: Vec<StatusFrame>) -> Self {
        Self {
            agent: None,
            state: Mutex::new(ScriptState {
                frames: frames.into(),
                ..ScriptState::default()
            }),
        }
    }

    /// Client that walks every loaded graph to success, one element per poll,
    /// recording one capture per action element.
    #[must_use]
    pub fn walking(agent: Arc<SimulatedAgent>) -> Self {
        Self {
            agent: Some(agent),
            state: Mutex::new(ScriptState {
                auto_walk: true,
                ..ScriptState::default()
            }),
        }
    }

    /// Records scripted captures on `agent`.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<SimulatedAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Node id assigned to the element at `index`.
    #[must_use]
    pub fn node_id(index: usize) -> String {
        format!("node-{index}")
    }

    /// Makes every subsequent load fail.
    pub fn fail_load(&self, error: MissionLoadError) {
        self.state.lock().load_error = Some(error);
    }

    /// Fails the next `count` status polls with a transport error.
    pub fn fail_status(&self, count: usize) {
        self.state.lock().status_failures = count;
    }

    /// Fails the next `count` play requests with a transport error.
    pub fn fail_play(&self, count: usize) {
        self.state.lock().play_failures = count;
    }

    /// Keeps answered questions in later frames, as a stuck mission would.
    pub fn keep_answered_questions(&self) {
        self.state.lock().sticky_questions = true;
    }

    /// Play requests received.
    #[must_use]
    pub fn plays(&self) -> Vec<(LeaseToken, DateTime<Utc>)> {
        self.state.lock().plays.clone()
    }

    /// Answers received.
    #[must_use]
    pub fn answers(&self) -> Vec<(u64, i64)> {
        self.state.lock().answers.clone()
    }

    /// Load requests received.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.state.lock().loads
    }

    /// Status polls received, failed ones included.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }

    fn walk(graph: &ActionGraph) -> Vec<StatusFrame> {
        let mut frames = Vec::new();
        let count = graph.elements.len();
        for (index, element) in graph.elements.iter().enumerate() {
            let done = |frame: StatusFrame| {
                (0..index).fold(frame, |frame, i| frame.element(i, ElementState::Completed))
            };
            frames.push(done(StatusFrame::new(MissionState::Running)).element(index, ElementState::Running));
            let mut completed =
                done(StatusFrame::new(MissionState::Running)).element(index, ElementState::Completed);
            if let Some(channel) = element.action.as_ref().and_then(|a| a.channel.as_deref()) {
                completed = completed.capture(channel);
            }
            frames.push(completed);
        }
        frames.push((0..count).fold(StatusFrame::new(MissionState::Succeeded), |frame, i| {
            frame.element(i, ElementState::Completed)
        }));
        frames
    }
}

#[async_trait]
impl MissionClient for ScriptedMissionClient {
    async fn load(
        &self,
        _lease: &LeaseToken,
        graph: &ActionGraph,
    ) -> Result<Vec<NodeFeedback>, MissionLoadError> {
        let mut state = self.state.lock();
        state.loads += 1;
        if let Some(err) = state.load_error.clone() {
            return Err(err);
        }
        state.played = false;
        state.answered_ids.clear();
        if state.auto_walk {
            state.frames = Self::walk(graph).into();
            state.last = None;
        }
        Ok(graph
            .elements
            .iter()
            .enumerate()
            .map(|(index, element)| NodeFeedback {
                node_id: Self::node_id(index),
                element_id: element.id.clone(),
                element_name: element.name.clone(),
            })
            .collect())
    }

    async fn status(&self) -> Result<MissionStatus, LinkError> {
        let (frame, captures) = {
            let mut state = self.state.lock();
            state.status_calls += 1;
            if state.status_failures > 0 {
                state.status_failures -= 1;
                return Err(LinkError::Transport("status poll dropped".into()));
            }
            if !state.played {
                return Ok(MissionStatus {
                    state: MissionState::NotStarted,
                    questions: Vec::new(),
                    progress: Vec::new(),
                });
            }
            let (frame, fresh) = match state.frames.pop_front() {
                Some(frame) => (frame, true),
                None => (
                    state
                        .last
                        .clone()
                        .unwrap_or_else(|| StatusFrame::new(MissionState::Succeeded)),
                    false,
                ),
            };
            state.last = Some(frame.clone());
            let mut frame = frame;
            if !state.sticky_questions {
                frame
                    .questions
                    .retain(|question| !state.answered_ids.contains(&question.id));
            }
            let captures = if fresh { frame.captures.clone() } else { Vec::new() };
            (frame, captures)
        };
        if let Some(agent) = &self.agent {
            for channel in &captures {
                agent.record_capture(channel, channel.as_bytes().to_vec());
            }
        }
        Ok(MissionStatus {
            state: frame.state,
            questions: frame.questions,
            progress: frame.progress,
        })
    }

    async fn play(&self, lease: &LeaseToken, pause_deadline: DateTime<Utc>) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.play_failures > 0 {
            state.play_failures -= 1;
            return Err(LinkError::Transport("play request dropped".into()));
        }
        state.played = true;
        state.plays.push((lease.clone(), pause_deadline));
        Ok(())
    }

    async fn answer(&self, question_id: u64, code: i64) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.answers.push((question_id, code));
        state.answered_ids.push(question_id);
        Ok(())
    }
}
