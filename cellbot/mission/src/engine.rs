use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cell_config::MissionSettings;
use cell_links::{AgentLinks, LeaseToken, LinkError, TimeWindow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::{
    artifacts::{
        ArtifactExpectation, ArtifactRetriever, CaptureSink, RetrievalRequest, RetrievalSummary,
    },
    client::{MissionClient, MissionLoadError, MissionState, MissionStatus},
    feedback::{FeedbackEvent, FeedbackTracker},
    graph::{ActionGraph, MissionElement},
    questions::{QuestionDecision, QuestionLedger, QuestionPolicy},
    retry::{with_retry_when, CancelFlag, RetryError, RetryPolicy},
    telemetry::MissionTelemetry,
};

/// Callback run when an element that needs a pose correction starts.
#[async_trait]
pub trait CaptureHook: Send + Sync {
    /// Runs before the element captures. Returns whether a correction was
    /// applied; never fails the mission.
    async fn before_capture(&self, element: &MissionElement, lease: &LeaseToken) -> bool;
}

/// Why a mission call did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MissionFailure {
    /// Control authority could not be obtained or renewed.
    #[error("control authority unavailable: {0}")]
    Authority(RetryError<LinkError>),
    /// The agent stayed unlocalized after one localization attempt.
    #[error("agent is not localized")]
    NotLocalized,
    /// Localization state could not be read.
    #[error("localization check failed: {0}")]
    Localization(RetryError<LinkError>),
    /// The graph was rejected at load time.
    #[error("mission load failed: {0}")]
    Load(MissionLoadError),
    /// Status polling gave up.
    #[error("status poll failed: {0}")]
    Status(RetryError<LinkError>),
    /// A play request gave up.
    #[error("play request failed: {0}")]
    Play(RetryError<LinkError>),
    /// Answer delivery gave up.
    #[error("answering question {id} failed: {source}")]
    Answer {
        /// Question id.
        id: u64,
        /// Retry outcome.
        source: RetryError<LinkError>,
    },
    /// A question offered no option.
    #[error("question {0} has no answer options")]
    Unanswerable(u64),
    /// A question was still outstanding on the poll after it was answered.
    #[error("question {0} persisted after answering")]
    QuestionPersisted(u64),
    /// The absolute deadline passed.
    #[error("mission deadline exceeded")]
    TimedOut,
    /// The cancel flag was raised.
    #[error("mission cancelled")]
    Cancelled,
    /// The mission ended in a state other than succeeded.
    #[error("mission finished as {0:?}")]
    Finished(MissionState),
}

/// Pose correction attempted for one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionRecord {
    /// Element id.
    pub element_id: String,
    /// Whether a corrected pose was commanded.
    pub applied: bool,
}

/// Outcome of one mission call.
#[derive(Debug)]
pub struct MissionReport {
    /// Final state was `Succeeded` and nothing failed on the way.
    pub success: bool,
    /// Wall time of the call in seconds.
    pub elapsed_s: f64,
    /// Last state polled.
    pub final_state: Option<MissionState>,
    /// First terminal failure.
    pub failure: Option<MissionFailure>,
    /// Capture retrieval results, all joined.
    pub retrievals: RetrievalSummary,
    /// Pose corrections attempted.
    pub corrections: Vec<CorrectionRecord>,
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Relative deadline, turned absolute at call start.
    pub timeout: Duration,
    /// Answer keyword replacing the engine default for this call.
    pub answer_keyword: Option<String>,
}

impl ExecutionOptions {
    /// Options with a timeout and the default answer keyword.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            answer_keyword: None,
        }
    }
}

/// Builder for [`MissionEngine`].
pub struct MissionEngineBuilder {
    links: AgentLinks,
    client: Arc<dyn MissionClient>,
    retry: RetryPolicy,
    questions: QuestionPolicy,
    play_interval: Duration,
    poll_interval: Duration,
    localize_timeout: Duration,
    artifact_workers: usize,
    hook: Option<Arc<dyn CaptureHook>>,
    telemetry: Option<MissionTelemetry>,
    cancel: CancelFlag,
}

impl MissionEngineBuilder {
    /// Applies numeric tuning from configuration.
    #[must_use]
    pub fn settings(mut self, settings: &MissionSettings) -> Self {
        self.retry = RetryPolicy::from(settings);
        self.play_interval = Duration::from_secs(settings.play_interval_s.max(1));
        self.poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1));
        self.artifact_workers = settings.artifact_workers.max(1);
        self
    }

    /// Sets the retry policy for remote calls.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the operator question policy.
    #[must_use]
    pub fn questions(mut self, questions: QuestionPolicy) -> Self {
        self.questions = questions;
        self
    }

    /// Sets the play cadence.
    #[must_use]
    pub const fn play_interval(mut self, interval: Duration) -> Self {
        self.play_interval = interval;
        self
    }

    /// Sets the status poll period.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Attaches the pose correction hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn CaptureHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: MissionTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Shares a cancel flag with the caller.
    #[must_use]
    pub fn cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> MissionEngine {
        MissionEngine {
            retry: self.retry.with_cancel(self.cancel.clone()),
            links: self.links,
            client: self.client,
            questions: self.questions,
            play_interval: self.play_interval,
            poll_interval: self.poll_interval,
            localize_timeout: self.localize_timeout,
            artifact_workers: self.artifact_workers,
            hook: self.hook,
            telemetry: self.telemetry,
            cancel: self.cancel,
        }
    }
}

/// Loads action graphs onto the agent and drives them to completion.
pub struct MissionEngine {
    links: AgentLinks,
    client: Arc<dyn MissionClient>,
    retry: RetryPolicy,
    questions: QuestionPolicy,
    play_interval: Duration,
    poll_interval: Duration,
    localize_timeout: Duration,
    artifact_workers: usize,
    hook: Option<Arc<dyn CaptureHook>>,
    telemetry: Option<MissionTelemetry>,
    cancel: CancelFlag,
}

impl std::fmt::Debug for MissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionEngine")
            .field("retry", &self.retry)
            .field("play_interval", &self.play_interval)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

struct RunState {
    lease: LeaseToken,
    tracker: FeedbackTracker,
    ledger: QuestionLedger,
    window_start: DateTime<Utc>,
    last_play: Option<Instant>,
    final_state: Option<MissionState>,
    corrections: Vec<CorrectionRecord>,
}

impl MissionEngine {
    /// Starts a builder.
    #[must_use]
    pub fn builder(links: AgentLinks, client: Arc<dyn MissionClient>) -> MissionEngineBuilder {
        MissionEngineBuilder {
            links,
            client,
            retry: RetryPolicy::default(),
            questions: QuestionPolicy::default(),
            play_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            localize_timeout: Duration::from_secs(30),
            artifact_workers: 4,
            hook: None,
            telemetry: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Flag that stops the current and future calls.
    #[must_use]
    pub const fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Runs `graph` with the default answer keyword.
    pub async fn execute(
        &self,
        graph: &ActionGraph,
        timeout: Duration,
        sink: Arc<dyn CaptureSink>,
    ) -> MissionReport {
        self.execute_with(graph, &ExecutionOptions::with_timeout(timeout), sink)
            .await
    }

    /// Runs `graph` to completion, failure or deadline.
    ///
    /// Every capture retrieval spawned during the call is joined before the
    /// report is returned.
    #[instrument(skip_all, fields(mission = %graph.name, elements = graph.elements.len()))]
    pub async fn execute_with(
        &self,
        graph: &ActionGraph,
        options: &ExecutionOptions,
        sink: Arc<dyn CaptureSink>,
    ) -> MissionReport {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let questions = options
            .answer_keyword
            .as_deref()
            .map_or_else(|| self.questions.clone(), |k| self.questions.with_keyword(k));
        self.log(
            LogLevel::Info,
            "mission.started",
            json!({ "mission": graph.name, "elements": graph.elements.len() }),
        );

        let mut run = match self.prepare(graph).await {
            Ok(run) => run,
            Err(failure) => {
                return self.finish(
                    started,
                    None,
                    Some(failure),
                    RetrievalSummary::default(),
                    Vec::new(),
                )
            }
        };

        let mut retriever = ArtifactRetriever::new(
            Arc::clone(&self.links.capture),
            sink,
            self.retry.clone(),
            self.artifact_workers,
        );
        let failure = self
            .poll_loop(graph, &questions, deadline, &mut run, &mut retriever)
            .await;

        // An unfinished last element still gets its window searched, unless
        // it never produces artifacts.
        if !run.tracker.last_completed() {
            if let Some(last) = graph.elements.last().filter(|e| e.action.is_some()) {
                let now = Utc::now();
                retriever.spawn(RetrievalRequest {
                    element_id: last.id.clone(),
                    channel: last.action.as_ref().and_then(|a| a.channel.clone()),
                    window: TimeWindow::new(run.window_start, now),
                    expectation: ArtifactExpectation::Any,
                });
            }
        }
        let retrievals = retriever.join_all().await;
        self.finish(started, run.final_state, failure, retrievals, run.corrections)
    }

    async fn prepare(&self, graph: &ActionGraph) -> Result<RunState, MissionFailure> {
        let mut lease = self.acquire().await?;
        self.ensure_localized(&mut lease).await?;
        let window_start = Utc::now();
        let nodes = match self.client.load(&lease, graph).await {
            Ok(nodes) => nodes,
            Err(err) => {
                let metadata = match &err {
                    MissionLoadError::Validation {
                        failed_elements,
                        failed_nodes,
                        detail,
                    } => json!({
                        "failed_elements": failed_elements,
                        "failed_nodes": failed_nodes,
                        "detail": detail,
                    }),
                    MissionLoadError::Link(link) => json!({ "error": link.to_string() }),
                };
                warn!(error = %err, "mission load failed");
                self.log(LogLevel::Error, "mission.load.failed", metadata);
                return Err(MissionFailure::Load(err));
            }
        };
        Ok(RunState {
            lease,
            tracker: FeedbackTracker::new(nodes),
            ledger: QuestionLedger::default(),
            window_start,
            last_play: None,
            final_state: None,
            corrections: Vec::new(),
        })
    }

    async fn poll_loop(
        &self,
        graph: &ActionGraph,
        questions: &QuestionPolicy,
        deadline: Instant,
        run: &mut RunState,
        retriever: &mut ArtifactRetriever,
    ) -> Option<MissionFailure> {
        loop {
            if self.cancel.is_cancelled() {
                return Some(MissionFailure::Cancelled);
            }
            if Instant::now() >= deadline {
                self.log(LogLevel::Warn, "mission.timeout", json!({ "mission": graph.name }));
                return Some(MissionFailure::TimedOut);
            }

            let play_due = run
                .last_play
                .map_or(true, |at| at.elapsed() >= self.play_interval);
            if play_due {
                if let Err(failure) = self.play(run).await {
                    return Some(failure);
                }
            }

            let status = match self.poll_status().await {
                Ok(status) => status,
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        "mission.status.failed",
                        json!({ "attempts": err.attempts() }),
                    );
                    return Some(MissionFailure::Status(err));
                }
            };
            run.final_state = Some(status.state);

            for event in run.tracker.observe(&status.progress) {
                self.on_feedback(graph, event, run, retriever).await;
            }

            if let Err(failure) = self.handle_questions(questions, &status, &mut run.ledger).await {
                return Some(failure);
            }

            if !status.state.is_active() {
                return (status.state != MissionState::Succeeded)
                    .then_some(MissionFailure::Finished(status.state));
            }

            let wake = (Instant::now() + self.poll_interval).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn on_feedback(
        &self,
        graph: &ActionGraph,
        event: FeedbackEvent,
        run: &mut RunState,
        retriever: &mut ArtifactRetriever,
    ) {
        match event {
            FeedbackEvent::Started(node) => {
                info!(element = %node.element_id, name = %node.element_name, "element running");
                self.log(
                    LogLevel::Info,
                    "mission.element.running",
                    json!({ "element": node.element_id, "node": node.node_id }),
                );
                let Some(element) = graph.element(&node.element_id) else {
                    return;
                };
                if let (true, Some(hook)) = (element.pose_correction, &self.hook) {
                    let lease = match self.renew(&run.lease).await {
                        Ok(lease) => lease,
                        Err(err) => {
                            warn!(error = %err, "lease renewal before pose correction failed");
                            run.corrections.push(CorrectionRecord {
                                element_id: element.id.clone(),
                                applied: false,
                            });
                            return;
                        }
                    };
                    run.lease = lease;
                    let applied = hook.before_capture(element, &run.lease).await;
                    run.corrections.push(CorrectionRecord {
                        element_id: element.id.clone(),
                        applied,
                    });
                }
            }
            FeedbackEvent::Completed(node) => {
                let now = Utc::now();
                let window = TimeWindow::new(run.window_start, now);
                run.window_start = now;
                self.log(
                    LogLevel::Info,
                    "mission.element.completed",
                    json!({ "element": node.element_id, "node": node.node_id }),
                );
                let action = graph
                    .element(&node.element_id)
                    .and_then(|element| element.action.as_ref());
                if let Some(action) = action {
                    retriever.spawn(RetrievalRequest {
                        element_id: node.element_id,
                        channel: action.channel.clone(),
                        window,
                        expectation: if action.expect_multiple {
                            ArtifactExpectation::AtLeastOne
                        } else {
                            ArtifactExpectation::ExactlyOne
                        },
                    });
                }
            }
            FeedbackEvent::Failed(node) => {
                warn!(element = %node.element_id, "element failed");
                self.log(
                    LogLevel::Warn,
                    "mission.element.failed",
                    json!({ "element": node.element_id, "node": node.node_id }),
                );
            }
        }
    }

    async fn handle_questions(
        &self,
        policy: &QuestionPolicy,
        status: &MissionStatus,
        ledger: &mut QuestionLedger,
    ) -> Result<(), MissionFailure> {
        for question in &status.questions {
            if ledger.was_answered(question.id) {
                self.log(
                    LogLevel::Error,
                    "mission.question.persisted",
                    json!({ "question": question.id, "text": question.text }),
                );
                return Err(MissionFailure::QuestionPersisted(question.id));
            }
            match policy.decide(question) {
                QuestionDecision::Wait => {}
                QuestionDecision::Unanswerable => {
                    return Err(MissionFailure::Unanswerable(question.id));
                }
                QuestionDecision::Answer(code) => {
                    with_retry_when(&self.retry, LinkError::is_transient, |_| {
                        self.client.answer(question.id, code)
                    })
                    .await
                    .map_err(|source| MissionFailure::Answer {
                        id: question.id,
                        source,
                    })?;
                    ledger.record(question.id);
                    self.log(
                        LogLevel::Info,
                        "mission.question.answered",
                        json!({ "question": question.id, "text": question.text, "code": code }),
                    );
                }
            }
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<LeaseToken, MissionFailure> {
        with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.links.authority.acquire()
        })
        .await
        .map_err(|err| {
            self.log(
                LogLevel::Error,
                "mission.authority.failed",
                json!({ "error": err.to_string() }),
            );
            MissionFailure::Authority(err)
        })
    }

    async fn renew(&self, lease: &LeaseToken) -> Result<LeaseToken, RetryError<LinkError>> {
        with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.links.authority.advance(lease)
        })
        .await
    }

    async fn is_localized(&self) -> Result<bool, MissionFailure> {
        with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.links.navigation.is_localized()
        })
        .await
        .map_err(MissionFailure::Localization)
    }

    async fn ensure_localized(&self, lease: &mut LeaseToken) -> Result<(), MissionFailure> {
        if self.is_localized().await? {
            return Ok(());
        }
        *lease = self.renew(lease).await.map_err(MissionFailure::Authority)?;
        let attempt =
            tokio::time::timeout(self.localize_timeout, self.links.navigation.localize(lease)).await;
        let detail = match attempt {
            Ok(Ok(())) => {
                if self.is_localized().await? {
                    return Ok(());
                }
                "still not localized after localize".to_string()
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "localization timed out".to_string(),
        };
        self.log(
            LogLevel::Error,
            "mission.localize.failed",
            json!({ "detail": detail }),
        );
        Err(MissionFailure::NotLocalized)
    }

    async fn play(&self, run: &mut RunState) -> Result<(), MissionFailure> {
        run.lease = self
            .renew(&run.lease)
            .await
            .map_err(MissionFailure::Authority)?;
        let pause_deadline = Utc::now()
            + chrono::Duration::from_std(self.play_interval * 2)
                .unwrap_or_else(|_| chrono::Duration::seconds(20));
        let lease = &run.lease;
        with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.client.play(lease, pause_deadline)
        })
        .await
        .map_err(|err| {
            self.log(
                LogLevel::Error,
                "mission.play.failed",
                json!({ "attempts": err.attempts() }),
            );
            MissionFailure::Play(err)
        })?;
        run.last_play = Some(Instant::now());
        Ok(())
    }

    async fn poll_status(&self) -> Result<MissionStatus, RetryError<LinkError>> {
        with_retry_when(&self.retry, LinkError::is_transient, |_| self.client.status()).await
    }

    fn finish(
        &self,
        started: Instant,
        final_state: Option<MissionState>,
        failure: Option<MissionFailure>,
        retrievals: RetrievalSummary,
        corrections: Vec<CorrectionRecord>,
    ) -> MissionReport {
        let success = failure.is_none() && final_state == Some(MissionState::Succeeded);
        let elapsed_s = started.elapsed().as_secs_f64();
        let payload = json!({
            "success": success,
            "elapsed_s": elapsed_s,
            "final_state": final_state,
            "failure": failure.as_ref().map(ToString::to_string),
            "captures_failed": retrievals.failed.len(),
            "captures_retrieved": retrievals.succeeded.len(),
        });
        if success {
            info!(elapsed_s, "mission succeeded");
        } else {
            warn!(elapsed_s, failure = ?failure, "mission failed");
        }
        self.log(
            if success { LogLevel::Info } else { LogLevel::Warn },
            "mission.finished",
            payload.clone(),
        );
        self.event("mission.finished", payload);
        MissionReport {
            success,
            elapsed_s,
            final_state,
            failure,
            retrievals,
            corrections,
        }
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
    use crate::{
        artifacts::MemoryCaptureSink,
        feedback::ElementState,
        graph::tests::element,
        loopback::{ScriptedMissionClient, StatusFrame},
        questions::{AnswerOption, Question},
    };
    use cell_links::SimulatedAgent;
    use parking_lot::Mutex;
    use shared_logging::read_records;
    use tempfile::tempdir;

    fn two_element_graph() -> ActionGraph {
        ActionGraph::new("st1", vec![element("a", Some("ptz")), element("b", Some("ptz"))])
    }

    fn engine(agent: &Arc<SimulatedAgent>, client: &Arc<ScriptedMissionClient>) -> MissionEngineBuilder {
        MissionEngine::builder(AgentLinks::from_agent(agent.clone()), client.clone())
            .poll_interval(Duration::from_millis(250))
            .play_interval(Duration::from_secs(10))
    }

    fn happy_frames() -> Vec<StatusFrame> {
        vec![
            StatusFrame::new(MissionState::Running).element(0, ElementState::Running),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running)
                .capture("ptz"),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Completed)
                .capture("ptz"),
            StatusFrame::new(MissionState::Succeeded)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Completed),
        ]
    }

    fn question(id: u64, text: &str) -> Question {
        Question {
            id,
            source: "mission".into(),
            text: text.into(),
            options: vec![
                AnswerOption { code: 10, text: "Retry".into() },
                AnswerOption { code: 11, text: "Skip this action".into() },
            ],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_retrieves_one_capture_per_element() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()).with_agent(agent.clone()));
        let sink = Arc::new(MemoryCaptureSink::default());
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), sink.clone())
            .await;
        assert!(report.success, "{:?}", report.failure);
        assert_eq!(report.retrievals.succeeded.len(), 2);
        assert!(report.retrievals.failed.is_empty());
        let elements: Vec<_> = sink.stored().into_iter().map(|(id, _)| id).collect();
        assert!(elements.contains(&"a".to_string()) && elements.contains(&"b".to_string()));
        assert_eq!(client.plays().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failure_returns_immediately_without_play() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()));
        client.fail_load(MissionLoadError::Validation {
            failed_elements: vec![1],
            failed_nodes: vec!["node-1".into()],
            detail: "unknown waypoint".into(),
        });
        let dir = tempdir().unwrap();
        let log = dir.path().join("mission.log");
        let telemetry = MissionTelemetry::builder("mission").log_path(&log).build().unwrap();
        let report = engine(&agent, &client)
            .telemetry(telemetry)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(!report.success);
        assert!(report.elapsed_s < 1e-6);
        assert!(matches!(report.failure, Some(MissionFailure::Load(_))));
        assert_eq!(client.loads(), 1);
        assert!(client.plays().is_empty());
        assert_eq!(client.status_calls(), 0);
        let records = read_records(&log).unwrap();
        let failed = records
            .iter()
            .find(|r| r.operation == "mission.load.failed")
            .unwrap();
        assert_eq!(failed.metadata["failed_elements"], json!([1]));
    }

    struct SlowSink {
        stored: Mutex<usize>,
    }

    #[async_trait]
    impl CaptureSink for SlowSink {
        async fn store(&self, _element_id: &str, _artifact: cell_links::Artifact) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            *self.stored.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_reported_only_after_retrievals_join() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()).with_agent(agent.clone()));
        let sink = Arc::new(SlowSink { stored: Mutex::new(0) });
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), sink.clone())
            .await;
        assert!(report.success);
        assert_eq!(*sink.stored.lock(), 2);
        assert!(report.elapsed_s >= 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_and_next_start_in_one_poll() {
        let agent = Arc::new(SimulatedAgent::powered());
        let frames = vec![
            StatusFrame::new(MissionState::Running).element(0, ElementState::Running),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running)
                .capture("ptz"),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running),
            StatusFrame::new(MissionState::Failed)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Failed),
        ];
        let client = Arc::new(ScriptedMissionClient::new(frames).with_agent(agent.clone()));
        let dir = tempdir().unwrap();
        let log = dir.path().join("mission.log");
        let telemetry = MissionTelemetry::builder("mission").log_path(&log).build().unwrap();
        let graph = ActionGraph::new("st2", vec![element("a", Some("ptz")), element("b", None)]);
        let report = engine(&agent, &client)
            .telemetry(telemetry)
            .build()
            .execute(&graph, Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(!report.success);
        assert_eq!(report.failure, Some(MissionFailure::Finished(MissionState::Failed)));
        // only a's window; b never completed but has no action to collect
        assert_eq!(report.retrievals.jobs(), 1);
        assert_eq!(
            report.retrievals.succeeded.iter().filter(|o| o.element_id == "a").count(),
            1
        );
        let records = read_records(&log).unwrap();
        let running_b = records
            .iter()
            .filter(|r| r.operation == "mission.element.running" && r.metadata["element"] == "b")
            .count();
        assert_eq!(running_b, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_last_action_gets_a_trailing_window() {
        let agent = Arc::new(SimulatedAgent::powered());
        let frames = vec![
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running),
            StatusFrame::new(MissionState::Running)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Running)
                .capture("ptz"),
            StatusFrame::new(MissionState::Failed)
                .element(0, ElementState::Completed)
                .element(1, ElementState::Failed),
        ];
        let client = Arc::new(ScriptedMissionClient::new(frames).with_agent(agent.clone()));
        let graph = ActionGraph::new("st3", vec![element("a", None), element("b", Some("ptz"))]);
        let report = engine(&agent, &client)
            .build()
            .execute(&graph, Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(!report.success);
        assert_eq!(report.retrievals.jobs(), 1);
        assert_eq!(
            report.retrievals.succeeded.iter().filter(|o| o.element_id == "b").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn benign_question_is_left_alone() {
        let agent = Arc::new(SimulatedAgent::powered());
        let waiting = question(3, "Waiting for the path to clear");
        let frames = vec![
            StatusFrame::new(MissionState::Paused).question(waiting.clone()),
            StatusFrame::new(MissionState::Paused).question(waiting),
            StatusFrame::new(MissionState::Succeeded),
        ];
        let client = Arc::new(ScriptedMissionClient::new(frames));
        let graph = ActionGraph::new("st3", vec![element("a", None)]);
        let report = engine(&agent, &client)
            .build()
            .execute(&graph, Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);
        assert!(client.answers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_questions_get_the_skip_answer() {
        let agent = Arc::new(SimulatedAgent::powered());
        let frames = vec![
            StatusFrame::new(MissionState::Paused).question(question(4, "Capture failed")),
            StatusFrame::new(MissionState::Succeeded),
        ];
        let client = Arc::new(ScriptedMissionClient::new(frames));
        let graph = ActionGraph::new("st3", vec![element("a", None)]);
        let report = engine(&agent, &client)
            .build()
            .execute(&graph, Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);
        assert_eq!(client.answers(), vec![(4, 11)]);
    }

    #[tokio::test(start_paused = true)]
    async fn question_surviving_its_answer_fails_the_call() {
        let agent = Arc::new(SimulatedAgent::powered());
        let frames = vec![
            StatusFrame::new(MissionState::Paused).question(question(5, "Arm fault")),
            StatusFrame::new(MissionState::Paused).question(question(5, "Arm fault")),
        ];
        let client = Arc::new(ScriptedMissionClient::new(frames));
        client.keep_answered_questions();
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert_eq!(report.failure, Some(MissionFailure::QuestionPersisted(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_failures_are_absorbed() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()).with_agent(agent.clone()));
        client.fail_status(3);
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);

        let client = Arc::new(ScriptedMissionClient::new(happy_frames()));
        client.fail_status(4);
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(matches!(
            report.failure,
            Some(MissionFailure::Status(RetryError::Exhausted { attempts: 4, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn play_is_renewed_every_ten_seconds() {
        let agent = Arc::new(SimulatedAgent::powered());
        let mut frames: Vec<_> = (0..100)
            .map(|_| StatusFrame::new(MissionState::Running).element(0, ElementState::Running))
            .collect();
        frames.push(StatusFrame::new(MissionState::Succeeded).element(0, ElementState::Completed));
        let client = Arc::new(ScriptedMissionClient::new(frames));
        let graph = ActionGraph::new("long", vec![element("a", None)]);
        let report = engine(&agent, &client)
            .build()
            .execute(&graph, Duration::from_secs(120), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);
        let plays = client.plays();
        assert_eq!(plays.len(), 3);
        assert!(plays.windows(2).all(|w| w[1].0.sequence > w[0].0.sequence));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_a_normal_failure() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(vec![
            StatusFrame::new(MissionState::Running).element(0, ElementState::Running),
        ]));
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(30), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert_eq!(report.failure, Some(MissionFailure::TimedOut));
        assert!((report.elapsed_s - 30.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_localization_aborts_before_load() {
        let agent = Arc::new(SimulatedAgent::powered());
        agent.set_localized(false);
        agent.fail_next("localize", 1);
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()));
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert_eq!(report.failure, Some(MissionFailure::NotLocalized));
        assert_eq!(client.loads(), 0);

        let client = Arc::new(ScriptedMissionClient::new(happy_frames()));
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_authority_is_a_hard_stop() {
        let agent = Arc::new(SimulatedAgent::powered());
        agent.set_connected(false);
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()));
        let report = engine(&agent, &client)
            .build()
            .execute(&two_element_graph(), Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(matches!(
            report.failure,
            Some(MissionFailure::Authority(RetryError::Fatal { attempts: 1, .. }))
        ));
        assert_eq!(client.loads(), 0);
    }

    struct CountingHook(Mutex<Vec<String>>);

    #[async_trait]
    impl CaptureHook for CountingHook {
        async fn before_capture(&self, element: &MissionElement, _lease: &LeaseToken) -> bool {
            self.0.lock().push(element.id.clone());
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hook_runs_once_for_flagged_elements() {
        let agent = Arc::new(SimulatedAgent::powered());
        let client = Arc::new(ScriptedMissionClient::new(happy_frames()).with_agent(agent.clone()));
        let mut graph = two_element_graph();
        graph.elements[1].pose_correction = true;
        let hook = Arc::new(CountingHook(Mutex::new(Vec::new())));
        let report = engine(&agent, &client)
            .hook(hook.clone())
            .build()
            .execute(&graph, Duration::from_secs(60), Arc::new(MemoryCaptureSink::default()))
            .await;
        assert!(report.success);
        assert_eq!(*hook.0.lock(), vec!["b".to_string()]);
        assert_eq!(
            report.corrections,
            vec![CorrectionRecord { element_id: "b".into(), applied: false }]
        );
    }
}
