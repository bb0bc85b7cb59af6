use std::{sync::Arc, time::Duration};

use cell_config::{CellConfig, ConfigStore};
use cell_links::{AgentLinks, AgentStatus, LinkError, SignalBus, TagValue};
use cell_mission::{with_retry_when, CancelFlag, RetryPolicy};
use chrono::Utc;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    context::{
        BypassSource, ContextSnapshot, OrchestratorCommand, OrchestratorContext,
        OrchestratorHandle,
    },
    cycle_log::{CycleLog, CycleRecord},
    gate::{BatteryScheduler, ResourceGate},
    state::{BatterySample, InspectionCycle, StationResult, WorkState},
    station::StationRunner,
    telemetry::OrchestratorTelemetry,
};

const MOTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a tick did no cycle work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// Automatic cycling is switched off.
    Manual,
    /// The signal bus is down; a reconnect was attempted.
    BusDisconnected,
    /// The agent lacks power or authority; a recovery was attempted unless
    /// manual bypass is on.
    AgentUnavailable,
    /// Completion of a failed cycle is held for the operator.
    AwaitingConfirmation,
}

/// Result of one control loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Preconditions not met.
    Idle(IdleReason),
    /// The station cursor moved to the given state.
    Advanced(WorkState),
    /// Waiting on the conveyance.
    Waiting,
    /// Shutdown requested; the loop should exit.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum Travel<'a> {
    Waypoint(&'a str),
    Dock(u32),
    Undock,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: CellConfig,
    links: AgentLinks,
    bus: Arc<dyn SignalBus>,
    runner: Arc<dyn StationRunner>,
    store: Option<ConfigStore>,
    gate: Option<Arc<ResourceGate>>,
    cycle_log: Option<CycleLog>,
    telemetry: Option<OrchestratorTelemetry>,
    retry: Option<RetryPolicy>,
    cancel: CancelFlag,
}

impl OrchestratorBuilder {
    /// Reloads the configuration from `store` at the start of every cycle.
    #[must_use]
    pub fn store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares a gate with other components, typically the station runner.
    #[must_use]
    pub fn gate(mut self, gate: Arc<ResourceGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Appends one row per reported cycle.
    #[must_use]
    pub fn cycle_log(mut self, log: CycleLog) -> Self {
        self.cycle_log = Some(log);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: OrchestratorTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Overrides the retry policy derived from the mission settings.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Uses `cancel` as the shutdown flag, so a mission engine holding the
    /// same flag stops with the loop.
    #[must_use]
    pub fn cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builds the orchestrator.
    #[must_use]
    pub fn build(self) -> Orchestrator {
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from(&self.config.mission))
            .with_cancel(self.cancel.clone());
        let gate = self.gate.unwrap_or_else(|| {
            Arc::new(ResourceGate::new(
                Arc::clone(&self.links.authority),
                Arc::clone(&self.links.status),
                retry.clone(),
            ))
        });
        let (command_tx, commands) = mpsc::unbounded_channel();
        let context = OrchestratorContext::default();
        let (snapshots, _) = watch::channel(context.snapshot());
        Orchestrator {
            scheduler: BatteryScheduler::new(self.config.signals.clone()),
            config: self.config,
            store: self.store,
            links: self.links,
            bus: self.bus,
            gate,
            runner: self.runner,
            cycle_log: self.cycle_log,
            telemetry: self.telemetry,
            retry,
            cancel: self.cancel,
            context,
            commands,
            command_tx,
            snapshots,
            docked_since: None,
            stopping: false,
        }
    }
}

/// The inspection cycle control loop.
///
/// One task owns the orchestrator and calls [`Orchestrator::run`] (or
/// [`Orchestrator::tick`] directly). Everything else talks to it through
/// [`OrchestratorHandle`]s.
pub struct Orchestrator {
    config: CellConfig,
    store: Option<ConfigStore>,
    links: AgentLinks,
    bus: Arc<dyn SignalBus>,
    gate: Arc<ResourceGate>,
    scheduler: BatteryScheduler,
    runner: Arc<dyn StationRunner>,
    cycle_log: Option<CycleLog>,
    telemetry: Option<OrchestratorTelemetry>,
    retry: RetryPolicy,
    cancel: CancelFlag,
    context: OrchestratorContext,
    commands: mpsc::UnboundedReceiver<OrchestratorCommand>,
    command_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    snapshots: watch::Sender<ContextSnapshot>,
    docked_since: Option<Instant>,
    stopping: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("context", &self.context)
            .field("cycle_log", &self.cycle_log)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts a builder.
    #[must_use]
    pub fn builder(
        config: CellConfig,
        links: AgentLinks,
        bus: Arc<dyn SignalBus>,
        runner: Arc<dyn StationRunner>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            links,
            bus,
            runner,
            store: None,
            gate: None,
            cycle_log: None,
            telemetry: None,
            retry: None,
            cancel: CancelFlag::new(),
        }
    }

    /// New control handle.
    #[must_use]
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle::new(
            self.command_tx.clone(),
            self.snapshots.subscribe(),
            self.cancel.clone(),
        )
    }

    /// Current context.
    #[must_use]
    pub const fn context(&self) -> &OrchestratorContext {
        &self.context
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &CellConfig {
        &self.config
    }

    /// Cycle log, if one is attached.
    #[must_use]
    pub const fn cycle_log(&self) -> Option<&CycleLog> {
        self.cycle_log.as_ref()
    }

    /// Ticks every `cycle.tick_ms` until shutdown.
    pub async fn run(&mut self) {
        info!(tick_ms = self.config.cycle.tick_ms, "orchestrator loop started");
        while self.tick().await != TickOutcome::Stopped {
            tokio::time::sleep(Duration::from_millis(self.config.cycle.tick_ms)).await;
        }
        info!(
            cycles = self.context.cycles_started,
            "orchestrator loop stopped"
        );
    }

    /// One loop iteration: apply queued commands, check preconditions, do at
    /// most one unit of cycle work, publish the snapshot.
    pub async fn tick(&mut self) -> TickOutcome {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command).await;
        }
        let outcome = if self.stopping || self.cancel.is_cancelled() {
            TickOutcome::Stopped
        } else {
            self.step().await
        };
        self.snapshots.send_replace(self.context.snapshot());
        outcome
    }

    async fn apply(&mut self, command: OrchestratorCommand) {
        debug!(?command, "operator command");
        match command {
            OrchestratorCommand::SetAutomatic(on) => {
                self.context.automatic = on;
                info!(on, "automatic cycling toggled");
                self.log(LogLevel::Info, "mode.automatic", json!({ "on": on }));
            }
            OrchestratorCommand::SetManualBypass(on) => {
                self.scheduler
                    .set_bypass(
                        self.bus.as_ref(),
                        &mut self.context.bypass,
                        on,
                        BypassSource::Manual,
                    )
                    .await;
                self.log(LogLevel::Info, "bypass.manual", json!({ "on": on }));
            }
            OrchestratorCommand::ConfirmCompletion => self.context.confirmed = true,
            OrchestratorCommand::OverrideState(state) => {
                warn!(from = ?self.context.state, to = ?state, "work state overridden");
                self.log(
                    LogLevel::Warn,
                    "state.override",
                    json!({ "from": self.context.state, "to": state }),
                );
                self.context.state = state;
            }
            OrchestratorCommand::Shutdown => self.stopping = true,
        }
    }

    async fn step(&mut self) -> TickOutcome {
        if !self.context.automatic {
            return TickOutcome::Idle(IdleReason::Manual);
        }
        if !self.bus.is_connected() {
            match self.bus.connect().await {
                Ok(()) => info!("signal bus reconnected"),
                Err(err) => warn!(error = %err, "signal bus reconnect failed"),
            }
            return TickOutcome::Idle(IdleReason::BusDisconnected);
        }

        let status = match self.gate.status().await {
            Ok(status) if status.is_operable() => status,
            sampled => {
                if self.context.bypass.manual {
                    let sampled = sampled.ok();
                    return self.bypass_step(sampled.as_ref()).await;
                }
                let recovered = self.gate.recover().await;
                self.log(
                    LogLevel::Warn,
                    "agent.unavailable",
                    json!({ "recovered": recovered }),
                );
                return TickOutcome::Idle(IdleReason::AgentUnavailable);
            }
        };

        let thresholds = self.config.thresholds;
        let charging = BatteryScheduler::is_charging(&status);
        if BatteryScheduler::is_low(&status, thresholds.battery_low) && !charging {
            self.dock_for_charge(&status).await;
            return self.bypass_step(Some(&status)).await;
        }
        if self.context.bypass.automatic
            && charging
            && BatteryScheduler::is_enough(&status, thresholds.battery_enough)
        {
            self.leave_dock(&status).await;
        }
        if self.context.bypass.is_active() {
            return self.bypass_step(Some(&status)).await;
        }
        self.cycle_step(&status).await
    }

    #[instrument(skip_all, fields(charge = status.battery.charge_percent))]
    async fn dock_for_charge(&mut self, status: &AgentStatus) {
        warn!("battery low; docking");
        if !self.context.bypass.automatic {
            self.scheduler
                .set_bypass(
                    self.bus.as_ref(),
                    &mut self.context.bypass,
                    true,
                    BypassSource::Automatic,
                )
                .await;
        }
        let docked = self
            .travel(Travel::Waypoint(&self.config.waypoints.dock))
            .await
            && self.travel(Travel::Dock(self.config.dock_id)).await;
        if docked {
            self.docked_since = Some(Instant::now());
        }
        let level = if docked { LogLevel::Info } else { LogLevel::Warn };
        let payload = json!({
            "charge_percent": status.battery.charge_percent,
            "dock_id": self.config.dock_id,
            "docked": docked,
        });
        self.log(level, "battery.dock", payload.clone());
        self.event("battery.docking", payload);
    }

    #[instrument(skip_all, fields(charge = status.battery.charge_percent))]
    async fn leave_dock(&mut self, status: &AgentStatus) {
        info!("battery recovered; leaving dock");
        self.scheduler
            .set_bypass(
                self.bus.as_ref(),
                &mut self.context.bypass,
                false,
                BypassSource::Automatic,
            )
            .await;
        if let Some(since) = self.docked_since.take() {
            self.context.pending_dock_wait_min += since.elapsed().as_secs_f64() / 60.0;
        }
        let undocked = self.travel(Travel::Undock).await;
        let home = self
            .travel(Travel::Waypoint(&self.config.waypoints.home))
            .await;
        if self.context.cycle.is_none() {
            self.context.state = WorkState::Home;
        }
        self.log(
            LogLevel::Info,
            "battery.undock",
            json!({
                "charge_percent": status.battery.charge_percent,
                "undocked": undocked,
                "home": home,
            }),
        );
    }

    /// Conveyance handling while bypass is on: no stations, completion is
    /// reported as soon as an item is present.
    async fn bypass_step(&mut self, status: Option<&AgentStatus>) -> TickOutcome {
        let reported = self.context.cycle.as_ref().map(|c| c.completion_reported);
        match reported {
            None => {
                if !self.signal(&self.config.signals.arrival).await {
                    return TickOutcome::Waiting;
                }
                let cycle = self.open_cycle(status).await;
                self.context.cycle = Some(cycle);
                self.report_completion(status, true).await;
                self.advance_to(WorkState::Complete)
            }
            Some(false) => {
                info!("bypass engaged mid-cycle; remaining stations dropped");
                self.report_completion(status, true).await;
                self.advance_to(WorkState::Complete)
            }
            Some(true) => {
                if self.signal(&self.config.signals.departure).await {
                    self.finish_cycle().await
                } else {
                    TickOutcome::Waiting
                }
            }
        }
    }

    async fn cycle_step(&mut self, status: &AgentStatus) -> TickOutcome {
        match self.context.state {
            WorkState::Home => {
                if !self.signal(&self.config.signals.arrival).await {
                    return TickOutcome::Waiting;
                }
                if self.context.cycle.is_none() {
                    let cycle = self.open_cycle(Some(status)).await;
                    self.context.cycle = Some(cycle);
                }
                let next = WorkState::Home.next(self.config.cycle.station_order.len());
                self.advance_to(next)
            }
            WorkState::Complete => self.complete_step(status).await,
            station => self.station_step(station, status).await,
        }
    }

    async fn open_cycle(&mut self, status: Option<&AgentStatus>) -> InspectionCycle {
        self.reload_config();
        let classification = self
            .bus
            .read_text(&self.config.signals.classification)
            .await
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let required = self.config.stations_for(classification.as_deref());
        self.context.cycles_started += 1;
        let mut cycle =
            InspectionCycle::start(self.context.cycles_started, classification, required);
        cycle.battery_start = status.map(battery_sample);
        cycle.dock_wait_min = std::mem::take(&mut self.context.pending_dock_wait_min);
        info!(
            sequence = cycle.sequence,
            classification = ?cycle.classification,
            required = ?cycle.required,
            "cycle started"
        );
        let payload = json!({
            "sequence": cycle.sequence,
            "id": cycle.id,
            "classification": cycle.classification,
            "required": cycle.required,
        });
        self.log(LogLevel::Info, "cycle.started", payload.clone());
        self.event("cycle.started", payload);
        cycle
    }

    fn reload_config(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load() {
            Ok(config) => {
                self.scheduler = BatteryScheduler::new(config.signals.clone());
                self.config = config;
            }
            Err(err) => {
                warn!(error = %err, "configuration reload failed; keeping previous settings");
                self.log(
                    LogLevel::Warn,
                    "config.reload_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
    }

    #[instrument(skip(self, status))]
    async fn station_step(&mut self, state: WorkState, status: &AgentStatus) -> TickOutcome {
        let slots = self.config.cycle.station_order.len();
        let Some(name) = state
            .slot()
            .and_then(|slot| self.config.cycle.station_order.get(slot))
            .cloned()
        else {
            return self.advance_to(WorkState::Complete);
        };
        if self.context.cycle.is_none() {
            warn!(station = %name, "station state without a cycle; opening one");
            let cycle = self.open_cycle(Some(status)).await;
            self.context.cycle = Some(cycle);
        }

        let required = self
            .context
            .cycle
            .as_ref()
            .is_some_and(|cycle| cycle.requires(&name));
        let result = if required {
            match self.config.stations.get(&name).cloned() {
                Some(settings) => {
                    info!(station = %name, "station started");
                    self.runner.run_station(&name, &settings).await
                }
                None => StationResult::failed(&name, 0.0, "station not configured"),
            }
        } else {
            debug!(station = %name, "station not required for this item");
            StationResult::skipped(&name)
        };
        self.report_station(&result).await;
        if let Some(cycle) = self.context.cycle.as_mut() {
            cycle.results.push(result);
        }

        let next = state.next(slots);
        if next == WorkState::Complete
            && !self
                .travel(Travel::Waypoint(&self.config.waypoints.complete))
                .await
        {
            warn!("complete waypoint not reached; reporting from the current position");
        }
        self.advance_to(next)
    }

    /// Station complete tag is always raised; the error tag tells success
    /// from failure downstream.
    async fn report_station(&self, result: &StationResult) {
        let tags = &self.config.signals;
        self.write_tag(&tags.complete_tag(&result.station), true.into())
            .await;
        self.write_tag(&tags.error_tag(&result.station), (!result.success).into())
            .await;
        let payload = json!({
            "station": result.station,
            "success": result.success,
            "skipped": result.skipped,
            "elapsed_s": result.elapsed_s,
            "arm_pointing_failures": result.arm_pointing_failures,
            "detail": result.detail,
        });
        if result.success {
            info!(station = %result.station, skipped = result.skipped, "station finished");
            self.log(LogLevel::Info, "station.completed", payload);
        } else {
            warn!(station = %result.station, detail = ?result.detail, "station failed");
            self.log(LogLevel::Warn, "station.failed", payload.clone());
            self.event("station.failed", payload);
        }
    }

    async fn complete_step(&mut self, status: &AgentStatus) -> TickOutcome {
        let reported = self
            .context
            .cycle
            .as_ref()
            .map_or(true, |cycle| cycle.completion_reported);
        if !reported {
            if self.awaiting_confirmation().await {
                return TickOutcome::Idle(IdleReason::AwaitingConfirmation);
            }
            self.report_completion(Some(status), false).await;
            return TickOutcome::Waiting;
        }
        if self.signal(&self.config.signals.departure).await {
            return self.finish_cycle().await;
        }
        TickOutcome::Waiting
    }

    async fn awaiting_confirmation(&self) -> bool {
        let failed = self
            .context
            .cycle
            .as_ref()
            .is_some_and(|cycle| cycle.failed() > 0);
        if !(self.config.cycle.require_confirmation_on_failure && failed) || self.context.confirmed
        {
            return false;
        }
        if self.signal(&self.config.signals.confirmation).await {
            return false;
        }
        debug!("cycle completion held for operator confirmation");
        true
    }

    async fn report_completion(&mut self, status: Option<&AgentStatus>, bypassed: bool) {
        let Some(cycle) = self.context.cycle.as_mut() else {
            return;
        };
        cycle.bypassed |= bypassed;
        cycle.ended_at = Some(Utc::now());
        cycle.battery_end = status.map(battery_sample);
        cycle.completion_reported = true;
        let errored = cycle.failed() > 0;
        let record = CycleRecord::from_cycle(cycle);

        let tags = self.config.signals.clone();
        self.write_tag(&tags.cycle_complete, true.into()).await;
        self.write_tag(&tags.cycle_error, errored.into()).await;
        self.write_tag(&tags.cycle_time, record.cycle_time_min.into())
            .await;

        if let Some(log) = &self.cycle_log {
            if let Err(err) = log.append(&record) {
                warn!(error = %err, "cycle record not written");
                self.log(
                    LogLevel::Error,
                    "cycle_log.append_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
        info!(
            sequence = record.cycle,
            succeeded = record.succeeded,
            bypassed,
            cycle_time_min = record.cycle_time_min,
            "cycle completion reported"
        );
        let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
        self.log(LogLevel::Info, "cycle.completed", payload.clone());
        self.event("cycle.completed", payload);
    }

    /// Departure seen: lower the per-cycle tags and return home.
    async fn finish_cycle(&mut self) -> TickOutcome {
        let tags = self.config.signals.clone();
        for station in &self.config.cycle.station_order {
            self.write_tag(&tags.complete_tag(station), false.into()).await;
            self.write_tag(&tags.error_tag(station), false.into()).await;
        }
        self.write_tag(&tags.cycle_complete, false.into()).await;
        self.write_tag(&tags.cycle_error, false.into()).await;

        // Under bypass the agent may be docked or unavailable; leave it be.
        if !self.context.bypass.is_active()
            && !self
                .travel(Travel::Waypoint(&self.config.waypoints.home))
                .await
        {
            warn!("home waypoint not reached after departure");
        }
        if let Some(cycle) = self.context.cycle.take() {
            info!(sequence = cycle.sequence, "cycle cleared on departure");
        }
        self.context.confirmed = false;
        self.advance_to(WorkState::Home)
    }

    fn advance_to(&mut self, next: WorkState) -> TickOutcome {
        let from = self.context.state;
        self.context.state = next;
        if from != next {
            info!(?from, to = ?next, "work state advanced");
            let payload = json!({ "from": from, "to": next });
            self.log(LogLevel::Info, "state.advanced", payload.clone());
            self.event("cycle.state", payload);
        }
        TickOutcome::Advanced(next)
    }

    async fn travel(&self, travel: Travel<'_>) -> bool {
        let lease = match self.gate.lease().await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(?travel, error = %err, "no lease for motion");
                self.log(
                    LogLevel::Warn,
                    "navigation.failed",
                    json!({ "target": format!("{travel:?}"), "error": err.to_string() }),
                );
                return false;
            }
        };
        let navigation = &self.links.navigation;
        let outcome = with_retry_when(&self.retry, LinkError::is_transient, |_| match travel {
            Travel::Waypoint(waypoint) => navigation.navigate_to(&lease, waypoint, MOTION_TIMEOUT),
            Travel::Dock(dock_id) => navigation.dock(&lease, dock_id),
            Travel::Undock => navigation.undock(&lease),
        })
        .await;
        match outcome {
            Ok(()) => true,
            Err(err) => {
                warn!(?travel, error = %err, "motion failed");
                self.log(
                    LogLevel::Warn,
                    "navigation.failed",
                    json!({ "target": format!("{travel:?}"), "error": err.to_string() }),
                );
                false
            }
        }
    }

    async fn signal(&self, tag: &str) -> bool {
        self.bus.read_bool(tag).await == Some(true)
    }

    async fn write_tag(&self, tag: &str, value: TagValue) -> bool {
        let written = self.bus.write(tag, value).await;
        if !written {
            warn!(tag, "signal write failed");
            self.log(LogLevel::Warn, "signal.write_failed", json!({ "tag": tag }));
        }
        written
    }

    fn log(&self, level: LogLevel, operation: &str, metadata: Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, operation, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(event_type, payload);
        }
    }
}

const fn battery_sample(status: &AgentStatus) -> BatterySample {
    BatterySample {
        charge_percent: status.battery.charge_percent,
        min_temp_c: status.battery.min_temp_c,
        max_temp_c: status.battery.max_temp_c,
    }
}
