//! Closed-loop simulation: the orchestrator and mission engine run for real
//! against the simulated agent while a plant driver plays the conveyance.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use cell_config::{CellConfig, ConfigStore, CorrectionFiles};
use cell_links::{AgentLinks, DepthFrame, MemorySignalBus, Pose, SimulatedAgent};
use cell_mission::{
    ActionGraph, CancelFlag, CaptureHook, DirectoryCaptureSink, MissionEngine, MissionTelemetry,
    QuestionPolicy, RetryPolicy, ScriptedMissionClient,
};
use cell_orchestrator::{
    ContextSnapshot, CycleLog, MissionStationRunner, Orchestrator, OrchestratorHandle,
    OrchestratorTelemetry, PoseCorrectionHook, ResourceGate, StatusMonitor, SummaryRecord,
};
use cell_pose_corrector::{ArmCorrectionDataset, CorrectorTelemetry, PoseCorrector};
use chrono::Utc;
use clap::Parser;
use shared_event_bus::{EventPublisher, FileEventPublisher};
use tracing::{info, warn};

/// Options of `cellctl run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Conveyances to process.
    #[arg(long, default_value_t = 3)]
    pub cycles: u32,
    /// Directory for the cycle log, component logs and captures.
    #[arg(long, default_value = "cellbot/logs")]
    pub log_dir: PathBuf,
    /// JSON-lines file receiving every published event.
    #[arg(long)]
    pub event_log: Option<PathBuf>,
    /// Initial battery charge in percent.
    #[arg(long, default_value_t = 90.0)]
    pub battery: f64,
    /// Record a synthetic master view under the log directory and correct
    /// against it.
    #[arg(long)]
    pub synthetic_master: bool,
    /// Abort when the cycles take longer than this many seconds.
    #[arg(long, default_value_t = 600)]
    pub timeout_s: u64,
}

/// Runs `args.cycles` cycles and returns the run summary, also appended to
/// the cycle log.
pub async fn run(store: ConfigStore, args: RunArgs) -> Result<SummaryRecord> {
    let config = store
        .load()
        .with_context(|| format!("loading {}", store.path().display()))?;
    fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("creating {}", args.log_dir.display()))?;
    let publisher: Option<Arc<dyn EventPublisher>> = match &args.event_log {
        Some(path) => Some(Arc::new(FileEventPublisher::new(path)?)),
        None => None,
    };

    let agent = Arc::new(SimulatedAgent::powered());
    agent.set_battery(args.battery, false);
    let links = AgentLinks::from_agent(Arc::clone(&agent));
    let bus = Arc::new(MemorySignalBus::connected());
    let cancel = CancelFlag::new();
    let retry = RetryPolicy::from(&config.mission).with_cancel(cancel.clone());

    let graph_dir = config.resolve_path(&config.mission.graph_dir);
    let graph = ActionGraph::load_dir(&graph_dir)
        .with_context(|| format!("loading graph from {}", graph_dir.display()))?;
    info!(
        graph = %graph.name,
        elements = graph.elements.len(),
        "base graph loaded"
    );

    let mut engine = MissionEngine::builder(
        links.clone(),
        Arc::new(ScriptedMissionClient::walking(Arc::clone(&agent))),
    )
    .settings(&config.mission)
    .questions(
        QuestionPolicy::new(
            &config.mission.benign_question_pattern,
            config.mission.answer_keyword.clone(),
        )
        .context("benign question pattern")?,
    )
    .telemetry(with_publisher(
        MissionTelemetry::builder("mission").log_path(args.log_dir.join("mission.log")),
        publisher.as_ref(),
        cell_mission::MissionTelemetryBuilder::event_publisher,
    )
    .build()?)
    .cancel(cancel.clone());
    if let Some(hook) = correction_hook(&config, &agent, &links, &args, publisher.as_ref())? {
        engine = engine.hook(hook);
    }
    let engine = Arc::new(engine.build());

    let gate = Arc::new(ResourceGate::new(
        Arc::clone(&links.authority),
        Arc::clone(&links.status),
        retry.clone(),
    ));
    let runner = MissionStationRunner::new(
        engine,
        Arc::new(graph),
        Arc::clone(&links.navigation),
        Arc::clone(&gate),
        Arc::new(DirectoryCaptureSink::new(args.log_dir.join("captures"))),
    )
    .with_retry(retry.clone())
    .with_mission_timeout(Duration::from_secs(config.cycle.mission_timeout_s));

    let cycle_log = CycleLog::create(args.log_dir.join("cycles.csv"))?;
    let telemetry = with_publisher(
        OrchestratorTelemetry::builder("orchestrator").log_path(args.log_dir.join("orchestrator.log")),
        publisher.as_ref(),
        cell_orchestrator::OrchestratorTelemetryBuilder::event_publisher,
    )
    .build()?;

    let monitor = StatusMonitor::spawn(
        Arc::clone(&links.status),
        bus.clone(),
        publisher.clone(),
        Duration::from_millis(config.cycle.status_interval_ms),
    );
    let mut orchestrator = Orchestrator::builder(config.clone(), links, bus.clone(), Arc::new(runner))
        .store(store)
        .gate(gate)
        .cycle_log(cycle_log.clone())
        .telemetry(telemetry)
        .retry(retry)
        .cancel(cancel)
        .build();
    let handle = orchestrator.handle();
    let control = tokio::spawn(async move {
        orchestrator.run().await;
    });

    let variants: Vec<String> = config.variants.keys().cloned().collect();
    let driven = tokio::time::timeout(
        Duration::from_secs(args.timeout_s),
        drive_plant(handle.clone(), bus.as_ref(), &config, args.cycles, &variants),
    )
    .await;

    handle.shutdown();
    if let Err(err) = control.await {
        warn!(error = %err, "control loop ended abnormally");
    }
    monitor.stop().await;

    match driven {
        Ok(result) => result?,
        Err(_) => bail!("cycles did not finish within {}s", args.timeout_s),
    }

    let records = cycle_log.read_records()?;
    let Some(summary) = SummaryRecord::from_records(&records) else {
        bail!("no cycle reached the log");
    };
    cycle_log.append_summary(&summary)?;
    info!(
        cycles = summary.cycles,
        success_rate = summary.success_rate,
        log = %cycle_log.path().display(),
        "run finished"
    );
    Ok(summary)
}

fn with_publisher<B>(
    builder: B,
    publisher: Option<&Arc<dyn EventPublisher>>,
    attach: fn(B, Arc<dyn EventPublisher>) -> B,
) -> B {
    match publisher {
        Some(publisher) => attach(builder, Arc::clone(publisher)),
        None => builder,
    }
}

/// Plays the conveyance: one arrival and departure per cycle, cycling
/// through the configured variants.
async fn drive_plant(
    mut handle: OrchestratorHandle,
    bus: &MemorySignalBus,
    config: &CellConfig,
    cycles: u32,
    variants: &[String],
) -> Result<()> {
    let tags = &config.signals;
    for index in 0..cycles {
        let variant = if variants.is_empty() {
            String::new()
        } else {
            variants[index as usize % variants.len()].clone()
        };
        bus.set(&tags.classification, variant.as_str());
        bus.set(&tags.departure, false);
        bus.set(&tags.arrival, true);
        info!(cycle = index + 1, %variant, "conveyance arrived");

        let snapshot = wait_for(&mut handle, |s| s.cycle_sequence.is_some() && s.completion_reported).await?;
        info!(sequence = ?snapshot.cycle_sequence, "cell reported completion");

        bus.set(&tags.arrival, false);
        bus.set(&tags.departure, true);
        wait_for(&mut handle, |s| s.cycle_sequence.is_none()).await?;
        bus.set(&tags.departure, false);
    }
    Ok(())
}

async fn wait_for(
    handle: &mut OrchestratorHandle,
    ready: impl Fn(&ContextSnapshot) -> bool,
) -> Result<ContextSnapshot> {
    loop {
        let snapshot = handle.snapshot();
        if ready(&snapshot) {
            return Ok(snapshot);
        }
        if !handle.changed().await {
            bail!("control loop stopped");
        }
    }
}

/// Builds the pose correction hook when a master dataset is available.
///
/// The simulated hand camera is pointed at the master scene, so corrections
/// converge on the recorded pose.
fn correction_hook(
    config: &CellConfig,
    agent: &SimulatedAgent,
    links: &AgentLinks,
    args: &RunArgs,
    publisher: Option<&Arc<dyn EventPublisher>>,
) -> Result<Option<Arc<dyn CaptureHook>>> {
    let files = if args.synthetic_master {
        let files = master_files(&args.log_dir.join("master"));
        let (frame, pose) = synthetic_view(config);
        ArmCorrectionDataset::record(&files, &frame, &pose)?;
        files
    } else {
        config.correction_files()
    };
    if !files.hand_depth.exists() {
        warn!(
            path = %files.hand_depth.display(),
            "no master dataset; captures run uncorrected"
        );
        return Ok(None);
    }
    let master = ArmCorrectionDataset::load(
        &files,
        &config.camera,
        config.registration.pixel_stride,
    )?;
    let raw = fs::read_to_string(&files.hand_depth)?;
    let mut frame: DepthFrame = serde_json::from_str(&raw)?;
    frame.captured_at = Utc::now();
    agent.set_depth_frame(frame);
    agent.set_pose(master.pose);

    let telemetry = with_publisher(
        CorrectorTelemetry::builder("pose_corrector").log_path(args.log_dir.join("corrector.log")),
        publisher,
        cell_pose_corrector::CorrectorTelemetryBuilder::event_publisher,
    )
    .build()?;
    let corrector = PoseCorrector::new(Arc::clone(&links.motion), Arc::clone(&links.capture))
        .with_settings(&config.registration)
        .with_intrinsics(config.camera)
        .with_telemetry(telemetry);
    Ok(Some(Arc::new(PoseCorrectionHook::new(
        corrector,
        master,
        config.thresholds.fitness,
    ))))
}

fn master_files(root: &Path) -> CorrectionFiles {
    CorrectionFiles {
        hand_depth: root.join("hand_depth.json"),
        hand_color: root.join("hand_color.png"),
        depth_color: root.join("depth_color.png"),
        arm_pose: root.join("arm_pose.json"),
    }
}

/// A gently curved panel half a meter in front of the camera, sized so the
/// principal point sits at the image center.
fn synthetic_view(config: &CellConfig) -> (DepthFrame, Pose) {
    let width = pixels(config.camera.cx * 2.0);
    let height = pixels(config.camera.cy * 2.0);
    let depths = (0..height)
        .flat_map(|y| {
            (0..width).map(move |x| {
                let (x, y) = (f64::from(x), f64::from(y));
                (0.5 + 0.03 * (x / 14.0).sin() * (y / 11.0).cos() + 0.0002 * x) as f32
            })
        })
        .collect();
    let frame = DepthFrame {
        width,
        height,
        depths,
        captured_at: Utc::now(),
    };
    (frame, Pose::at(0.65, 0.0, 0.45))
}

fn pixels(extent: f64) -> u32 {
    extent.round().clamp(1.0, f64::from(u16::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    /// Sample cell tuned for a quick run, with the graph left in place.
    fn fast_store(dir: &Path) -> ConfigStore {
        let sample = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/cell.json");
        let mut doc: Value = serde_json::from_str(&fs::read_to_string(sample).unwrap()).unwrap();
        let graph_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/graph");
        doc["mission"]["graph_dir"] = Value::from(graph_dir.to_string_lossy().into_owned());
        doc["mission"]["play_interval_s"] = Value::from(1);
        doc["mission"]["poll_interval_ms"] = Value::from(10);
        doc["mission"]["retry_backoff_ms"] = Value::from(10);
        doc["cycle"]["tick_ms"] = Value::from(10);
        doc["cycle"]["status_interval_ms"] = Value::from(50);
        let path = dir.join("cell.json");
        fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        ConfigStore::open(path)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simulated_run_logs_every_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = fast_store(dir.path());
        let args = RunArgs {
            cycles: 2,
            log_dir: dir.path().join("logs"),
            event_log: Some(dir.path().join("events.jsonl")),
            battery: 90.0,
            synthetic_master: true,
            timeout_s: 60,
        };
        let summary = run(store, args).await.unwrap();
        assert_eq!(summary.cycles, 2);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);

        let records = CycleLog::open(dir.path().join("logs/cycles.csv"))
            .read_records()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].required, 3);
        assert_eq!(records[1].required, 2);
        assert_eq!(records[0].arm_pointing_failures, 0);
        assert!(dir.path().join("logs/master/hand_depth.json").exists());
        assert!(dir.path().join("events.jsonl").exists());
    }

    #[test]
    fn synthetic_view_matches_the_intrinsics() {
        let (frame, _) = synthetic_view(&CellConfig::default());
        assert_eq!((frame.width, frame.height), (224, 174));
        assert!(frame.has_valid_buffer_size());
        assert!(frame.depths.iter().all(|d| (0.4..0.6).contains(d)));
    }
}
