use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use cell_config::{CellConfig, ConfigStore};
use cell_mission::ActionGraph;
use cell_orchestrator::{CycleLog, SummaryRecord};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod simulate;

#[derive(Parser, Debug)]
#[command(name = "cellctl", version, about = "Inspection cell control")]
struct Cli {
    /// Cell configuration file.
    #[arg(long, global = true, default_value = "cellbot/config/cell.json")]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs cycles against the simulated agent and plant.
    Run(simulate::RunArgs),
    /// Prints the statistics of a cycle log.
    Summary {
        /// Cycle log written by a run.
        log: PathBuf,
        /// Also append the summary block to the log.
        #[arg(long)]
        append: bool,
    },
    /// Lists the recorded base graph, or writes a subset of it.
    Graph {
        /// Graph directory; defaults to the configured one.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Element ids to keep, in order.
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,
        /// Where to write the subset.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validates the configuration and reports what it references.
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let store = ConfigStore::open(&cli.config);
    match cli.command {
        Commands::Run(args) => {
            let runtime = Runtime::new().context("failed to start tokio runtime")?;
            let summary = runtime.block_on(simulate::run(store, args))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Summary { log, append } => handle_summary(&log, append),
        Commands::Graph { dir, select, out } => {
            let config = store.load()?;
            handle_graph(&config, dir, &select, out.as_deref())
        }
        Commands::CheckConfig => handle_check(&store),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn handle_summary(path: &Path, append: bool) -> Result<()> {
    ensure!(path.exists(), "cycle log {} not found", path.display());
    let log = CycleLog::open(path);
    let records = log
        .read_records()
        .with_context(|| format!("reading {}", path.display()))?;
    let Some(summary) = SummaryRecord::from_records(&records) else {
        bail!("{} holds no cycles", path.display());
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if append {
        log.append_summary(&summary)?;
    }
    Ok(())
}

fn handle_graph(
    config: &CellConfig,
    dir: Option<PathBuf>,
    select: &[String],
    out: Option<&Path>,
) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.resolve_path(&config.mission.graph_dir));
    let graph = ActionGraph::load_dir(&dir)
        .with_context(|| format!("loading graph from {}", dir.display()))?;
    if select.is_empty() {
        let elements: Vec<_> = graph
            .elements
            .iter()
            .map(|element| {
                json!({
                    "id": element.id,
                    "name": element.name,
                    "destination": element.target.destination(),
                    "action": element.action.as_ref().map(|action| &action.kind),
                    "pose_correction": element.pose_correction,
                })
            })
            .collect();
        let listing = json!({
            "name": graph.name,
            "elements": elements,
            "waypoint_snapshots": graph.snapshots().waypoints,
            "edge_snapshots": graph.snapshots().edges,
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    let subset = graph.subset(select)?;
    match out {
        Some(path) => {
            subset.save(path)?;
            println!("wrote {} elements to {}", subset.elements.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&subset)?),
    }
    Ok(())
}

fn handle_check(store: &ConfigStore) -> Result<()> {
    let config = store
        .load()
        .with_context(|| format!("loading {}", store.path().display()))?;
    let files = config.correction_files();
    let graph_dir = config.resolve_path(&config.mission.graph_dir);
    let report = json!({
        "config": store.path(),
        "station_order": config.cycle.station_order,
        "variants": config.variants,
        "waypoints": config.waypoints,
        "dock_id": config.dock_id,
        "graph_dir": graph_dir,
        "graph_present": graph_dir.join("graph.json").exists(),
        "master": {
            "hand_depth": files.hand_depth.exists(),
            "arm_pose": files.arm_pose.exists(),
            "hand_color": files.hand_color.exists(),
            "depth_color": files.depth_color.exists(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_and_graph_selection() {
        let cli = Cli::parse_from(["cellctl", "run", "--cycles", "2", "--synthetic-master"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.cycles, 2);
                assert!(args.synthetic_master);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["cellctl", "graph", "--select", "st1_approach,st1_capture"]);
        match cli.command {
            Commands::Graph { select, .. } => assert_eq!(select, ["st1_approach", "st1_capture"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn check_config_reads_the_sample_cell() {
        let store = ConfigStore::open(concat!(env!("CARGO_MANIFEST_DIR"), "/../config/cell.json"));
        handle_check(&store).unwrap();
    }

    #[test]
    fn graph_subset_is_written() {
        let store = ConfigStore::open(concat!(env!("CARGO_MANIFEST_DIR"), "/../config/cell.json"));
        let config = store.load().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("station_1.json");
        handle_graph(
            &config,
            None,
            &["st1_approach".to_string(), "st1_capture".to_string()],
            Some(&out),
        )
        .unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(written["elements"].as_array().unwrap().len(), 2);
        assert_eq!(written["map_id"], config_map_id(&config));
    }

    fn config_map_id(config: &CellConfig) -> serde_json::Value {
        let raw = std::fs::read_to_string(
            config.resolve_path(&config.mission.graph_dir).join("graph.json"),
        )
        .unwrap();
        serde_json::from_str::<serde_json::Value>(&raw).unwrap()["map_id"].clone()
    }
}
