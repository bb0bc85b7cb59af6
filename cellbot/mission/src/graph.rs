use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// File holding the serialized graph inside a graph directory.
pub const GRAPH_FILE: &str = "graph.json";
const WAYPOINT_SNAPSHOTS: &str = "waypoint_snapshots";
const EDGE_SNAPSHOTS: &str = "edge_snapshots";

/// Errors raised while loading or reducing an action graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph directory or file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The graph file is not a valid graph document.
    #[error("parsing {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Two elements share an id.
    #[error("duplicate element id `{0}`")]
    DuplicateElement(String),
    /// A subset names an element the graph does not have.
    #[error("unknown element id `{0}`")]
    UnknownElement(String),
    /// A subset selected nothing.
    #[error("subset selects no elements")]
    EmptySubset,
}

/// Where an element sends the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NavigationTarget {
    /// Single recorded waypoint.
    Waypoint {
        /// Waypoint id on the recorded map.
        waypoint_id: String,
    },
    /// Explicit route through several waypoints.
    Route {
        /// Waypoint ids in travel order.
        waypoint_ids: Vec<String>,
    },
}

impl NavigationTarget {
    /// Final waypoint of the target.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Waypoint { waypoint_id } => Some(waypoint_id),
            Self::Route { waypoint_ids } => waypoint_ids.last().map(String::as_str),
        }
    }
}

/// Physical action performed once the target is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Action kind, e.g. `arm_pointing_capture`.
    pub kind: String,
    /// Capture channel the action produces, if any.
    #[serde(default)]
    pub channel: Option<String>,
    /// The action produces several captures instead of one.
    #[serde(default)]
    pub expect_multiple: bool,
    /// Opaque action parameters forwarded to the agent.
    #[serde(default)]
    pub parameters: Value,
}

/// What the agent does after an element fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Raise an operator question.
    #[default]
    Prompt,
    /// Skip the element silently.
    Skip,
    /// Abort the mission.
    Abort,
}

/// Per-element failure behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureBehavior {
    /// Automatic retries before escalating.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Seconds before an escalation prompt is raised.
    #[serde(default = "default_prompt_delay_s")]
    pub prompt_delay_s: f64,
    /// Escalation once retries are spent.
    #[serde(default)]
    pub escalation: Escalation,
}

impl Default for FailureBehavior {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            prompt_delay_s: default_prompt_delay_s(),
            escalation: Escalation::default(),
        }
    }
}

const fn default_retry_count() -> u32 {
    1
}

const fn default_prompt_delay_s() -> f64 {
    60.0
}

/// Camera parameter overrides applied while an element runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CameraOverride {
    /// Capture resolution.
    #[serde(default)]
    pub resolution: Option<String>,
    /// Absolute focus.
    #[serde(default)]
    pub focus_absolute: Option<u32>,
    /// Exposure in milliseconds.
    #[serde(default)]
    pub exposure_ms: Option<f64>,
}

/// One node of an action graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionElement {
    /// Stable element id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Navigation target.
    pub target: NavigationTarget,
    /// Optional action at the target.
    #[serde(default)]
    pub action: Option<ActionDescriptor>,
    /// Run the sensor pose correction before this element captures.
    #[serde(default)]
    pub pose_correction: bool,
    /// Failure behaviour.
    #[serde(default)]
    pub failure_behavior: FailureBehavior,
    /// Camera override.
    #[serde(default)]
    pub camera: Option<CameraOverride>,
}

/// Auxiliary snapshot files found next to the graph.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotIndex {
    /// Waypoint snapshot file names.
    pub waypoints: Vec<String>,
    /// Edge snapshot file names.
    pub edges: Vec<String>,
}

/// Ordered action graph.
///
/// Unknown top-level fields survive a load, [`ActionGraph::subset`] and a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGraph {
    /// Mission name.
    pub name: String,
    /// Parameters applying to the whole mission.
    #[serde(default)]
    pub global_parameters: Value,
    /// Docks known to the recording.
    #[serde(default)]
    pub docks: Vec<Value>,
    /// Elements in execution order.
    #[serde(default)]
    pub elements: Vec<MissionElement>,
    /// Remaining top-level fields, kept verbatim.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
    #[serde(skip)]
    snapshots: SnapshotIndex,
}

impl ActionGraph {
    /// Creates a graph with no extra fields.
    #[must_use]
    pub fn new(name: impl Into<String>, elements: Vec<MissionElement>) -> Self {
        Self {
            name: name.into(),
            global_parameters: Value::Null,
            docks: Vec::new(),
            elements,
            extra: IndexMap::new(),
            snapshots: SnapshotIndex::default(),
        }
    }

    /// Parses a graph from JSON text and checks element ids are unique.
    pub fn from_json(raw: &str, origin: &Path) -> Result<Self, GraphError> {
        let graph: Self = serde_json::from_str(raw).map_err(|source| GraphError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        graph.check_unique()?;
        Ok(graph)
    }

    /// Loads `graph.json` from a recorded graph directory and indexes its
    /// snapshot files.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, GraphError> {
        let dir = dir.as_ref();
        let path = dir.join(GRAPH_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| GraphError::Io {
            path: path.clone(),
            source,
        })?;
        let mut graph = Self::from_json(&raw, &path)?;
        graph.snapshots = SnapshotIndex {
            waypoints: list_files(&dir.join(WAYPOINT_SNAPSHOTS))?,
            edges: list_files(&dir.join(EDGE_SNAPSHOTS))?,
        };
        Ok(graph)
    }

    /// Writes the graph as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(self).map_err(|source| GraphError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, body).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Snapshot files indexed by [`ActionGraph::load_dir`].
    #[must_use]
    pub const fn snapshots(&self) -> &SnapshotIndex {
        &self.snapshots
    }

    /// Looks an element up by id.
    #[must_use]
    pub fn element(&self, id: &str) -> Option<&MissionElement> {
        self.elements.iter().find(|element| element.id == id)
    }

    /// Copy of the graph holding only `ids`, in the given order.
    ///
    /// Every other top-level field is carried over unchanged.
    pub fn subset<S: AsRef<str>>(&self, ids: &[S]) -> Result<Self, GraphError> {
        if ids.is_empty() {
            return Err(GraphError::EmptySubset);
        }
        let mut elements = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let element = self
                .element(id)
                .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
            elements.push(element.clone());
        }
        let graph = Self {
            elements,
            ..self.clone()
        };
        graph.check_unique()?;
        Ok(graph)
    }

    fn check_unique(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for element in &self.elements {
            if !seen.insert(element.id.as_str()) {
                return Err(GraphError::DuplicateElement(element.id.clone()));
            }
        }
        Ok(())
    }
}

fn list_files(dir: &Path) -> Result<Vec<String>, GraphError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| GraphError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| GraphError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.path().is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    pub(crate) fn element(id: &str, channel: Option<&str>) -> MissionElement {
        MissionElement {
            id: id.into(),
            name: format!("{id} name"),
            target: NavigationTarget::Waypoint {
                waypoint_id: format!("wp-{id}"),
            },
            action: channel.map(|channel| ActionDescriptor {
                kind: "arm_pointing_capture".into(),
                channel: Some(channel.into()),
                expect_multiple: false,
                parameters: Value::Null,
            }),
            pose_correction: false,
            failure_behavior: FailureBehavior::default(),
            camera: None,
        }
    }

    fn sample_json() -> Value {
        json!({
            "name": "line-4 walk",
            "global_parameters": { "self_right_attempts": 1 },
            "docks": [{ "dock_id": 520, "docked_waypoint_id": "dock-wp" }],
            "playback_mode": { "once": {} },
            "elements": [
                { "id": "a", "target": { "kind": "waypoint", "waypoint_id": "wp-a" } },
                { "id": "b", "target": { "kind": "route", "waypoint_ids": ["wp-a", "wp-b"] },
                  "action": { "kind": "arm_pointing_capture", "channel": "ptz" },
                  "pose_correction": true },
                { "id": "c", "target": { "kind": "waypoint", "waypoint_id": "wp-c" } }
            ]
        })
    }

    #[test]
    fn load_dir_indexes_snapshots() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(GRAPH_FILE), sample_json().to_string()).unwrap();
        fs::create_dir(dir.path().join(WAYPOINT_SNAPSHOTS)).unwrap();
        fs::write(dir.path().join(WAYPOINT_SNAPSHOTS).join("snap-1"), b"x").unwrap();
        let graph = ActionGraph::load_dir(dir.path()).unwrap();
        assert_eq!(graph.elements.len(), 3);
        assert_eq!(graph.snapshots().waypoints, vec!["snap-1".to_string()]);
        assert!(graph.snapshots().edges.is_empty());
        assert_eq!(graph.elements[1].target.destination(), Some("wp-b"));
    }

    #[test]
    fn subset_preserves_top_level_fields_and_order() {
        let graph = ActionGraph::from_json(&sample_json().to_string(), Path::new("mem")).unwrap();
        let reduced = graph.subset(&["c", "a"]).unwrap();
        assert_eq!(reduced.name, graph.name);
        assert_eq!(reduced.docks, graph.docks);
        assert_eq!(reduced.global_parameters, graph.global_parameters);
        assert_eq!(reduced.extra.get("playback_mode"), graph.extra.get("playback_mode"));
        let ids: Vec<_> = reduced.elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn subset_rejects_unknown_and_empty() {
        let graph = ActionGraph::new("g", vec![element("a", None)]);
        assert!(matches!(graph.subset(&["z"]), Err(GraphError::UnknownElement(_))));
        assert!(matches!(graph.subset::<&str>(&[]), Err(GraphError::EmptySubset)));
        assert!(matches!(graph.subset(&["a", "a"]), Err(GraphError::DuplicateElement(_))));
    }

    #[test]
    fn save_round_trips_unknown_fields() {
        let dir = tempdir().unwrap();
        let graph = ActionGraph::from_json(&sample_json().to_string(), Path::new("mem")).unwrap();
        let out = dir.path().join("reduced.json");
        graph.subset(&["b"]).unwrap().save(&out).unwrap();
        let back = ActionGraph::from_json(&fs::read_to_string(&out).unwrap(), &out).unwrap();
        assert!(back.extra.contains_key("playback_mode"));
        assert!(back.elements[0].pose_correction);
    }
}
