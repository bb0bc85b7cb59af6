use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    CameraIntrinsics, CellConfig, ConfigError, HoleInspection, SignalTags, StationSettings,
    Thresholds,
};

/// File-backed configuration store.
///
/// Holds only the path. Every getter re-reads and re-validates the whole
/// document, so edits made by other processes are picked up on the next call.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Opens a store without touching the file.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads, parses and validates the whole document.
    pub fn load(&self) -> Result<CellConfig, ConfigError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut config: CellConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        config.source_dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.validate()?;
        debug!(path = %self.path.display(), "configuration loaded");
        Ok(config)
    }

    /// Validates and rewrites the whole document.
    pub fn save(&self, config: &CellConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let body = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, body).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Settings of one station.
    pub fn station(&self, name: &str) -> Result<StationSettings, ConfigError> {
        self.load()?
            .stations
            .shift_remove(name)
            .ok_or_else(|| ConfigError::UnknownStation(name.to_string()))
    }

    /// Battery and fitness thresholds.
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Ok(self.load()?.thresholds)
    }

    /// Hole inspection settings.
    pub fn hole_inspection(&self) -> Result<HoleInspection, ConfigError> {
        Ok(self.load()?.hole_inspection)
    }

    /// Hand depth camera intrinsics.
    pub fn camera(&self) -> Result<CameraIntrinsics, ConfigError> {
        Ok(self.load()?.camera)
    }

    /// Plant tag names.
    pub fn signals(&self) -> Result<SignalTags, ConfigError> {
        Ok(self.load()?.signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn getters_observe_external_edits() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("cell.json"));
        store.save(&CellConfig::default()).unwrap();
        assert!((store.thresholds().unwrap().battery_low - 20.0).abs() < f64::EPSILON);

        let raw = fs::read_to_string(store.path()).unwrap();
        let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        doc["thresholds"]["battery_low"] = serde_json::json!(30.0);
        fs::write(store.path(), doc.to_string()).unwrap();

        assert!((store.thresholds().unwrap().battery_low - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_document_takes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cell.json");
        fs::write(
            &path,
            r#"{ "stations": { "station_1": { "waypoint": "wp-a", "elements": ["e1"] } },
                 "cycle": { "station_order": ["station_1"] } }"#,
        )
        .unwrap();
        let config = ConfigStore::open(&path).load().unwrap();
        assert_eq!(config.cycle.tick_ms, 200);
        assert_eq!(config.stations["station_1"].waypoint, "wp-a");
        assert_eq!(config.source_dir(), dir.path());
    }

    #[test]
    fn correction_files_resolve_against_config_dir() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("cell.json"));
        store.save(&CellConfig::default()).unwrap();
        let files = store.load().unwrap().correction_files();
        assert_eq!(files.hand_depth, dir.path().join("master").join("hand_depth.json"));
    }

    #[test]
    fn invalid_document_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cell.json");
        fs::write(&path, r#"{ "thresholds": { "fitness": 1.5 } }"#).unwrap();
        assert!(matches!(
            ConfigStore::open(&path).load(),
            Err(ConfigError::Invalid(_))
        ));
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::open(&path).load(),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn unknown_station_is_an_error() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("cell.json"));
        store.save(&CellConfig::default()).unwrap();
        assert!(matches!(
            store.station("station_7"),
            Err(ConfigError::UnknownStation(_))
        ));
    }
}
