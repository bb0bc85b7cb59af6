use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};

/// Builder for corrector telemetry.
pub struct CorrectorTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl CorrectorTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<CorrectorTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        Ok(CorrectorTelemetry {
            module: self.module,
            logger: logger.map(Arc::new),
            publisher: self.event_publisher,
        })
    }
}

/// Structured log and event sink for pose correction.
#[derive(Clone)]
pub struct CorrectorTelemetry {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for CorrectorTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectorTelemetry")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

impl CorrectorTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> CorrectorTelemetryBuilder {
        CorrectorTelemetryBuilder::new(module)
    }

    /// Logs structured metadata under an operation name.
    pub fn log(&self, level: LogLevel, operation: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            logger.log(&LogRecord::new(&self.module, level, operation).with_metadata(metadata))?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = self.publisher.clone() else {
            return Ok(());
        };
        let record = EventRecord::new(&self.module, event_type, payload);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        tracing::warn!(?err, "corrector event publish failed");
                    }
                });
                Ok(())
            }
            Err(_) => Builder::new_current_thread()
                .build()?
                .block_on(publisher.publish(record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn writes_log_and_publishes_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrector.log");
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = CorrectorTelemetry::builder("pose_corrector")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "correction.applied", json!({ "fitness": 0.9 }))
            .unwrap();
        telemetry.event("pose.corrected", json!({})).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("correction.applied"));
        assert_eq!(bus.events_of("pose.corrected").len(), 1);
    }
}
