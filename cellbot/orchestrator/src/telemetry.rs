use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};

/// Builder for orchestrator telemetry.
pub struct OrchestratorTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl OrchestratorTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
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

    /// Builds the telemetry handle, opening the log file if one was set.
    pub fn build(self) -> Result<OrchestratorTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        Ok(OrchestratorTelemetry {
            module: self.module,
            logger: logger.map(Arc::new),
            publisher: self.event_publisher,
        })
    }
}

/// Cycle progress log and event sink.
#[derive(Clone)]
pub struct OrchestratorTelemetry {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for OrchestratorTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorTelemetry")
            .field("module", &self.module)
            .field("logging", &self.logger.is_some())
            .finish_non_exhaustive()
    }
}

impl OrchestratorTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> OrchestratorTelemetryBuilder {
        OrchestratorTelemetryBuilder::new(module)
    }

    /// Writes one record under `operation`.
    pub fn log(&self, level: LogLevel, operation: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            logger.log(&LogRecord::new(&self.module, level, operation).with_metadata(metadata))?;
        }
        Ok(())
    }

    /// Publishes an event. Inside a runtime the publish is spawned.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = self.publisher.clone() else {
            return Ok(());
        };
        let record = EventRecord::new(&self.module, event_type, payload);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        tracing::warn!(?err, "orchestrator event publish failed");
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
