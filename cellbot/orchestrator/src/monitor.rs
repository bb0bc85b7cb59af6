use std::{sync::Arc, time::Duration};

use cell_links::{AgentStatus, SignalBus, StatusApi};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use shared_event_bus::{EventPublisher, EventRecord};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

/// One status sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellStatus {
    /// Agent status, `None` when the sample failed.
    pub agent: Option<AgentStatus>,
    /// Signal bus connectivity.
    pub bus_connected: bool,
    /// Sample time.
    pub sampled_at: DateTime<Utc>,
}

/// Background sampler of agent and bus health.
///
/// It only reads; cycle state is never touched.
#[derive(Debug)]
pub struct StatusMonitor {
    latest: Arc<RwLock<Option<CellStatus>>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl StatusMonitor {
    /// Starts sampling every `interval`, publishing `cell.status` events when
    /// a publisher is given.
    #[must_use]
    pub fn spawn(
        status: Arc<dyn StatusApi>,
        bus: Arc<dyn SignalBus>,
        publisher: Option<Arc<dyn EventPublisher>>,
        interval: Duration,
    ) -> Self {
        let latest = Arc::new(RwLock::new(None));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::sample_loop(
            status,
            bus,
            publisher,
            interval,
            Arc::clone(&latest),
            shutdown_rx,
        ));
        Self {
            latest,
            shutdown,
            handle,
        }
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<CellStatus> {
        self.latest.read().clone()
    }

    /// Stops the sampler and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "status monitor task ended abnormally");
        }
    }

    async fn sample_loop(
        status: Arc<dyn StatusApi>,
        bus: Arc<dyn SignalBus>,
        publisher: Option<Arc<dyn EventPublisher>>,
        interval: Duration,
        latest: Arc<RwLock<Option<CellStatus>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = CellStatus {
                        agent: status.status().await.ok(),
                        bus_connected: bus.is_connected(),
                        sampled_at: Utc::now(),
                    };
                    if let Some(publisher) = &publisher {
                        match serde_json::to_value(&sample) {
                            Ok(payload) => {
                                let event = EventRecord::new("orchestrator", "cell.status", payload);
                                if let Err(err) = publisher.publish(event).await {
                                    debug!(?err, "status event dropped");
                                }
                            }
                            Err(err) => debug!(error = %err, "status sample not serializable"),
                        }
                    }
                    *latest.write() = Some(sample);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("status monitor shutdown");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_links::{MemorySignalBus, SimulatedAgent};
    use shared_event_bus::MemoryEventBus;

    #[tokio::test(start_paused = true)]
    async fn samples_on_interval_until_stopped() {
        let agent = Arc::new(SimulatedAgent::default());
        let bus = Arc::new(MemorySignalBus::connected());
        let events = Arc::new(MemoryEventBus::new(32));
        let monitor = StatusMonitor::spawn(agent, bus.clone(), Some(events.clone()), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let latest = monitor.latest().unwrap();
        assert!(latest.bus_connected);
        assert!(latest.agent.is_some());
        assert_eq!(events.events_of("cell.status").len(), 4);

        bus.set_connected(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!monitor.latest().unwrap().bus_connected);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_samples_keep_running() {
        let agent = Arc::new(SimulatedAgent::default());
        agent.set_connected(false);
        let bus = Arc::new(MemorySignalBus::connected());
        let monitor = StatusMonitor::spawn(agent, bus, None, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(monitor.latest().unwrap().agent.is_none());
        monitor.stop().await;
    }
}
