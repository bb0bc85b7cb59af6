use std::sync::Arc;

use cell_config::SignalTags;
use cell_links::{AgentStatus, AuthorityApi, LeaseToken, LinkError, SignalBus, StatusApi};
use cell_mission::{with_retry_when, RetryError, RetryPolicy};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::context::{BypassSource, BypassState};

/// Authority and power checks plus the bounded recovery that re-establishes
/// them.
pub struct ResourceGate {
    authority: Arc<dyn AuthorityApi>,
    status: Arc<dyn StatusApi>,
    retry: RetryPolicy,
    lease: Mutex<Option<LeaseToken>>,
}

impl std::fmt::Debug for ResourceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGate")
            .field("lease", &*self.lease.lock())
            .finish_non_exhaustive()
    }
}

impl ResourceGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(authority: Arc<dyn AuthorityApi>, status: Arc<dyn StatusApi>, retry: RetryPolicy) -> Self {
        Self {
            authority,
            status,
            retry,
            lease: Mutex::new(None),
        }
    }

    /// Samples agent status, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the retry outcome when every attempt failed.
    pub async fn status(&self) -> Result<AgentStatus, RetryError<LinkError>> {
        with_retry_when(&self.retry, LinkError::is_transient, |_| self.status.status()).await
    }

    /// Connected, reachable, powered, not e-stopped, and authority held.
    pub async fn has_authority_and_power(&self) -> bool {
        self.status().await.is_ok_and(|status| status.is_operable())
    }

    /// Returns a freshly advanced lease, acquiring one if none is held or the
    /// held one was taken away.
    ///
    /// # Errors
    ///
    /// Fails when the lease can be neither advanced nor acquired.
    pub async fn lease(&self) -> Result<LeaseToken, RetryError<LinkError>> {
        let held = self.lease.lock().clone();
        if let Some(token) = held {
            match with_retry_when(&self.retry, LinkError::is_transient, |_| {
                self.authority.advance(&token)
            })
            .await
            {
                Ok(next) => {
                    *self.lease.lock() = Some(next.clone());
                    return Ok(next);
                }
                Err(err) => debug!(error = %err, "held lease could not be advanced; re-acquiring"),
            }
        }
        let token = with_retry_when(&self.retry, LinkError::is_transient, |_| self.authority.acquire()).await?;
        *self.lease.lock() = Some(token.clone());
        Ok(token)
    }

    /// One bounded attempt to take authority and enable power.
    ///
    /// Returns whether the agent is operable afterwards.
    pub async fn recover(&self) -> bool {
        let lease = match self.lease().await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(error = %err, "authority recovery failed");
                return false;
            }
        };
        if let Err(err) = with_retry_when(&self.retry, LinkError::is_transient, |_| {
            self.status.power_on(&lease)
        })
        .await
        {
            warn!(error = %err, "power recovery failed");
            return false;
        }
        let operable = self.has_authority_and_power().await;
        info!(operable, "resource recovery attempted");
        operable
    }
}

/// Battery thresholds and the one state writer, the bypass flag.
#[derive(Debug, Clone)]
pub struct BatteryScheduler {
    tags: SignalTags,
}

impl BatteryScheduler {
    /// Scheduler writing the given tags.
    #[must_use]
    pub const fn new(tags: SignalTags) -> Self {
        Self { tags }
    }

    /// Charge strictly below `threshold` percent.
    #[must_use]
    pub fn is_low(status: &AgentStatus, threshold: f64) -> bool {
        status.battery.charge_percent < threshold
    }

    /// Charge at or above `threshold` percent.
    #[must_use]
    pub fn is_enough(status: &AgentStatus, threshold: f64) -> bool {
        status.battery.charge_percent >= threshold
    }

    /// Currently charging.
    #[must_use]
    pub const fn is_charging(status: &AgentStatus) -> bool {
        status.battery.charging
    }

    /// Sets the flag owned by `source` and publishes the combined bypass
    /// signal together with last-work-complete.
    ///
    /// Returns whether both tag writes succeeded.
    pub async fn set_bypass(
        &self,
        bus: &dyn SignalBus,
        bypass: &mut BypassState,
        on: bool,
        source: BypassSource,
    ) -> bool {
        bypass.set(on, source);
        let visible = bypass.is_active();
        let bypass_ok = bus.write(&self.tags.bypass_on, visible.into()).await;
        let last_ok = bus.write(&self.tags.last_work_complete, visible.into()).await;
        if !(bypass_ok && last_ok) {
            warn!(tag = %self.tags.bypass_on, "bypass tag write failed");
        }
        info!(?source, on, visible, "bypass updated");
        bypass_ok && last_ok
    }
}
