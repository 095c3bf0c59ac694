//! Periodic watchdog scan.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogSettings;
use crate::orchestration::Organization;
use crate::turn::{SessionHub, StuckTurn};
use crate::{plog_debug, plog_trace, plog_warn, Error, Result};

use super::ActorHandle;

/// Actor that asks the hub to recover stuck turns on a fixed interval.
pub struct WatchdogActor {
    hub: SessionHub,
    organization: Arc<RwLock<Organization>>,
    settings: WatchdogSettings,
    interval: Duration,
}

impl WatchdogActor {
    pub fn new(
        hub: SessionHub,
        organization: Arc<RwLock<Organization>>,
        settings: WatchdogSettings,
    ) -> Self {
        Self {
            hub,
            organization,
            interval: settings.check_interval(),
            settings,
        }
    }

    /// Override the tick interval, mainly for tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one scan now.
    pub async fn scan_once(&self) -> Result<Vec<StuckTurn>> {
        let multi_agent = self.organization.read().await.multi_agent_sessions();
        self.hub
            .watchdog_scan(Utc::now(), self.settings, multi_agent)
            .await
    }

    pub fn spawn(self) -> Result<ActorHandle> {
        self.settings.validate()?;
        if self.interval.is_zero() {
            return Err(Error::Validation(
                "watchdog interval must be non-zero".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        plog_debug!("WatchdogActor::spawn interval={:?}", self.interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick completes immediately; skip it.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        plog_debug!("WatchdogActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if self.hub.is_closed() {
                            plog_debug!("WatchdogActor: hub closed");
                            break;
                        }
                        match self.scan_once().await {
                            Ok(recovered) if recovered.is_empty() => {
                                plog_trace!("WatchdogActor: all turns healthy");
                            }
                            Ok(recovered) => {
                                plog_warn!("WatchdogActor: recovered {} stuck turn(s)", recovered.len());
                            }
                            Err(Error::HubClosed) => break,
                            Err(e) => {
                                plog_warn!("WatchdogActor scan failed: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(ActorHandle::new(cancel))
    }
}
