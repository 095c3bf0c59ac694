use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::actors::{ActorHandle, WatchdogActor};
use crate::config::Config;
use crate::orchestration::{Coordinator, Organization, SessionPlacement, WorktreeLookup};
use crate::state::OrganizationState;
use crate::transport::{DemoTransport, Transport};
use crate::turn::{SessionEvent, SessionHub};
use crate::{plog, plog_debug, plog_warn, Result};

/// A running instance: hub, shared organization, coordinator and watchdog.
pub struct App {
    config: Config,
    hub: SessionHub,
    organization: Arc<RwLock<Organization>>,
    coordinator: Coordinator,
    watchdog: ActorHandle,
}

impl App {
    /// Start on `transport`, or on the demo transport when `config.demo` is set.
    pub fn start(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::start_inner(config, transport, None)
    }

    /// Start with an observer receiving every [`SessionEvent`].
    pub fn start_with_events(
        config: Config,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        Self::start_inner(config, transport, Some(events))
    }

    /// Start on the in-process demo transport.
    pub fn start_demo(mut config: Config) -> Result<Self> {
        config.demo = true;
        Self::start(config, Arc::new(DemoTransport::new()))
    }

    fn start_inner(
        config: Config,
        transport: Arc<dyn Transport>,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = if config.demo && !transport.is_demo() {
            plog!("Demo mode configured, using the in-process demo transport");
            Arc::new(DemoTransport::new())
        } else {
            transport
        };
        plog_debug!("App::start demo={}", config.demo);

        let hub = match events {
            Some(events) => SessionHub::spawn_with_events(transport, events),
            None => SessionHub::spawn(transport),
        };
        let organization = Arc::new(RwLock::new(Organization::new()));
        let watchdog =
            WatchdogActor::new(hub.clone(), organization.clone(), config.watchdog).spawn()?;
        let coordinator = Coordinator::new(hub.clone(), organization.clone(), config.reflection);

        Ok(Self {
            config,
            hub,
            organization,
            coordinator,
            watchdog,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    pub fn organization(&self) -> &Arc<RwLock<Organization>> {
        &self.organization
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Load persisted state into this instance. Returns a warning for each
    /// session that could not be restored.
    pub async fn restore(&self, state: OrganizationState) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        *self.organization.write().await = state.organization;

        for record in state.sessions {
            let name = record.name().to_string();
            if let Err(e) = self.hub.restore_session(record).await {
                plog_warn!("Could not restore session '{}': {}", name, e);
                warnings.push(format!("Session '{}' not restored: {}", name, e));
            }
        }
        plog!("State restored with {} warning(s)", warnings.len());
        Ok(warnings)
    }

    pub async fn snapshot_state(&self) -> Result<OrganizationState> {
        let sessions = self.hub.list_sessions().await?;
        let organization = self.organization.read().await.clone();
        Ok(OrganizationState::new(organization, sessions))
    }

    pub async fn persist(&self) -> Result<()> {
        self.snapshot_state().await?.save().await
    }

    pub async fn persist_to(&self, path: &Path) -> Result<()> {
        let state = self.snapshot_state().await?;
        let path = path.to_path_buf();
        crate::util::blocking(move || state.save_to(&path)).await
    }

    /// Auto-place live sessions into repository groups.
    pub async fn reconcile(
        &self,
        placements: &[SessionPlacement],
        lookup: &dyn WorktreeLookup,
    ) -> Vec<String> {
        self.organization.write().await.reconcile(placements, lookup)
    }

    pub fn shutdown(&self) {
        plog_debug!("App::shutdown");
        self.watchdog.shutdown();
        self.hub.shutdown();
    }
}
