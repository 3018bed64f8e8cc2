use crate::modules::config::{
    ConfigPatch, ConfigStore, PersistHandle, CONTROL_PLANE_KEYS, FEED_CREDENTIAL_KEYS,
};
use crate::modules::control::ControlPlaneClient;
use crate::modules::error::ConnectError;
use crate::modules::feed::DonationFeedClient;
use crate::modules::orchestrator::AutomationOrchestrator;
use crate::modules::ports::{LogPort, NotificationPort};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Composition root for one application session: both clients, the live
/// config, and the orchestrator wired between them.
pub struct AutomationSession {
    pub feed: Arc<DonationFeedClient>,
    pub control: Arc<ControlPlaneClient>,
    pub config: Arc<ConfigStore>,
    pub orchestrator: Arc<AutomationOrchestrator<ControlPlaneClient>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl AutomationSession {
    pub fn new(
        feed: DonationFeedClient,
        control: ControlPlaneClient,
        config: Arc<ConfigStore>,
        log: Arc<dyn LogPort>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        let control = Arc::new(control);
        let orchestrator = Arc::new(AutomationOrchestrator::new(
            Arc::clone(&control),
            Arc::clone(&config),
            log,
            notifier,
        ));
        Self {
            feed: Arc::new(feed),
            control,
            config,
            orchestrator,
            runner: Mutex::new(None),
        }
    }

    /// Credentials are saved only once the feed accepted them.
    pub async fn connect_feed(&self) -> Result<(), ConnectError> {
        let cfg = self.config.snapshot();
        self.feed
            .connect(
                &cfg.feed_credentials.page_id,
                &cfg.feed_credentials.stream_key,
            )
            .await?;
        self.config.persist(FEED_CREDENTIAL_KEYS);
        Ok(())
    }

    pub fn disconnect_feed(&self) {
        self.feed.disconnect();
    }

    pub async fn connect_control_plane(&self) -> Result<(), ConnectError> {
        let cfg = self.config.snapshot();
        self.control
            .connect(&cfg.control_plane_address, &cfg.control_plane_credential)
            .await?;
        self.config.persist(CONTROL_PLANE_KEYS);
        Ok(())
    }

    pub fn disconnect_control_plane(&self) {
        self.control.disconnect();
    }

    pub fn update_config(&self, patch: ConfigPatch) -> PersistHandle {
        self.config.update(patch)
    }

    /// Starts draining feed events into the orchestrator. Calling it again
    /// while the loop is alive does nothing.
    pub fn start(&self) {
        let mut runner = self
            .runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if runner.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let events = self.feed.subscribe();
        *runner = Some(tokio::spawn(Arc::clone(&self.orchestrator).run(events)));
    }

    pub fn shutdown(&self) {
        if let Some(h) = self
            .runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            h.abort();
        }
        self.orchestrator.shutdown();
        self.feed.disconnect();
        self.control.disconnect();
    }
}
