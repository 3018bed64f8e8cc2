use crate::modules::config::ConfigStore;
use crate::modules::control::ControlPlaneClient;
use crate::modules::error::RequestError;
use crate::modules::feed::{DonationEvent, DonationSubscription};
use crate::modules::ports::{LogPort, NotificationPort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

pub type ActionId = u64;

/// What the orchestrator needs from the control plane.
#[async_trait]
pub trait SceneControl: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn current_scene(&self) -> Result<String, RequestError>;
    async fn set_scene(&self, scene: &str) -> Result<(), RequestError>;
    async fn set_text_content(&self, input: &str, text: &str) -> Result<(), RequestError>;
}

#[async_trait]
impl SceneControl for ControlPlaneClient {
    fn is_connected(&self) -> bool {
        ControlPlaneClient::is_connected(self)
    }

    async fn current_scene(&self) -> Result<String, RequestError> {
        ControlPlaneClient::current_scene(self).await
    }

    async fn set_scene(&self, scene: &str) -> Result<(), RequestError> {
        ControlPlaneClient::set_scene(self, scene).await
    }

    async fn set_text_content(&self, input: &str, text: &str) -> Result<(), RequestError> {
        ControlPlaneClient::set_text_content(self, input, text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotConnected,
    NoSceneTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonationOutcome {
    Ignored(IgnoreReason),
    /// The switch itself failed; nothing was armed.
    Failed(RequestError),
    Switched {
        original: String,
        revert: Option<ActionId>,
    },
}

pub struct PendingRevert {
    pub original_target: String,
    pub scheduled_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<ActionId, PendingRevert>>>;

fn lock_pending(map: &PendingMap) -> MutexGuard<'_, HashMap<ActionId, PendingRevert>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns donation events into timed switch-and-revert actions.
///
/// Reverts stack: every donation captures whatever scene is live right
/// before its own switch and restores exactly that when its timer fires.
/// Overlapping donations therefore unwind through intermediate scenes.
pub struct AutomationOrchestrator<C: SceneControl + 'static> {
    control: Arc<C>,
    config: Arc<ConfigStore>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl<C: SceneControl + 'static> AutomationOrchestrator<C> {
    pub fn new(
        control: Arc<C>,
        config: Arc<ConfigStore>,
        log: Arc<dyn LogPort>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            control,
            config,
            log,
            notifier,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Drains `events` in delivery order until the feed client goes away.
    pub async fn run(self: Arc<Self>, mut events: DonationSubscription) {
        while let Some(event) = events.recv().await {
            self.handle_donation(&event).await;
        }
        tracing::debug!("donation subscription closed");
    }

    pub async fn handle_donation(&self, event: &DonationEvent) -> DonationOutcome {
        let cfg = self.config.snapshot();

        if !self.control.is_connected() {
            self.log.append(&format!(
                "Donation from {} ignored: OBS is not connected.",
                event.supporter_name
            ));
            return DonationOutcome::Ignored(IgnoreReason::NotConnected);
        }
        let Some(target) = cfg.scene_target else {
            self.log.append(&format!(
                "Donation from {} ignored: no target scene selected.",
                event.supporter_name
            ));
            return DonationOutcome::Ignored(IgnoreReason::NoSceneTarget);
        };

        let original = match self.control.current_scene().await {
            Ok(scene) => scene,
            Err(e) => {
                self.report_failure("Failed to switch scene", &e);
                return DonationOutcome::Failed(e);
            }
        };

        if let Err(e) = self.control.set_scene(&target).await {
            self.report_failure("Failed to switch scene", &e);
            return DonationOutcome::Failed(e);
        }
        self.log.append(&format!("Switched to scene: {target}"));
        self.notifier
            .notify("Scene Switched", Some(&format!("Switched to {target}")));

        let revert = if cfg.revert_delay_ms > 0 {
            Some(self.arm_revert(original.clone(), Duration::from_millis(cfg.revert_delay_ms)))
        } else {
            None
        };
        DonationOutcome::Switched { original, revert }
    }

    fn arm_revert(&self, original: String, delay: Duration) -> ActionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::clone(&self.control);
        let log = Arc::clone(&self.log);
        let notifier = Arc::clone(&self.notifier);
        let pending = Arc::clone(&self.pending);
        let scene = original.clone();
        let deadline = tokio::time::Instant::now() + delay;

        // Hold the map across spawn + insert so the timer can never remove
        // its entry before it exists.
        let mut map = lock_pending(&self.pending);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            lock_pending(&pending).remove(&id);

            if !control.is_connected() {
                log.append(&format!(
                    "Failed to switch back to scene {scene}: OBS is not connected."
                ));
                notifier.notify(
                    "Failed to switch back",
                    Some(&RequestError::NotConnected.to_string()),
                );
                return;
            }
            match control.set_scene(&scene).await {
                Ok(()) => {
                    log.append(&format!("Switched back to scene: {scene}"));
                    notifier.notify(
                        "Scene Switched Back",
                        Some(&format!("Switched back to {scene}")),
                    );
                }
                Err(e) => {
                    tracing::warn!(action = id, "revert failed: {e}");
                    log.append(&format!("Failed to switch back to scene {scene}: {e}"));
                    notifier.notify("Failed to switch back", Some(&e.to_string()));
                }
            }
        });
        map.insert(
            id,
            PendingRevert {
                original_target: original,
                scheduled_at: Utc::now(),
                timer,
            },
        );
        tracing::debug!(action = id, delay_ms = delay.as_millis() as u64, "revert armed");
        id
    }

    /// Mirrors `text` onto the configured text source. Returns whether the
    /// source was updated; a missing target or connection is a silent no-op.
    pub async fn update_text_content(&self, text: &str) -> bool {
        let Some(input) = self.config.text_target() else {
            return false;
        };
        if !self.control.is_connected() {
            return false;
        }
        match self.control.set_text_content(&input, text).await {
            Ok(()) => {
                self.log.append(&format!("Updated text source {input}."));
                true
            }
            Err(e) => {
                self.report_failure("Failed to update text source", &e);
                false
            }
        }
    }

    /// Outstanding reverts as `(id, scene they will restore)`, oldest first.
    pub fn pending_reverts(&self) -> Vec<(ActionId, String)> {
        let mut out: Vec<(ActionId, String)> = lock_pending(&self.pending)
            .iter()
            .map(|(id, p)| (*id, p.original_target.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn pending_revert_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub fn scheduled_at(&self, id: ActionId) -> Option<DateTime<Utc>> {
        lock_pending(&self.pending).get(&id).map(|p| p.scheduled_at)
    }

    /// Cancels one revert before it fires. Not used by the automation path.
    pub fn cancel_revert(&self, id: ActionId) -> bool {
        match lock_pending(&self.pending).remove(&id) {
            Some(p) => {
                p.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts every outstanding timer. For session teardown.
    pub fn shutdown(&self) {
        for (_, p) in lock_pending(&self.pending).drain() {
            p.timer.abort();
        }
    }

    fn report_failure(&self, title: &str, e: &RequestError) {
        tracing::warn!("{title}: {e}");
        self.log.append(&format!("{title}: {e}"));
        self.notifier.notify(title, Some(&e.to_string()));
    }
}
