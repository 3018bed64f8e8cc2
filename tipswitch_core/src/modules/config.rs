use crate::modules::ports::{LogPort, SettingsPort};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

pub const KEY_PAGE_ID: &str = "pageId";
pub const KEY_STREAM_KEY: &str = "streamApiKey";
pub const KEY_ADDRESS: &str = "url";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_REVERT_DELAY: &str = "revertDelayMs";
pub const KEY_SCENE_TARGET: &str = "targetScene";
pub const KEY_TEXT_TARGET: &str = "textSource";

pub const FEED_CREDENTIAL_KEYS: &[&str] = &[KEY_PAGE_ID, KEY_STREAM_KEY];
pub const CONTROL_PLANE_KEYS: &[&str] = &[KEY_ADDRESS, KEY_PASSWORD];

pub const DEFAULT_ADDRESS: &str = "ws://127.0.0.1:4455";
pub const DEFAULT_REVERT_DELAY_MS: u64 = 5_000;

#[derive(Clone, Default)]
pub struct FeedCredentials {
    pub page_id: String,
    pub stream_key: Zeroizing<String>,
}

impl FeedCredentials {
    pub fn is_complete(&self) -> bool {
        !self.page_id.trim().is_empty() && !self.stream_key.trim().is_empty()
    }
}

impl fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("page_id", &self.page_id)
            .field("stream_key", &redact(&self.stream_key))
            .finish()
    }
}

#[derive(Clone)]
pub struct AutomationConfig {
    pub feed_credentials: FeedCredentials,
    pub control_plane_address: String,
    pub control_plane_credential: Zeroizing<String>,
    pub scene_target: Option<String>,
    pub text_target: Option<String>,
    pub revert_delay_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            feed_credentials: FeedCredentials::default(),
            control_plane_address: DEFAULT_ADDRESS.to_string(),
            control_plane_credential: Zeroizing::new(String::new()),
            scene_target: None,
            text_target: None,
            revert_delay_ms: DEFAULT_REVERT_DELAY_MS,
        }
    }
}

impl fmt::Debug for AutomationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutomationConfig")
            .field("feed_credentials", &self.feed_credentials)
            .field("control_plane_address", &self.control_plane_address)
            .field(
                "control_plane_credential",
                &redact(&self.control_plane_credential),
            )
            .field("scene_target", &self.scene_target)
            .field("text_target", &self.text_target)
            .field("revert_delay_ms", &self.revert_delay_ms)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

fn get_string(settings: &dyn SettingsPort, key: &str) -> Option<String> {
    settings
        .get(key)
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|s| !s.is_empty())
}

impl AutomationConfig {
    /// Absent or mistyped keys keep their defaults.
    pub fn load(settings: &dyn SettingsPort) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get_string(settings, KEY_PAGE_ID) {
            cfg.feed_credentials.page_id = v;
        }
        if let Some(v) = get_string(settings, KEY_STREAM_KEY) {
            cfg.feed_credentials.stream_key = Zeroizing::new(v);
        }
        if let Some(v) = get_string(settings, KEY_ADDRESS) {
            cfg.control_plane_address = v;
        }
        if let Some(v) = get_string(settings, KEY_PASSWORD) {
            cfg.control_plane_credential = Zeroizing::new(v);
        }
        cfg.scene_target = get_string(settings, KEY_SCENE_TARGET);
        cfg.text_target = get_string(settings, KEY_TEXT_TARGET);
        if let Some(ms) = settings.get(KEY_REVERT_DELAY).and_then(|v| v.as_u64()) {
            cfg.revert_delay_ms = ms;
        }
        cfg
    }

    fn value_for(&self, key: &str) -> Value {
        let opt = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        match key {
            KEY_PAGE_ID => Value::String(self.feed_credentials.page_id.clone()),
            KEY_STREAM_KEY => Value::String(self.feed_credentials.stream_key.to_string()),
            KEY_ADDRESS => Value::String(self.control_plane_address.clone()),
            KEY_PASSWORD => Value::String(self.control_plane_credential.to_string()),
            KEY_REVERT_DELAY => Value::from(self.revert_delay_ms),
            KEY_SCENE_TARGET => opt(&self.scene_target),
            KEY_TEXT_TARGET => opt(&self.text_target),
            _ => Value::Null,
        }
    }
}

/// A partial update. `Some(None)` on a target clears it.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub page_id: Option<String>,
    pub stream_key: Option<String>,
    pub control_plane_address: Option<String>,
    pub control_plane_credential: Option<String>,
    pub scene_target: Option<Option<String>>,
    pub text_target: Option<Option<String>>,
    pub revert_delay_ms: Option<u64>,
}

impl ConfigPatch {
    fn apply(self, cfg: &mut AutomationConfig) -> Vec<&'static str> {
        let mut touched = Vec::new();
        if let Some(v) = self.page_id {
            cfg.feed_credentials.page_id = v;
            touched.push(KEY_PAGE_ID);
        }
        if let Some(v) = self.stream_key {
            cfg.feed_credentials.stream_key = Zeroizing::new(v);
            touched.push(KEY_STREAM_KEY);
        }
        if let Some(v) = self.control_plane_address {
            cfg.control_plane_address = v;
            touched.push(KEY_ADDRESS);
        }
        if let Some(v) = self.control_plane_credential {
            cfg.control_plane_credential = Zeroizing::new(v);
            touched.push(KEY_PASSWORD);
        }
        if let Some(v) = self.scene_target {
            cfg.scene_target = v.filter(|s| !s.is_empty());
            touched.push(KEY_SCENE_TARGET);
        }
        if let Some(v) = self.text_target {
            cfg.text_target = v.filter(|s| !s.is_empty());
            touched.push(KEY_TEXT_TARGET);
        }
        if let Some(v) = self.revert_delay_ms {
            cfg.revert_delay_ms = v;
            touched.push(KEY_REVERT_DELAY);
        }
        touched
    }
}

/// Background save started by `update`/`persist`. Dropping it does not
/// cancel the write.
pub struct PersistHandle(Option<JoinHandle<()>>);

impl PersistHandle {
    pub async fn wait(self) {
        if let Some(handle) = self.0 {
            let _ = handle.await;
        }
    }
}

/// Owns the live `AutomationConfig` and mirrors changes into the settings
/// port. Writes are last-write-wins.
pub struct ConfigStore {
    config: RwLock<AutomationConfig>,
    settings: Arc<dyn SettingsPort>,
    log: Arc<dyn LogPort>,
}

impl ConfigStore {
    pub fn load(settings: Arc<dyn SettingsPort>, log: Arc<dyn LogPort>) -> Self {
        let config = AutomationConfig::load(settings.as_ref());
        Self {
            config: RwLock::new(config),
            settings,
            log,
        }
    }

    pub fn snapshot(&self) -> AutomationConfig {
        self.config
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn scene_target(&self) -> Option<String> {
        self.snapshot().scene_target
    }

    pub fn text_target(&self) -> Option<String> {
        self.snapshot().text_target
    }

    pub fn revert_delay_ms(&self) -> u64 {
        self.snapshot().revert_delay_ms
    }

    /// Mutate without persisting.
    pub fn stage(&self, patch: ConfigPatch) {
        let mut g = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        patch.apply(&mut g);
    }

    /// Mutate, then persist the touched keys in the background.
    pub fn update(&self, patch: ConfigPatch) -> PersistHandle {
        let touched = {
            let mut g = self
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            patch.apply(&mut g)
        };
        self.persist(&touched)
    }

    /// Write the current values of `keys` to settings and save in the
    /// background. Failures are logged, never returned.
    pub fn persist(&self, keys: &[&str]) -> PersistHandle {
        if keys.is_empty() {
            return PersistHandle(None);
        }
        let cfg = self.snapshot();
        for key in keys {
            self.settings.set(key, cfg.value_for(key));
        }

        let settings = Arc::clone(&self.settings);
        let log = Arc::clone(&self.log);
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = settings.save() {
                report_save_failure(log.as_ref(), &e.to_string());
            }
            return PersistHandle(None);
        };
        let handle = rt.spawn(async move {
            let result = tokio::task::spawn_blocking(move || settings.save()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report_save_failure(log.as_ref(), &e.to_string()),
                Err(e) => report_save_failure(log.as_ref(), &e.to_string()),
            }
        });
        PersistHandle(Some(handle))
    }
}

fn report_save_failure(log: &dyn LogPort, reason: &str) {
    tracing::warn!("settings save failed: {reason}");
    log.append(&format!("Failed to save settings: {reason}"));
}
