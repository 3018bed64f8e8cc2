//! Seams to the host application. Settings storage, notification delivery
//! and the audit log sink are owned by the host; the engine only calls
//! through these traits.

use crate::modules::error::SettingsError;
use serde_json::Value;

pub trait SettingsPort: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn save(&self) -> Result<(), SettingsError>;
}

/// Best-effort. Implementations must swallow their own failures.
pub trait NotificationPort: Send + Sync {
    fn notify(&self, title: &str, body: Option<&str>);
}

/// Ordered, append-only.
pub trait LogPort: Send + Sync {
    fn append(&self, text: &str);
}

/// Notification sink that only writes a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationPort for TracingNotifier {
    fn notify(&self, title: &str, body: Option<&str>) {
        match body {
            Some(body) => tracing::info!(target: "tipswitch::notify", "{title}: {body}"),
            None => tracing::info!(target: "tipswitch::notify", "{title}"),
        }
    }
}
