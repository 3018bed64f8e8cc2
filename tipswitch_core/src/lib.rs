pub mod modules;

pub use modules::config::{AutomationConfig, ConfigPatch, ConfigStore, FeedCredentials};
pub use modules::connection::ConnectionState;
pub use modules::control::ControlPlaneClient;
pub use modules::error::{ConnectError, RequestError};
pub use modules::feed::{DonationEvent, DonationFeedClient, DonationSubscription, FeedEndpoint};
pub use modules::orchestrator::{ActionId, AutomationOrchestrator, SceneControl};
pub use modules::ports::{LogPort, NotificationPort, SettingsPort};
pub use modules::session::AutomationSession;
pub use tipswitch_protocol as protocol;
