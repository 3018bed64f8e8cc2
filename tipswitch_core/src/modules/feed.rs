use crate::modules::connection::{
    send_json, within, ConnectionCell, ConnectionState, WsStream, HANDSHAKE_TIMEOUT,
};
use crate::modules::error::ConnectError;
use crate::modules::ports::{LogPort, NotificationPort};
use crate::modules::resolver::{ChannelResolver, HttpChannelResolver};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tipswitch_protocol::feed::{channel_name, classify, DonationPayload, FeedCommand, FeedMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_SOCKET_URL: &str =
    "wss://socket.trakteer.id/app/2ae25d102cc6cd41100a?protocol=7&client=js&version=5.1.1&flash=false";
const DEFAULT_LOOKUP_URL: &str = "https://trakteer.id/";

#[derive(Debug, Clone)]
pub struct FeedEndpoint {
    pub socket_url: String,
    pub lookup_url: String,
    /// The first prefix is the live channel; its subscription ack completes
    /// the handshake. The rest (the dashboard test channel) are best-effort.
    pub channel_prefixes: Vec<String>,
}

impl Default for FeedEndpoint {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            channel_prefixes: vec![
                "creator-stream".to_string(),
                "creator-stream-test".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationEvent {
    pub supporter_name: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

impl DonationEvent {
    pub fn new(supporter_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            supporter_name: supporter_name.into(),
            message: message.into(),
            received_at: Utc::now(),
        }
    }

    fn from_payload(payload: DonationPayload) -> Self {
        Self::new(
            payload.supporter_name,
            payload.supporter_message.unwrap_or_default(),
        )
    }
}

/// Receiving end of a feed subscription. Survives reconnects; dropping it
/// detaches from the client.
pub struct DonationSubscription {
    rx: mpsc::UnboundedReceiver<DonationEvent>,
}

impl DonationSubscription {
    /// `None` once the client has been dropped.
    pub async fn recv(&mut self) -> Option<DonationEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DonationEvent> {
        self.rx.try_recv().ok()
    }
}

struct FeedSession {
    generation: u64,
    shutdown: oneshot::Sender<()>,
}

struct Shared {
    state: ConnectionCell,
    session: Mutex<Option<FeedSession>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DonationEvent>>>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
}

impl Shared {
    fn session_slot(&self) -> MutexGuard<'_, Option<FeedSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear_session(&self, generation: u64) {
        let mut slot = self.session_slot();
        if slot.as_ref().map(|s| s.generation) == Some(generation) {
            *slot = None;
        }
    }

    fn publish(&self, event: DonationEvent) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Handles one inbound text frame; returns a reply to send, if any.
    fn dispatch(&self, text: &str) -> Option<FeedCommand> {
        match classify(text) {
            Ok(FeedMessage::Donation { payload, .. }) => {
                let event = DonationEvent::from_payload(payload);
                self.log
                    .append(&format!("New donation from {}!", event.supporter_name));
                self.log.append(&format!("Message: {}", event.message));
                self.publish(event);
                None
            }
            Ok(FeedMessage::Ping) => Some(FeedCommand::pong()),
            Ok(FeedMessage::Error { code, message }) => {
                tracing::warn!(?code, "feed error: {message}");
                self.log.append(&format!("Trakteer client error: {message}"));
                None
            }
            Ok(other) => {
                tracing::trace!(?other, "ignoring feed traffic");
                None
            }
            Err(e) => {
                tracing::warn!("dropping malformed feed message: {e}");
                self.log
                    .append(&format!("Dropped malformed feed message: {e}"));
                None
            }
        }
    }
}

/// Live subscription to one creator's donation channel.
///
/// There is no automatic reconnect: an unsolicited close leaves the client
/// `Disconnected` until the host calls `connect` again.
pub struct DonationFeedClient {
    shared: Arc<Shared>,
    endpoint: FeedEndpoint,
    resolver: Arc<dyn ChannelResolver>,
}

impl DonationFeedClient {
    pub fn new(
        endpoint: FeedEndpoint,
        resolver: Arc<dyn ChannelResolver>,
        log: Arc<dyn LogPort>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: ConnectionCell::new(),
                session: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                log,
                notifier,
            }),
            endpoint,
            resolver,
        }
    }

    pub fn with_http_resolver(
        endpoint: FeedEndpoint,
        log: Arc<dyn LogPort>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        let prefix = endpoint
            .channel_prefixes
            .first()
            .cloned()
            .unwrap_or_default();
        let resolver = Arc::new(HttpChannelResolver::new(endpoint.lookup_url.clone(), prefix));
        Self::new(endpoint, resolver, log, notifier)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> DonationSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        DonationSubscription { rx }
    }

    /// No-op while already `Connecting` or `Connected`.
    pub async fn connect(&self, page_id: &str, stream_key: &str) -> Result<(), ConnectError> {
        let Some(generation) = self.shared.state.begin_connect() else {
            return Ok(());
        };
        self.shared.log.append("Connecting to Trakteer...");

        let mut socket = match self.establish(page_id, stream_key).await {
            Ok(socket) => socket,
            Err(e) => {
                if self.shared.state.mark_disconnected(generation) {
                    tracing::warn!("feed connect failed: {e}");
                    self.shared.log.append(&format!("Error: {e}"));
                    self.shared
                        .notifier
                        .notify("Failed to connect to Trakteer", Some(&e.to_string()));
                }
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connected = {
            let mut slot = self.shared.session_slot();
            if self.shared.state.mark_connected(generation) {
                *slot = Some(FeedSession {
                    generation,
                    shutdown: shutdown_tx,
                });
                true
            } else {
                false
            }
        };
        if !connected {
            let _ = socket.close(None).await;
            return Err(ConnectError::Cancelled);
        }

        self.shared
            .log
            .append("Successfully connected to Trakteer stream.");
        self.shared.notifier.notify(
            "Trakteer Connected",
            Some("Successfully connected to the Trakteer donation stream."),
        );
        tokio::spawn(run_session(
            socket,
            shutdown_rx,
            Arc::clone(&self.shared),
            generation,
        ));
        Ok(())
    }

    /// Idempotent.
    pub fn disconnect(&self) {
        let Some(prev) = self.shared.state.disconnect() else {
            return;
        };
        if let Some(session) = self.shared.session_slot().take() {
            let _ = session.shutdown.send(());
        }
        match prev {
            ConnectionState::Connected => {
                self.shared.log.append("Disconnected from Trakteer.");
                self.shared.notifier.notify(
                    "Trakteer Disconnected",
                    Some("The connection to the Trakteer stream has been closed."),
                );
            }
            ConnectionState::Connecting => self.shared.log.append("Connection aborted."),
            ConnectionState::Disconnected => {}
        }
    }

    async fn establish(&self, page_id: &str, stream_key: &str) -> Result<WsStream, ConnectError> {
        if page_id.trim().is_empty() || stream_key.trim().is_empty() {
            return Err(ConnectError::Auth(
                "Page ID and Stream API Key are required.".to_string(),
            ));
        }

        let id = self.resolver.resolve(page_id, stream_key).await?;
        let channels: Vec<String> = self
            .endpoint
            .channel_prefixes
            .iter()
            .map(|prefix| channel_name(prefix, &id, stream_key))
            .collect();
        let Some(primary) = channels.first().cloned() else {
            return Err(ConnectError::Transport(
                "no feed channel prefixes configured".to_string(),
            ));
        };

        let connecting = tokio_tungstenite::connect_async(self.endpoint.socket_url.as_str());
        let (mut socket, _) = within(HANDSHAKE_TIMEOUT, connecting)
            .await
            .ok_or_else(|| ConnectError::Transport("feed connect timed out".to_string()))?
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let handshake = subscribe_channels(&mut socket, &channels, &primary);
        match within(HANDSHAKE_TIMEOUT, handshake).await {
            Some(Ok(())) => Ok(socket),
            Some(Err(e)) => {
                let _ = socket.close(None).await;
                Err(e)
            }
            None => {
                let _ = socket.close(None).await;
                Err(ConnectError::Transport(
                    "no subscription acknowledgement from feed".to_string(),
                ))
            }
        }
    }
}

impl Drop for DonationFeedClient {
    fn drop(&mut self) {
        if let Some(session) = self.shared.session_slot().take() {
            let _ = session.shutdown.send(());
        }
    }
}

async fn next_message(socket: &mut WsStream) -> Result<FeedMessage, ConnectError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match classify(text.as_str()) {
                Ok(msg) => return Ok(msg),
                Err(e) => tracing::warn!("malformed feed message during handshake: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectError::Transport(
                    "feed closed the connection during handshake".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
        }
    }
}

async fn subscribe_channels(
    socket: &mut WsStream,
    channels: &[String],
    primary: &str,
) -> Result<(), ConnectError> {
    loop {
        match next_message(socket).await? {
            FeedMessage::ConnectionEstablished { socket_id, .. } => {
                tracing::debug!(%socket_id, "feed socket established");
                break;
            }
            FeedMessage::Error { message, .. } => return Err(ConnectError::Transport(message)),
            _ => {}
        }
    }

    for channel in channels {
        send_json(socket, &FeedCommand::subscribe(channel))
            .await
            .map_err(ConnectError::Transport)?;
    }

    loop {
        match next_message(socket).await? {
            FeedMessage::SubscriptionSucceeded { channel } if channel == primary => return Ok(()),
            FeedMessage::SubscriptionSucceeded { channel } => {
                tracing::debug!(%channel, "subscribed to secondary channel");
            }
            FeedMessage::Error { message, .. } => return Err(ConnectError::Auth(message)),
            FeedMessage::Ping => {
                send_json(socket, &FeedCommand::pong())
                    .await
                    .map_err(ConnectError::Transport)?;
            }
            _ => {}
        }
    }
}

async fn run_session(
    mut socket: WsStream,
    mut shutdown: oneshot::Receiver<()>,
    shared: Arc<Shared>,
    generation: u64,
) {
    let mut heartbeat = time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let lost: Option<String> = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = socket.close(None).await;
                break None;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_json(&mut socket, &FeedCommand::ping()).await {
                    break Some(e);
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = shared.dispatch(text.as_str()) {
                            if let Err(e) = send_json(&mut socket, &reply).await {
                                break Some(e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Some("connection closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                }
            }
        }
    };

    if let Some(reason) = lost {
        if shared.state.mark_disconnected(generation) {
            shared.clear_session(generation);
            tracing::warn!("feed connection lost: {reason}");
            shared
                .log
                .append(&format!("Trakteer connection lost: {reason}"));
            shared.notifier.notify(
                "Trakteer Disconnected",
                Some("The connection to the Trakteer stream was lost."),
            );
        }
    }
}
