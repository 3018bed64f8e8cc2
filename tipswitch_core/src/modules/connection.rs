use futures_util::SinkExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Upper bound for opening a socket and for each protocol handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

struct CellInner {
    state: ConnectionState,
    generation: u64,
}

/// Connection state plus a generation counter.
///
/// Every `begin_connect` and every `disconnect` bumps the generation, so a
/// session task that outlives its connection (a late close, a handshake that
/// finishes after the user hit disconnect) can only touch the state if it
/// still owns the current generation.
pub struct ConnectionCell {
    inner: Mutex<CellInner>,
    watch: watch::Sender<ConnectionState>,
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCell {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Mutex::new(CellInner {
                state: ConnectionState::Disconnected,
                generation: 0,
            }),
            watch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: ConnectionState) {
        self.watch.send_replace(state);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch.subscribe()
    }

    /// Returns `None` when already `Connecting` or `Connected`.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut g = self.lock();
        if g.state != ConnectionState::Disconnected {
            return None;
        }
        g.generation += 1;
        g.state = ConnectionState::Connecting;
        self.publish(g.state);
        Some(g.generation)
    }

    pub fn mark_connected(&self, generation: u64) -> bool {
        let mut g = self.lock();
        if g.generation != generation || g.state != ConnectionState::Connecting {
            return false;
        }
        g.state = ConnectionState::Connected;
        self.publish(g.state);
        true
    }

    /// Whether `generation` is still the live connect attempt or session.
    pub fn is_current(&self, generation: u64) -> bool {
        let g = self.lock();
        g.generation == generation && g.state != ConnectionState::Disconnected
    }

    /// Transport-level end of the given generation. No-op if a newer
    /// connect or an explicit disconnect already took over.
    pub fn mark_disconnected(&self, generation: u64) -> bool {
        let mut g = self.lock();
        if g.generation != generation || g.state == ConnectionState::Disconnected {
            return false;
        }
        g.state = ConnectionState::Disconnected;
        self.publish(g.state);
        true
    }

    /// User-initiated disconnect. Returns the state it replaced, or `None`
    /// if already disconnected.
    pub fn disconnect(&self) -> Option<ConnectionState> {
        let mut g = self.lock();
        if g.state == ConnectionState::Disconnected {
            return None;
        }
        let prev = g.state;
        g.generation += 1;
        g.state = ConnectionState::Disconnected;
        self.publish(g.state);
        Some(prev)
    }
}

pub async fn send_json<S, T>(sink: &mut S, msg: &T) -> Result<(), String>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(payload.into()))
        .await
        .map_err(|e| e.to_string())
}

/// `None` when the deadline passes first.
pub async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(limit, fut).await.ok()
}
