use crate::modules::connection::{
    send_json, within, ConnectionCell, ConnectionState, WsStream, HANDSHAKE_TIMEOUT,
};
use crate::modules::error::{ConnectError, RequestError};
use crate::modules::ports::{LogPort, NotificationPort};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tipswitch_protocol::obs::{
    self, op, CurrentProgramScene, HelloData, IdentifyData, InputKindList, InputList, ObsFrame,
    ObsRequest, RequestResponseData, SceneList,
};
use tipswitch_protocol::{auth_response, is_text_kind};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Reply = oneshot::Sender<Result<Option<Value>, RequestError>>;

enum Outbound {
    Request { request: ObsRequest, reply: Reply },
    Close,
}

#[derive(Clone)]
struct SessionHandle {
    generation: u64,
    tx: mpsc::Sender<Outbound>,
    timeout: Duration,
}

impl SessionHandle {
    async fn call(&self, request: ObsRequest) -> Result<Option<Value>, RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outbound::Request { request, reply })
            .await
            .map_err(|_| RequestError::Transport("control plane session ended".to_string()))?;
        match within(self.timeout, rx).await {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(RequestError::Transport(
                "control plane session ended".to_string(),
            )),
            None => Err(RequestError::Timeout),
        }
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: ObsRequest) -> Result<T, RequestError> {
        let data = self.call(request).await?.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| RequestError::Decode(e.to_string()))
    }
}

/// Cached target sets. Refreshed once per successful connect (or on
/// demand); stale in between.
#[derive(Debug, Clone, Default)]
pub struct TargetSnapshot {
    pub scenes: Vec<String>,
    pub text_inputs: Vec<String>,
}

struct Shared {
    state: ConnectionCell,
    session: Mutex<Option<SessionHandle>>,
    targets: RwLock<TargetSnapshot>,
    request_timeout: Duration,
    in_flight: AtomicUsize,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
}

impl Shared {
    fn session_slot(&self) -> MutexGuard<'_, Option<SessionHandle>> {
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

    fn store_targets(&self, targets: TargetSnapshot) {
        *self
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = targets;
    }
}

/// Request/response client for OBS over obs-websocket v5.
pub struct ControlPlaneClient {
    shared: Arc<Shared>,
}

impl ControlPlaneClient {
    pub fn new(log: Arc<dyn LogPort>, notifier: Arc<dyn NotificationPort>) -> Self {
        Self::with_request_timeout(log, notifier, REQUEST_TIMEOUT)
    }

    /// Like `new`, with a custom acknowledgement deadline per command.
    pub fn with_request_timeout(
        log: Arc<dyn LogPort>,
        notifier: Arc<dyn NotificationPort>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: ConnectionCell::new(),
                session: Mutex::new(None),
                targets: RwLock::new(TargetSnapshot::default()),
                request_timeout,
                in_flight: AtomicUsize::new(0),
                log,
                notifier,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn targets(&self) -> TargetSnapshot {
        self.shared
            .targets
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn scene_targets(&self) -> Vec<String> {
        self.targets().scenes
    }

    pub fn text_targets(&self) -> Vec<String> {
        self.targets().text_inputs
    }

    /// Requests sent and still awaited by a caller.
    pub fn in_flight_requests(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Opens the socket, authenticates, and discovers targets. Only then is
    /// the client `Connected`. No-op while already connecting or connected.
    pub async fn connect(&self, address: &str, credential: &str) -> Result<(), ConnectError> {
        let Some(generation) = self.shared.state.begin_connect() else {
            return Ok(());
        };
        self.shared.log.append("Connecting to OBS...");

        match self.establish(address, credential, generation).await {
            Ok(()) => {
                let t = self.targets();
                self.shared.log.append(&format!(
                    "Connected to OBS. {} scene(s), {} text source(s).",
                    t.scenes.len(),
                    t.text_inputs.len()
                ));
                self.shared.notifier.notify(
                    "Connected to OBS",
                    Some("Successfully connected to the OBS WebSocket."),
                );
                Ok(())
            }
            Err(e) => {
                if let Some(handle) = self.take_session_if(generation) {
                    let _ = handle.tx.try_send(Outbound::Close);
                }
                if self.shared.state.mark_disconnected(generation) {
                    tracing::warn!("control plane connect failed: {e}");
                    self.shared
                        .log
                        .append(&format!("Failed to connect to OBS: {e}"));
                    self.shared
                        .notifier
                        .notify("Failed to connect to OBS", Some(&e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        address: &str,
        credential: &str,
        generation: u64,
    ) -> Result<(), ConnectError> {
        let url = Url::parse(address).map_err(|e| ConnectError::InvalidAddress(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectError::InvalidAddress(format!(
                "expected ws:// or wss://, got {address}"
            )));
        }

        let (mut socket, _) = within(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .ok_or_else(|| ConnectError::Transport("OBS connect timed out".to_string()))?
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        match within(HANDSHAKE_TIMEOUT, identify(&mut socket, credential)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                let _ = socket.close(None).await;
                return Err(e);
            }
            None => {
                let _ = socket.close(None).await;
                return Err(ConnectError::Transport(
                    "OBS did not complete the handshake".to_string(),
                ));
            }
        }

        let (write, read) = socket.split();
        let (tx, rx) = mpsc::channel(32);
        let handle = SessionHandle {
            generation,
            tx,
            timeout: self.shared.request_timeout,
        };
        *self.shared.session_slot() = Some(handle.clone());
        tokio::spawn(run_session(write, read, rx, Arc::clone(&self.shared), generation));

        let targets = match discover_targets(&handle).await {
            Ok(targets) => targets,
            // A disconnect during discovery closes the session under us.
            Err(_) if !self.shared.state.is_current(generation) => {
                return Err(ConnectError::Cancelled)
            }
            Err(e) => {
                return Err(ConnectError::Transport(format!(
                    "target discovery failed: {e}"
                )))
            }
        };
        self.shared.store_targets(targets);

        if !self.shared.state.mark_connected(generation) {
            return Err(ConnectError::Cancelled);
        }
        Ok(())
    }

    fn take_session_if(&self, generation: u64) -> Option<SessionHandle> {
        let mut slot = self.shared.session_slot();
        if slot.as_ref().map(|s| s.generation) == Some(generation) {
            slot.take()
        } else {
            None
        }
    }

    /// Idempotent.
    pub fn disconnect(&self) {
        let Some(prev) = self.shared.state.disconnect() else {
            return;
        };
        if let Some(handle) = self.shared.session_slot().take() {
            let _ = handle.tx.try_send(Outbound::Close);
        }
        match prev {
            ConnectionState::Connected => {
                self.shared.log.append("Disconnected from OBS.");
                self.shared.notifier.notify(
                    "Disconnected from OBS",
                    Some("The connection to the OBS WebSocket has been closed."),
                );
            }
            ConnectionState::Connecting => self.shared.log.append("OBS connection aborted."),
            ConnectionState::Disconnected => {}
        }
    }

    fn connected_session(&self) -> Result<SessionHandle, RequestError> {
        if !self.shared.state.is_connected() {
            return Err(RequestError::NotConnected);
        }
        self.shared
            .session_slot()
            .clone()
            .ok_or(RequestError::NotConnected)
    }

    /// Raw request. Fails fast with `NotConnected`; nothing is queued.
    pub async fn call(&self, request: ObsRequest) -> Result<Option<Value>, RequestError> {
        self.connected_session()?.call(request).await
    }

    pub async fn current_scene(&self) -> Result<String, RequestError> {
        let scene: CurrentProgramScene = self
            .connected_session()?
            .call_typed(ObsRequest::GetCurrentProgramScene)
            .await?;
        Ok(scene.current_program_scene_name)
    }

    /// Resolves on acknowledgement, not on visible transition.
    pub async fn set_scene(&self, scene_name: &str) -> Result<(), RequestError> {
        self.call(ObsRequest::SetCurrentProgramScene {
            scene_name: scene_name.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn set_text_content(&self, input_name: &str, text: &str) -> Result<(), RequestError> {
        self.call(ObsRequest::SetInputSettings {
            input_name: input_name.to_string(),
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn refresh_targets(&self) -> Result<TargetSnapshot, RequestError> {
        let targets = discover_targets(&self.connected_session()?).await?;
        self.shared.store_targets(targets.clone());
        Ok(targets)
    }
}

impl Drop for ControlPlaneClient {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.session_slot().take() {
            let _ = handle.tx.try_send(Outbound::Close);
        }
    }
}

async fn next_frame(socket: &mut WsStream) -> Result<ObsFrame, ConnectError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| ConnectError::Transport(format!("bad frame from OBS: {e}")))
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                if code == Some(obs::CLOSE_AUTHENTICATION_FAILED) {
                    return Err(ConnectError::Auth("OBS rejected the password".to_string()));
                }
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "connection closed".to_string());
                return Err(ConnectError::Transport(reason));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
            None => {
                return Err(ConnectError::Transport(
                    "OBS closed the connection during handshake".to_string(),
                ))
            }
        }
    }
}

async fn identify(socket: &mut WsStream, credential: &str) -> Result<(), ConnectError> {
    let hello = next_frame(socket).await?;
    if hello.op != op::HELLO {
        return Err(ConnectError::Transport(format!(
            "expected Hello, got op {}",
            hello.op
        )));
    }
    let hello: HelloData = hello
        .decode()
        .map_err(|e| ConnectError::Transport(format!("bad Hello: {e}")))?;
    tracing::debug!(version = %hello.obs_web_socket_version, "obs hello");

    let authentication = hello
        .authentication
        .as_ref()
        .map(|a| auth_response(credential, &a.salt, &a.challenge));
    let identify = ObsFrame::new(
        op::IDENTIFY,
        &IdentifyData {
            rpc_version: obs::RPC_VERSION,
            authentication,
            event_subscriptions: 0,
        },
    )
    .map_err(|e| ConnectError::Transport(e.to_string()))?;
    send_json(socket, &identify)
        .await
        .map_err(ConnectError::Transport)?;

    loop {
        let frame = next_frame(socket).await?;
        if frame.op == op::IDENTIFIED {
            return Ok(());
        }
    }
}

async fn discover_targets(session: &SessionHandle) -> Result<TargetSnapshot, RequestError> {
    let scene_list: SceneList = session.call_typed(ObsRequest::GetSceneList).await?;
    let scenes = scene_list.scenes.into_iter().map(|s| s.scene_name).collect();

    let kinds: InputKindList = session.call_typed(ObsRequest::GetInputKindList).await?;
    let mut text_inputs: Vec<String> = Vec::new();
    for kind in kinds.input_kinds.into_iter().filter(|k| is_text_kind(k)) {
        let list: InputList = session
            .call_typed(ObsRequest::GetInputList {
                input_kind: Some(kind),
            })
            .await?;
        for input in list.inputs {
            if is_text_kind(&input.input_kind) && !text_inputs.contains(&input.input_name) {
                text_inputs.push(input.input_name);
            }
        }
    }

    Ok(TargetSnapshot {
        scenes,
        text_inputs,
    })
}

fn request_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn into_result(resp: RequestResponseData) -> Result<Option<Value>, RequestError> {
    if resp.request_status.result {
        Ok(resp.response_data)
    } else {
        Err(RequestError::Command {
            code: resp.request_status.code,
            comment: resp
                .request_status
                .comment
                .unwrap_or_else(|| resp.request_type.clone()),
        })
    }
}

async fn run_session(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    generation: u64,
) {
    let mut pending: HashMap<String, Reply> = HashMap::new();

    let lost: Option<String> = loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Outbound::Request { request, reply }) => {
                        let id = request_id();
                        let frame = match request.to_frame(&id) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = reply.send(Err(RequestError::Decode(e.to_string())));
                                continue;
                            }
                        };
                        if let Err(e) = send_json(&mut write, &frame).await {
                            let _ = reply.send(Err(RequestError::Transport(e.clone())));
                            break Some(e);
                        }
                        pending.retain(|_, r| !r.is_closed());
                        pending.insert(id, reply);
                        shared.in_flight.store(pending.len(), Ordering::Relaxed);
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break None;
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ObsFrame = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!("ignoring malformed OBS frame: {e}");
                                continue;
                            }
                        };
                        if frame.op != op::REQUEST_RESPONSE {
                            continue;
                        }
                        match frame.decode::<RequestResponseData>() {
                            Ok(resp) => {
                                let reply = pending.remove(&resp.request_id);
                                // Callers that timed out have dropped their receiver.
                                pending.retain(|_, r| !r.is_closed());
                                shared.in_flight.store(pending.len(), Ordering::Relaxed);
                                if let Some(reply) = reply {
                                    let _ = reply.send(into_result(resp));
                                }
                            }
                            Err(e) => tracing::warn!("ignoring malformed OBS response: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .filter(|f| f.code != CloseCode::Normal || !f.reason.as_str().is_empty())
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "connection closed by OBS".to_string());
                        break Some(reason);
                    }
                    None => break Some("connection closed by OBS".to_string()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                }
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RequestError::Transport(
            "connection closed before response".to_string(),
        )));
    }
    shared.in_flight.store(0, Ordering::Relaxed);

    if let Some(reason) = lost {
        if shared.state.mark_disconnected(generation) {
            shared.clear_session(generation);
            tracing::warn!("control plane connection lost: {reason}");
            shared
                .log
                .append(&format!("Lost connection to OBS: {reason}"));
            shared.notifier.notify("Disconnected from OBS", Some(&reason));
        } else {
            shared.clear_session(generation);
        }
    }
}
