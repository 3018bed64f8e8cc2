#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tipswitch_core::modules::log::MemoryLog;
use tipswitch_core::modules::ports::NotificationPort;
use tipswitch_protocol::feed::{self, Envelope, FeedCommand};
use tipswitch_protocol::obs::{self, op, IdentifyData, ObsFrame, RequestData};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

#[derive(Default)]
pub struct RecordingNotifier {
    pub titles: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().clone()
    }
}

impl NotificationPort for RecordingNotifier {
    fn notify(&self, title: &str, _body: Option<&str>) {
        self.titles.lock().unwrap().push(title.to_string());
    }
}

pub fn log_contains(log: &MemoryLog, needle: &str) -> bool {
    log.texts().iter().any(|t| t.contains(needle))
}

pub fn count_lines(log: &MemoryLog, needle: &str) -> usize {
    log.texts().iter().filter(|t| t.contains(needle)).count()
}

/// A port with nothing listening on it.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

// ---------------------------------------------------------------- fake OBS

pub const SALT: &str = "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=";
pub const CHALLENGE: &str = "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=";

#[derive(Clone)]
pub struct ObsSetup {
    pub password: Option<String>,
    pub scenes: Vec<String>,
    pub current: String,
    pub input_kinds: Vec<String>,
    pub inputs: Vec<(String, String)>,
    /// Held before every request response.
    pub response_delay: Duration,
    /// Request types that are recorded but never answered.
    pub silent: Vec<String>,
}

impl Default for ObsSetup {
    fn default() -> Self {
        Self {
            password: Some("hunter2".to_string()),
            scenes: vec!["Gameplay".to_string(), "Thanks".to_string()],
            current: "Gameplay".to_string(),
            input_kinds: vec![
                "text_gdi".to_string(),
                "image".to_string(),
                "text_ft2".to_string(),
            ],
            inputs: vec![
                ("Title".to_string(), "text_gdi".to_string()),
                ("Logo".to_string(), "image".to_string()),
            ],
            response_delay: Duration::ZERO,
            silent: Vec::new(),
        }
    }
}

pub struct FakeObs {
    pub address: String,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<(String, Option<Value>)>>>,
    pub current: Arc<Mutex<String>>,
    kick: Arc<watch::Sender<u64>>,
}

impl FakeObs {
    pub fn request_types(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn current_scene(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    /// Drops every connection accepted so far, even one still busy.
    pub fn kick(&self) {
        self.kick.send_modify(|n| *n += 1);
    }
}

pub async fn spawn_fake_obs(setup: ObsSetup) -> FakeObs {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let current = Arc::new(Mutex::new(setup.current.clone()));
    let kick = Arc::new(watch::channel(0u64).0);

    let fake = FakeObs {
        address: format!("ws://{addr}"),
        connections: Arc::clone(&connections),
        requests: Arc::clone(&requests),
        current: Arc::clone(&current),
        kick: Arc::clone(&kick),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            connections.fetch_add(1, Ordering::SeqCst);
            let setup = setup.clone();
            let requests = Arc::clone(&requests);
            let current = Arc::clone(&current);
            let kicked = kick.subscribe();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                serve_obs(ws, setup, requests, current, kicked).await;
            });
        }
    });

    fake
}

async fn send_frame<S>(ws: &mut S, op: u8, d: Value)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(&ObsFrame { op, d }).unwrap();
    let _ = ws.send(Message::Text(text.into())).await;
}

async fn serve_obs(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    setup: ObsSetup,
    requests: Arc<Mutex<Vec<(String, Option<Value>)>>>,
    current: Arc<Mutex<String>>,
    mut kicked: watch::Receiver<u64>,
) {
    let mut hello = json!({ "obsWebSocketVersion": "5.5.0", "rpcVersion": 1 });
    if setup.password.is_some() {
        hello["authentication"] = json!({ "challenge": CHALLENGE, "salt": SALT });
    }
    send_frame(&mut ws, op::HELLO, hello).await;

    let identify: IdentifyData = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: ObsFrame = serde_json::from_str(text.as_str()).unwrap();
                if frame.op == op::IDENTIFY {
                    break frame.decode().unwrap();
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    if let Some(password) = setup.password.as_deref() {
        let expected = tipswitch_protocol::auth_response(password, SALT, CHALLENGE);
        if identify.authentication.as_deref() != Some(expected.as_str()) {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(obs::CLOSE_AUTHENTICATION_FAILED),
                    reason: Utf8Bytes::from_static("Authentication failed."),
                }))
                .await;
            return;
        }
    }
    send_frame(&mut ws, op::IDENTIFIED, json!({ "negotiatedRpcVersion": 1 })).await;

    loop {
        tokio::select! {
            _ = kicked.changed() => {
                let _ = ws.close(None).await;
                return;
            }
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                let frame: ObsFrame = serde_json::from_str(text.as_str()).unwrap();
                if frame.op != op::REQUEST {
                    continue;
                }
                let req: RequestData = frame.decode().unwrap();
                requests
                    .lock()
                    .unwrap()
                    .push((req.request_type.clone(), req.request_data.clone()));
                if setup.silent.contains(&req.request_type) {
                    continue;
                }
                if !setup.response_delay.is_zero() {
                    tokio::time::sleep(setup.response_delay).await;
                }
                let (ok, code, comment, data) = answer(&setup, &current, &req);
                let mut status = json!({ "result": ok, "code": code });
                if let Some(comment) = comment {
                    status["comment"] = json!(comment);
                }
                let mut d = json!({
                    "requestType": req.request_type,
                    "requestId": req.request_id,
                    "requestStatus": status,
                });
                if let Some(data) = data {
                    d["responseData"] = data;
                }
                send_frame(&mut ws, op::REQUEST_RESPONSE, d).await;
            }
        }
    }
}

fn answer(
    setup: &ObsSetup,
    current: &Mutex<String>,
    req: &RequestData,
) -> (bool, u16, Option<&'static str>, Option<Value>) {
    let data = req.request_data.clone().unwrap_or(Value::Null);
    match req.request_type.as_str() {
        "GetSceneList" => {
            let scenes: Vec<Value> = setup
                .scenes
                .iter()
                .enumerate()
                .map(|(i, s)| json!({ "sceneName": s, "sceneIndex": i }))
                .collect();
            let cur = current.lock().unwrap().clone();
            (
                true,
                100,
                None,
                Some(json!({ "currentProgramSceneName": cur, "scenes": scenes })),
            )
        }
        "GetCurrentProgramScene" => {
            let cur = current.lock().unwrap().clone();
            (
                true,
                100,
                None,
                Some(json!({ "currentProgramSceneName": cur, "sceneName": cur })),
            )
        }
        "SetCurrentProgramScene" => {
            let name = data["sceneName"].as_str().unwrap_or_default().to_string();
            if setup.scenes.contains(&name) {
                *current.lock().unwrap() = name;
                (true, 100, None, None)
            } else {
                (false, 600, Some("No source was found by the name of `sceneName`."), None)
            }
        }
        "GetInputKindList" => (
            true,
            100,
            None,
            Some(json!({ "inputKinds": setup.input_kinds })),
        ),
        "GetInputList" => {
            let kind = data["inputKind"].as_str();
            let inputs: Vec<Value> = setup
                .inputs
                .iter()
                .filter(|(_, k)| kind.map_or(true, |want| want == k))
                .map(|(n, k)| json!({ "inputName": n, "inputKind": k, "unversionedInputKind": k }))
                .collect();
            (true, 100, None, Some(json!({ "inputs": inputs })))
        }
        "SetInputSettings" => {
            let name = data["inputName"].as_str().unwrap_or_default();
            if setup.inputs.iter().any(|(n, _)| n == name) {
                (true, 100, None, None)
            } else {
                (false, 600, Some("No source was found by the name of `inputName`."), None)
            }
        }
        _ => (false, 204, Some("Unknown request type."), None),
    }
}

// --------------------------------------------------------------- fake feed

pub struct FakeFeed {
    pub socket_url: String,
    pub connections: Arc<AtomicUsize>,
    pub subscribed: Arc<Mutex<Vec<String>>>,
    pub inbound: Arc<Mutex<Vec<FeedCommand>>>,
    push: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    kick: Arc<watch::Sender<u64>>,
}

impl FakeFeed {
    /// Sends raw text to the most recent connection.
    pub fn push(&self, text: impl Into<String>) {
        if let Some(tx) = self.push.lock().unwrap().as_ref() {
            let _ = tx.send(text.into());
        }
    }

    pub fn push_donation(&self, name: &str, message: &str) {
        let data = json!({ "supporter_name": name, "supporter_message": message }).to_string();
        self.push(
            json!({
                "event": feed::DONATION_EVENT,
                "channel": "creator-stream.42.key",
                "data": data,
            })
            .to_string(),
        );
    }

    pub fn events_received(&self, event: &str) -> Vec<FeedCommand> {
        self.inbound
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.event == event)
            .cloned()
            .collect()
    }

    /// Drops every connection accepted so far, even one still busy.
    pub fn kick(&self) {
        self.kick.send_modify(|n| *n += 1);
    }
}

/// `reject` names a channel whose subscribe is answered with `pusher:error`.
pub async fn spawn_fake_feed(reject: Option<String>) -> FakeFeed {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let subscribed = Arc::new(Mutex::new(Vec::new()));
    let inbound = Arc::new(Mutex::new(Vec::new()));
    let push: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>> = Arc::new(Mutex::new(None));
    let kick = Arc::new(watch::channel(0u64).0);

    let fake = FakeFeed {
        socket_url: format!("ws://{addr}/app/testkey?protocol=7"),
        connections: Arc::clone(&connections),
        subscribed: Arc::clone(&subscribed),
        inbound: Arc::clone(&inbound),
        push: Arc::clone(&push),
        kick: Arc::clone(&kick),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            connections.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            *push.lock().unwrap() = Some(tx);
            let subscribed = Arc::clone(&subscribed);
            let inbound = Arc::clone(&inbound);
            let kicked = kick.subscribe();
            let reject = reject.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                serve_feed(ws, rx, subscribed, inbound, kicked, reject).await;
            });
        }
    });

    fake
}

async fn serve_feed(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut rx: mpsc::UnboundedReceiver<String>,
    subscribed: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Vec<FeedCommand>>>,
    mut kicked: watch::Receiver<u64>,
    reject: Option<String>,
) {
    let established = Envelope {
        event: feed::CONNECTION_ESTABLISHED.to_string(),
        channel: None,
        data: Value::String("{\"socket_id\":\"1.2\",\"activity_timeout\":120}".to_string()),
    };
    let _ = ws
        .send(Message::Text(serde_json::to_string(&established).unwrap().into()))
        .await;

    loop {
        tokio::select! {
            _ = kicked.changed() => {
                let _ = ws.close(None).await;
                return;
            }
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { return };
                if ws.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(cmd) = serde_json::from_str::<FeedCommand>(text.as_str()) else {
                    continue;
                };
                inbound.lock().unwrap().push(cmd.clone());
                if let Some(channel) = cmd.subscribed_channel() {
                    subscribed.lock().unwrap().push(channel.to_string());
                    let reply = if reject.as_deref() == Some(channel) {
                        Envelope {
                            event: feed::ERROR.to_string(),
                            channel: None,
                            data: json!({ "code": 4009, "message": "Subscription rejected" }),
                        }
                    } else {
                        Envelope {
                            event: feed::SUBSCRIPTION_SUCCEEDED.to_string(),
                            channel: Some(channel.to_string()),
                            data: Value::String("{}".to_string()),
                        }
                    };
                    let _ = ws
                        .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                        .await;
                }
            }
        }
    }
}

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
