use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
}

pub const RPC_VERSION: u32 = 1;
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4009;
pub const STATUS_SUCCESS: u16 = 100;

/// Every obs-websocket message is `{"op": <u8>, "d": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObsFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl ObsFrame {
    pub fn new<T: Serialize>(op: u8, d: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(d)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.d)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HelloData {
    #[serde(default)]
    pub obs_web_socket_version: String,
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyData {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    #[serde(default)]
    pub event_subscriptions: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiedData {
    pub negotiated_rpc_version: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub request_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestStatus {
    pub result: bool,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponseData {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

/// The subset of obs-websocket requests the engine issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObsRequest {
    GetSceneList,
    GetCurrentProgramScene,
    SetCurrentProgramScene { scene_name: String },
    GetInputKindList,
    GetInputList { input_kind: Option<String> },
    SetInputSettings { input_name: String, text: String },
}

impl ObsRequest {
    pub fn request_type(&self) -> &'static str {
        match self {
            ObsRequest::GetSceneList => "GetSceneList",
            ObsRequest::GetCurrentProgramScene => "GetCurrentProgramScene",
            ObsRequest::SetCurrentProgramScene { .. } => "SetCurrentProgramScene",
            ObsRequest::GetInputKindList => "GetInputKindList",
            ObsRequest::GetInputList { .. } => "GetInputList",
            ObsRequest::SetInputSettings { .. } => "SetInputSettings",
        }
    }

    pub fn request_data(&self) -> Option<Value> {
        match self {
            ObsRequest::GetSceneList
            | ObsRequest::GetCurrentProgramScene
            | ObsRequest::GetInputKindList => None,
            ObsRequest::SetCurrentProgramScene { scene_name } => {
                Some(json!({ "sceneName": scene_name }))
            }
            ObsRequest::GetInputList { input_kind } => input_kind
                .as_ref()
                .map(|kind| json!({ "inputKind": kind })),
            ObsRequest::SetInputSettings { input_name, text } => Some(json!({
                "inputName": input_name,
                "inputSettings": { "text": text },
            })),
        }
    }

    pub fn to_frame(&self, request_id: &str) -> Result<ObsFrame, serde_json::Error> {
        ObsFrame::new(
            op::REQUEST,
            &RequestData {
                request_type: self.request_type().to_string(),
                request_id: request_id.to_string(),
                request_data: self.request_data(),
            },
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SceneEntry {
    pub scene_name: String,
    #[serde(default)]
    pub scene_index: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SceneList {
    #[serde(default)]
    pub current_program_scene_name: Option<String>,
    #[serde(default)]
    pub scenes: Vec<SceneEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CurrentProgramScene {
    pub current_program_scene_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InputKindList {
    #[serde(default)]
    pub input_kinds: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub input_name: String,
    pub input_kind: String,
    #[serde(default)]
    pub unversioned_input_kind: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InputList {
    #[serde(default)]
    pub inputs: Vec<InputEntry>,
}

/// Salted challenge response for `Identify`:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// Case-insensitive "text" substring match on an input kind.
pub fn is_text_kind(kind: &str) -> bool {
    kind.to_ascii_lowercase().contains("text")
}
