use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Event name the feed uses for a supporter donation notification.
pub const DONATION_EVENT: &str = "Illuminate\\Notifications\\Events\\BroadcastNotificationCreated";

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DonationPayload {
    pub supporter_name: String,
    #[serde(default)]
    pub supporter_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: Option<u64>,
    },
    SubscriptionSucceeded {
        channel: String,
    },
    Ping,
    Pong,
    Error {
        code: Option<u16>,
        message: String,
    },
    Donation {
        channel: Option<String>,
        payload: DonationPayload,
    },
    /// Any other channel traffic. Ignored by consumers.
    Other {
        event: String,
    },
}

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("invalid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct EstablishedData {
    socket_id: String,
    #[serde(default)]
    activity_timeout: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Pusher double-encodes most payloads: `data` is usually a JSON string
/// holding the real object.
fn decode_data<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    match data {
        Value::String(s) => serde_json::from_str(&s),
        other => serde_json::from_value(other),
    }
}

pub fn classify(text: &str) -> Result<FeedMessage, FeedParseError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(FeedParseError::Envelope)?;
    let payload_err = |source| FeedParseError::Payload {
        event: envelope.event.clone(),
        source,
    };

    let msg = match envelope.event.as_str() {
        CONNECTION_ESTABLISHED => {
            let d: EstablishedData = decode_data(envelope.data.clone()).map_err(payload_err)?;
            FeedMessage::ConnectionEstablished {
                socket_id: d.socket_id,
                activity_timeout: d.activity_timeout,
            }
        }
        SUBSCRIPTION_SUCCEEDED => FeedMessage::SubscriptionSucceeded {
            channel: envelope.channel.clone().unwrap_or_default(),
        },
        PING => FeedMessage::Ping,
        PONG => FeedMessage::Pong,
        ERROR => {
            let d: ErrorData = decode_data(envelope.data.clone()).map_err(payload_err)?;
            FeedMessage::Error {
                code: d.code,
                message: d.message.unwrap_or_default(),
            }
        }
        DONATION_EVENT => {
            let payload: DonationPayload =
                decode_data(envelope.data.clone()).map_err(payload_err)?;
            FeedMessage::Donation {
                channel: envelope.channel.clone(),
                payload,
            }
        }
        other => FeedMessage::Other {
            event: other.to_string(),
        },
    };
    Ok(msg)
}

/// `{prefix}.{resolved_id}.{stream_key}`
pub fn channel_name(prefix: &str, resolved_id: &str, stream_key: &str) -> String {
    format!("{prefix}.{resolved_id}.{stream_key}")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedCommand {
    pub event: String,
    pub data: Value,
}

impl FeedCommand {
    pub fn subscribe(channel: &str) -> Self {
        Self {
            event: SUBSCRIBE.to_string(),
            data: json!({ "auth": "", "channel": channel }),
        }
    }

    /// Keep-alive. The payload is always an empty object.
    pub fn ping() -> Self {
        Self {
            event: PING.to_string(),
            data: json!({}),
        }
    }

    pub fn pong() -> Self {
        Self {
            event: PONG.to_string(),
            data: json!({}),
        }
    }

    pub fn subscribed_channel(&self) -> Option<&str> {
        if self.event != SUBSCRIBE {
            return None;
        }
        self.data.get("channel").and_then(Value::as_str)
    }
}
