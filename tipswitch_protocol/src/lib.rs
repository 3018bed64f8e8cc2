//! Wire types for the two endpoints the automation engine talks to: the
//! donation feed (a Pusher-style channel socket) and the OBS control plane
//! (obs-websocket v5).

pub mod feed;
pub mod obs;

pub use feed::{
    channel_name, classify, DonationPayload, FeedCommand, FeedMessage, FeedParseError,
    DONATION_EVENT,
};
pub use obs::{
    auth_response, is_text_kind, HelloData, IdentifiedData, IdentifyData, ObsFrame, ObsRequest,
    RequestResponseData, RequestStatus,
};
