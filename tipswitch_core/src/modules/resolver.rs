use crate::modules::error::ResolveError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

/// Turns feed credentials into the numeric creator id that channel names
/// are built from.
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    async fn resolve(&self, page_id: &str, stream_key: &str) -> Result<String, ResolveError>;
}

/// Looks the id up from the creator's stream page, which embeds the
/// full `{prefix}.{id}.{key}` channel name.
pub struct HttpChannelResolver {
    client: reqwest::Client,
    base_url: String,
    channel_prefix: String,
}

impl HttpChannelResolver {
    pub fn new(base_url: impl Into<String>, channel_prefix: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            channel_prefix: channel_prefix.into(),
        }
    }

    fn lookup_url(&self, page_id: &str, stream_key: &str) -> Result<Url, ResolveError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ResolveError::Transport(format!("bad lookup url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ResolveError::Transport("lookup url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(page_id)
            .push("stream");
        url.query_pairs_mut().append_pair("key", stream_key);
        Ok(url)
    }
}

#[async_trait]
impl ChannelResolver for HttpChannelResolver {
    async fn resolve(&self, page_id: &str, stream_key: &str) -> Result<String, ResolveError> {
        let url = self.lookup_url(page_id, stream_key)?;
        tracing::debug!(%url, "resolving feed channel");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound);
        }
        if !status.is_success() {
            return Err(ResolveError::Transport(format!(
                "channel lookup returned {status}"
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?;
        extract_channel_id(&body, &self.channel_prefix).ok_or(ResolveError::NotFound)
    }
}

/// Fixed id, for hosts that already know it and for tests.
pub struct StaticResolver {
    id: Option<String>,
}

impl StaticResolver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
        }
    }

    /// Always fails with `NotFound`.
    pub fn rejecting() -> Self {
        Self { id: None }
    }
}

#[async_trait]
impl ChannelResolver for StaticResolver {
    async fn resolve(&self, _page_id: &str, _stream_key: &str) -> Result<String, ResolveError> {
        self.id.clone().ok_or(ResolveError::NotFound)
    }
}

/// Finds the first `{prefix}.{id}.` in `body` and returns `id`.
pub fn extract_channel_id(body: &str, prefix: &str) -> Option<String> {
    let marker = format!("{prefix}.");
    let mut rest = body;
    while let Some(pos) = rest.find(&marker) {
        let after = &rest[pos + marker.len()..];
        let id: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .collect();
        if !id.is_empty() && after[id.len()..].starts_with('.') {
            return Some(id);
        }
        rest = after;
    }
    None
}
