//! HTTP access to the Dispatcharr REST API
//!
//! [`DispatcharrApi`] is the reqwest implementation of the two contracts
//! the pipeline depends on: [`Authenticator`] for the login exchange and
//! [`DataSource`] for the per-tick reads.
//!
//! Endpoints used:
//!
//! | Call | Endpoint |
//! |------|----------|
//! | login | `POST /api/accounts/token/` |
//! | active streams | `GET /proxy/ts/status` |
//! | channel catalogue | `GET /api/channels/channels/` |
//! | program guide | `GET /api/epg/grid/` |
//!
//! The channel catalogue supplies names, numbers, XMLTV ids and logos for
//! the bare channel UUIDs the proxy reports. It is cached and re-read only
//! when an active stream points to a channel we have never seen.

use crate::auth::Authenticator;
use crate::error::{AuthError, FetchError};
use crate::models::{
    ChannelDetails, EpgDataset, EpgGridResponse, LoginResponse, RawStreamRecord,
    StatusChannel, StatusResponse, Token,
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Default timeout for HTTP requests (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default User-Agent
pub const DEFAULT_USER_AGENT: &str = "pmodispatcharr/0.1.0";

const LOGIN_PATH: &str = "/api/accounts/token/";
const STATUS_PATH: &str = "/proxy/ts/status";
const CHANNELS_PATH: &str = "/api/channels/channels/";
const EPG_GRID_PATH: &str = "/api/epg/grid/";

/// Read side of the backend, one call per dataset
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Streams currently served by the proxy
    async fn fetch_active_streams(&self, token: &Token)
        -> Result<Vec<RawStreamRecord>, FetchError>;

    /// Full program guide; only called when the EPG feature is on
    async fn fetch_epg(&self, token: &Token) -> Result<EpgDataset, FetchError>;
}

/// The catalogue endpoint is a plain list, or a DRF page on some versions
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelListResponse {
    Page { results: Vec<ChannelDetails> },
    List(Vec<ChannelDetails>),
}

impl ChannelListResponse {
    fn into_channels(self) -> Vec<ChannelDetails> {
        match self {
            ChannelListResponse::Page { results } => results,
            ChannelListResponse::List(list) => list,
        }
    }
}

/// Dispatcharr HTTP client
pub struct DispatcharrApi {
    client: Client,
    base_url: Url,
    channels: RwLock<HashMap<String, ChannelDetails>>,
    /// Channels still absent after a catalogue refresh; they no longer
    /// trigger one
    missing_channels: RwLock<HashSet<String>>,
}

impl DispatcharrApi {
    /// Create a client with default settings
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        Self::builder(base_url).build()
    }

    /// Create a builder for configuring the client
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of catalogue entries currently cached
    pub async fn cached_channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Number of active channels known to be absent from the catalogue
    pub async fn missing_channel_count(&self) -> usize {
        self.missing_channels.read().await.len()
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }

    /// Public URL of a cached channel logo
    pub fn logo_url(&self, logo_id: &str) -> Option<String> {
        self.endpoint(&format!("/api/channels/logos/{}/cache/", logo_id))
            .ok()
            .map(String::from)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &Token) -> Result<T, FetchError> {
        let url = self
            .endpoint(path)
            .map_err(|e| FetchError::Http(format!("invalid URL for {}: {}", path, e)))?;

        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, FetchError> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Dispatcharr API error ({}): {}", status.as_u16(), error_text);
            return Err(FetchError::from_status_code(status.as_u16(), error_text));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            warn!("Failed to parse response: {}", e);
            FetchError::from(e)
        })
    }

    /// Re-reads the channel catalogue and replaces the cache
    pub async fn refresh_channels(&self, token: &Token) -> Result<usize, FetchError> {
        let list: ChannelListResponse = self.get_json(CHANNELS_PATH, token).await?;
        let channels: HashMap<String, ChannelDetails> = list
            .into_channels()
            .into_iter()
            .map(|c| (c.uuid.clone(), c))
            .collect();
        let count = channels.len();
        *self.channels.write().await = channels;

        info!("Loaded {} channels from the Dispatcharr catalogue", count);
        Ok(count)
    }

    fn join_channel(
        &self,
        channel_id: String,
        status: StatusChannel,
        details: Option<&ChannelDetails>,
    ) -> RawStreamRecord {
        RawStreamRecord {
            channel_id,
            channel_number: details.and_then(|d| d.channel_number.clone()),
            channel_name: details.and_then(|d| d.name.clone()),
            epg_channel_id: details.and_then(|d| d.tvg_id.clone()),
            stream_name: status.stream_name,
            logo_url: details
                .and_then(|d| d.logo_id.as_deref())
                .and_then(|id| self.logo_url(id)),
            client_count: status.client_count,
            resolution: status.resolution,
            source_fps: status.source_fps,
            video_codec: status.video_codec,
            audio_codec: status.audio_codec,
            avg_bitrate: status.avg_bitrate,
        }
    }
}

#[async_trait]
impl Authenticator for DispatcharrApi {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let url = self
            .endpoint(LOGIN_PATH)
            .map_err(|e| AuthError::Transport(format!("invalid login URL: {}", e)))?;

        let body = serde_json::json!({ "username": username, "password": password });
        let response = self.client.post(url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AuthError::from_status_code(status.as_u16(), error_text));
        }

        response
            .json::<LoginResponse>()
            .await
            .map_err(|e| AuthError::Transport(format!("unreadable login response: {}", e)))
    }
}

#[async_trait]
impl DataSource for DispatcharrApi {
    async fn fetch_active_streams(
        &self,
        token: &Token,
    ) -> Result<Vec<RawStreamRecord>, FetchError> {
        let status: StatusResponse = self.get_json(STATUS_PATH, token).await?;

        let mut active = Vec::with_capacity(status.channels.len());
        for channel in status.channels {
            match channel.channel_id.clone() {
                Some(id) => active.push((id, channel)),
                None => warn!("Ignoring active stream without channel_id"),
            }
        }
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let unknown = {
            let cache = self.channels.read().await;
            let missing = self.missing_channels.read().await;
            active
                .iter()
                .any(|(id, _)| !cache.contains_key(id) && !missing.contains(id))
        };
        if unknown {
            debug!("Active stream on an unknown channel, refreshing the catalogue");
            self.refresh_channels(token).await?;

            let cache = self.channels.read().await;
            let mut missing = self.missing_channels.write().await;
            for (id, _) in &active {
                if !cache.contains_key(id) && missing.insert(id.clone()) {
                    warn!("Channel {} is not in the Dispatcharr catalogue", id);
                }
            }
        }

        let cache = self.channels.read().await;
        let records = active
            .into_iter()
            .map(|(id, channel)| {
                let details = cache.get(&id);
                self.join_channel(id, channel, details)
            })
            .collect();

        Ok(records)
    }

    async fn fetch_epg(&self, token: &Token) -> Result<EpgDataset, FetchError> {
        let grid: EpgGridResponse = self.get_json(EPG_GRID_PATH, token).await?;
        let total = grid.len();

        let programs = grid.into_programs();
        if programs.len() < total {
            debug!(
                "Dropped {} malformed EPG entries out of {}",
                total - programs.len(),
                total
            );
        }

        let dataset = EpgDataset::from_programs(programs);
        debug!(
            "EPG loaded: {} programs on {} channels",
            dataset.len(),
            dataset.channel_count()
        );
        Ok(dataset)
    }
}

/// Builder for configuring a [`DispatcharrApi`]
#[derive(Debug)]
pub struct ClientBuilder {
    client: Option<Client>,
    base_url: String,
    timeout: Duration,
    user_agent: String,
}

impl ClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: None,
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Set a custom HTTP client
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a custom User-Agent header
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the client
    pub fn build(self) -> Result<DispatcharrApi, FetchError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| FetchError::Http(format!("invalid base URL '{}': {}", self.base_url, e)))?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(&self.user_agent)
                .timeout(self.timeout)
                .build()?,
        };

        Ok(DispatcharrApi {
            client,
            base_url,
            channels: RwLock::new(HashMap::new()),
            missing_channels: RwLock::new(HashSet::new()),
        })
    }
}
