//! Twitch Helix / TMI integration
//!
//! Provides the three upstream reads the tracker needs:
//! - Top live streams (tracked channel set for a pass)
//! - User profiles (metadata for newly seen channels)
//! - Chatter lists (audience samples)
//!
//! ## API Reference
//!
//! - `GET {helix}/streams?first={n}` - top streams by viewer count
//! - `GET {helix}/users?login={a}&login={b}` - up to 100 users per call
//! - `GET {tmi}/group/user/{channel}/chatters` - chatter groups
//! - `POST {auth}/oauth2/token` - client-credentials app token
//!
//! Every response is decoded into an explicit schema; a payload that does
//! not match fails the call instead of yielding partial data.

use super::config::TrackerConfig;
use super::error::{FetchError, UpstreamError};
use super::types::{AudienceSample, Channel, ChannelMetadata, TopChannel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;

/// Helix accepts at most 100 logins per users request
const USERS_BATCH_SIZE: usize = 100;

/// Upstream broadcast platform
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Current top live channels, highest viewer count first
    async fn fetch_top_channels(&self, limit: usize) -> Result<Vec<TopChannel>, UpstreamError>;

    /// Profile metadata for the given channels (unknown logins are omitted)
    async fn fetch_channel_metadata(
        &self,
        channels: &[Channel],
    ) -> Result<Vec<ChannelMetadata>, UpstreamError>;

    /// Current chatter list for one channel
    async fn fetch_audience(&self, channel: &Channel) -> Result<AudienceSample, FetchError>;
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    user_login: String,
    #[serde(default)]
    game_id: String,
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    title: String,
    viewer_count: u64,
    #[serde(default)]
    language: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
    #[serde(default)]
    description: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ChattersResponse {
    chatter_count: u64,
    chatters: ChatterGroups,
}

#[derive(Debug, Default, Deserialize)]
struct ChatterGroups {
    #[serde(default)]
    broadcaster: Vec<String>,
    #[serde(default)]
    vips: Vec<String>,
    #[serde(default)]
    moderators: Vec<String>,
    #[serde(default)]
    staff: Vec<String>,
    #[serde(default)]
    admins: Vec<String>,
    #[serde(default)]
    global_mods: Vec<String>,
    #[serde(default)]
    viewers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Decode a Helix streams page into tracked channel entries
pub fn decode_top_streams(body: &str) -> Result<Vec<TopChannel>, UpstreamError> {
    let page: HelixPage<HelixStream> = serde_json::from_str(body)?;

    page.data
        .into_iter()
        .map(|stream| -> Result<TopChannel, UpstreamError> {
            Ok(TopChannel {
                channel: Channel::parse(&stream.user_login)?,
                category: stream.game_name,
                category_id: stream.game_id,
                title: stream.title,
                viewer_count: stream.viewer_count,
                language: stream.language,
                started_at: stream.started_at,
            })
        })
        .collect()
}

/// Decode a Helix users page into channel metadata
pub fn decode_users(body: &str) -> Result<Vec<ChannelMetadata>, UpstreamError> {
    let page: HelixPage<HelixUser> = serde_json::from_str(body)?;

    page.data
        .into_iter()
        .map(|user| -> Result<ChannelMetadata, UpstreamError> {
            Ok(ChannelMetadata {
                channel: Channel::parse(&user.login)?,
                channel_id: user.id,
                description: user.description,
                creation_date: user.created_at,
            })
        })
        .collect()
}

/// Decode a TMI chatters payload; every chatter group counts as audience
pub fn decode_chatters(body: &str) -> Result<AudienceSample, FetchError> {
    let response: ChattersResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Transient(format!("malformed chatters payload: {}", e)))?;

    let groups = response.chatters;
    let members: Vec<String> = groups
        .broadcaster
        .into_iter()
        .chain(groups.vips)
        .chain(groups.moderators)
        .chain(groups.staff)
        .chain(groups.admins)
        .chain(groups.global_mods)
        .chain(groups.viewers)
        .collect();

    Ok(AudienceSample {
        total_count: response.chatter_count,
        members,
    })
}

/// What `helix_get` does with a response status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelixStatus {
    Success,
    /// Drop the cached token and retry once
    RenewToken,
    Failed(UpstreamError),
}

pub fn classify_helix_status(endpoint: &str, status: StatusCode, renewed: bool) -> HelixStatus {
    if status == StatusCode::UNAUTHORIZED && !renewed {
        return HelixStatus::RenewToken;
    }

    if !status.is_success() {
        return HelixStatus::Failed(UpstreamError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }

    HelixStatus::Success
}

/// Map a chatters endpoint status; 404 means the channel is not live
pub fn classify_chatters_status(channel: &Channel, status: StatusCode) -> Result<(), FetchError> {
    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotLive(channel.clone()));
    }

    if !status.is_success() {
        return Err(FetchError::Transient(format!(
            "chatters endpoint returned {} for {}",
            status, channel
        )));
    }

    Ok(())
}

/// reqwest-backed client for Helix and TMI
pub struct HelixClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    helix_base_url: String,
    tmi_base_url: String,
    auth_base_url: String,
    token: RwLock<Option<String>>,
}

impl HelixClient {
    pub fn new(config: &TrackerConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            helix_base_url: config.helix_base_url.trim_end_matches('/').to_string(),
            tmi_base_url: config.tmi_base_url.trim_end_matches('/').to_string(),
            auth_base_url: config.auth_base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.app_token.clone()),
        })
    }

    /// Fetch a fresh app access token via client credentials
    pub async fn renew_token(&self) -> Result<String, UpstreamError> {
        if self.client_secret.is_empty() {
            return Err(UpstreamError::Auth(
                "app token rejected and no client secret configured".to_string(),
            ));
        }

        let url = format!("{}/oauth2/token", self.auth_base_url);
        let response = self
            .http
            .post(&url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            log::error!("❌ Failed to fetch OAuth app token (status {})", response.status());
            return Err(UpstreamError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&response.text().await?)?;
        log::info!(
            "🔑 Fetched new app access token (expires in {}s)",
            token.expires_in
        );

        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn bearer(&self) -> Result<String, UpstreamError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.renew_token().await
    }

    /// Authorized Helix GET, renewing the token once on 401
    async fn helix_get(&self, path: &str, query: &[(&str, String)]) -> Result<String, UpstreamError> {
        let url = format!("{}/{}", self.helix_base_url, path);
        let mut renewed = false;

        loop {
            let token = self.bearer().await?;
            let response = self
                .http
                .get(&url)
                .header("Client-Id", &self.client_id)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            match classify_helix_status(path, response.status(), renewed) {
                HelixStatus::Success => return Ok(response.text().await?),
                HelixStatus::RenewToken => {
                    log::warn!("⚠️  Helix rejected app token, renewing");
                    *self.token.write().await = None;
                    renewed = true;
                }
                HelixStatus::Failed(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl UpstreamApi for HelixClient {
    async fn fetch_top_channels(&self, limit: usize) -> Result<Vec<TopChannel>, UpstreamError> {
        let body = self
            .helix_get("streams", &[("first", limit.to_string())])
            .await?;
        decode_top_streams(&body)
    }

    async fn fetch_channel_metadata(
        &self,
        channels: &[Channel],
    ) -> Result<Vec<ChannelMetadata>, UpstreamError> {
        let mut metadata = Vec::with_capacity(channels.len());

        for batch in channels.chunks(USERS_BATCH_SIZE) {
            let query: Vec<(&str, String)> = batch
                .iter()
                .map(|channel| ("login", channel.to_string()))
                .collect();

            let body = self.helix_get("users", &query).await?;
            metadata.extend(decode_users(&body)?);
        }

        Ok(metadata)
    }

    async fn fetch_audience(&self, channel: &Channel) -> Result<AudienceSample, FetchError> {
        let url = format!("{}/group/user/{}/chatters", self.tmi_base_url, channel);
        log::debug!("Fetching chatters for {}...", channel);

        let response = self.http.get(&url).send().await?;
        classify_chatters_status(channel, response.status())?;

        decode_chatters(&response.text().await?)
    }
}
