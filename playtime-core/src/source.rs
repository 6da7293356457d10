//! Account activity source: what the platform says about tracked accounts
//!
//! Provides an `AccountActivitySource` trait with the Steam Web API
//! implementation `SteamClient`:
//! - `ISteamUser/GetPlayerSummaries/v2` for visibility and the running title
//! - `IPlayerService/GetOwnedGames/v1` for cumulative playtime per title

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::SteamConfig;
use crate::models::{AccountId, ActivitySummary, OwnedGame, TitleId, Visibility};

/// The platform accepts at most this many ids per summaries request.
pub const SUMMARY_BATCH_LIMIT: usize = 100;

/// Any real account id works for probing the key.
const KEY_CHECK_ACCOUNT: AccountId = AccountId(76561197960287930);

// ============================================================================
// AccountActivitySource trait
// ============================================================================

#[async_trait]
pub trait AccountActivitySource: Send + Sync {
    /// Current visibility and running title for every requested account.
    /// Returns exactly one entry per requested id or fails as a whole.
    async fn batch_summaries(
        &self,
        accounts: &[AccountId],
    ) -> Result<HashMap<AccountId, ActivitySummary>, SourceError>;

    /// Cumulative playtime for the requested titles owned by `account`.
    /// `SourceError::EmptyResult` means the account owns none of them.
    async fn owned_playtime(
        &self,
        account: AccountId,
        titles: &[TitleId],
    ) -> Result<HashMap<TitleId, OwnedGame>, SourceError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("API key rejected (403 Forbidden)")]
    Forbidden,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Account owns none of the requested titles")]
    EmptyResult,

    #[error("No summary returned for account {0}")]
    MissingSummary(AccountId),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("All {attempts} attempts failed, last error: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl SourceError {
    /// Transport hiccups, throttling and server errors are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Http(e) => !e.is_decode(),
            SourceError::Api { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            _ => false,
        }
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct SummariesEnvelope {
    response: SummariesBody,
}

#[derive(Debug, Deserialize, Default)]
struct SummariesBody {
    #[serde(default)]
    players: Vec<PlayerSummary>,
}

#[derive(Debug, Deserialize)]
struct PlayerSummary {
    steamid: String,
    #[serde(rename = "communityvisibilitystate", default)]
    visibility: i64,
    #[serde(default)]
    personaname: Option<String>,
    #[serde(default)]
    gameid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwnedGamesEnvelope {
    #[serde(default)]
    response: OwnedGamesBody,
}

#[derive(Debug, Deserialize, Default)]
struct OwnedGamesBody {
    #[serde(default)]
    game_count: u32,
    #[serde(default)]
    games: Vec<WireOwnedGame>,
}

#[derive(Debug, Deserialize)]
struct WireOwnedGame {
    appid: u32,
    #[serde(default)]
    name: String,
    #[serde(default)]
    playtime_forever: u32,
}

#[derive(Debug, Serialize)]
struct OwnedGamesInput<'a> {
    steamid: u64,
    include_appinfo: bool,
    include_played_free_games: bool,
    appids_filter: &'a [u32],
}

impl PlayerSummary {
    fn into_domain(self) -> Result<ActivitySummary, SourceError> {
        let account = self
            .steamid
            .parse::<AccountId>()
            .map_err(|e| SourceError::Parse(format!("steamid {:?}: {}", self.steamid, e)))?;

        Ok(ActivitySummary {
            account,
            visibility: Visibility::from_code(self.visibility),
            current_title: parse_game_id(self.gameid.as_deref()),
            persona_name: self.personaname,
        })
    }
}

/// Absent, empty and non-platform ids (shortcuts use 64-bit ids) all mean
/// "nothing trackable is running".
fn parse_game_id(raw: Option<&str>) -> TitleId {
    match raw.map(str::trim) {
        None | Some("") => TitleId::NONE,
        Some(s) => match s.parse::<u32>() {
            Ok(id) => TitleId(id),
            Err(_) => {
                tracing::debug!(gameid = s, "Ignoring non-platform game id");
                TitleId::NONE
            }
        },
    }
}

// ============================================================================
// SteamClient
// ============================================================================

/// Steam Web API client.
#[derive(Debug, Clone)]
pub struct SteamClient {
    client: Client,
    config: SteamConfig,
}

impl SteamClient {
    pub fn new(config: SteamConfig) -> Result<Self, SourceError> {
        if config.api_key.trim().is_empty() {
            return Err(SourceError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }

    /// One summaries request; `Forbidden` means the key is unusable.
    pub async fn verify_api_key(&self) -> Result<(), SourceError> {
        self.fetch_summaries_chunk(&[KEY_CHECK_ACCOUNT]).await.map(|_| ())
    }

    async fn fetch_summaries_chunk(
        &self,
        accounts: &[AccountId],
    ) -> Result<Vec<PlayerSummary>, SourceError> {
        let ids = accounts
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let url = format!("{}/ISteamUser/GetPlayerSummaries/v2/", self.config.base_url);
        let query = [("key", self.config.api_key.as_str()), ("steamids", ids.as_str())];

        let envelope: SummariesEnvelope = self.get_json(&url, &query).await?;
        Ok(envelope.response.players)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.get_once::<T>(url, query),
            |e: &SourceError| e.is_retryable(),
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    attempts = self.config.max_retries + 1,
                    url = %url,
                    error = %e,
                    "All Steam API attempts failed"
                );
                Err(SourceError::RetryExhausted {
                    attempts: self.config.max_retries + 1,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.without_url()))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The key travels in the query string, so only the path is logged.
            tracing::error!(status = status.as_u16(), url = %url, body = %body, "Steam API error");

            if status == StatusCode::FORBIDDEN {
                return Err(SourceError::Forbidden);
            }
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Http(e.without_url()))?;
        tracing::trace!(url = %url, body = %body, "Steam API response");

        serde_json::from_str(&body).map_err(|e| SourceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl AccountActivitySource for SteamClient {
    async fn batch_summaries(
        &self,
        accounts: &[AccountId],
    ) -> Result<HashMap<AccountId, ActivitySummary>, SourceError> {
        if accounts.is_empty() {
            return Err(SourceError::Invalid("account list cannot be empty".to_string()));
        }

        let mut requested = accounts.to_vec();
        requested.sort_unstable();
        requested.dedup();

        let mut summaries = HashMap::with_capacity(requested.len());
        for chunk in requested.chunks(SUMMARY_BATCH_LIMIT) {
            for player in self.fetch_summaries_chunk(chunk).await? {
                let summary = player.into_domain()?;
                summaries.insert(summary.account, summary);
            }
        }

        if let Some(missing) = requested.iter().find(|id| !summaries.contains_key(id)) {
            return Err(SourceError::MissingSummary(*missing));
        }
        summaries.retain(|id, _| requested.binary_search(id).is_ok());

        Ok(summaries)
    }

    async fn owned_playtime(
        &self,
        account: AccountId,
        titles: &[TitleId],
    ) -> Result<HashMap<TitleId, OwnedGame>, SourceError> {
        if titles.is_empty() {
            return Err(SourceError::Invalid("title list cannot be empty".to_string()));
        }

        let appids = titles.iter().map(|t| t.0).collect::<Vec<_>>();
        let input = serde_json::to_string(&OwnedGamesInput {
            steamid: account.0,
            include_appinfo: true,
            include_played_free_games: true,
            appids_filter: &appids,
        })
        .map_err(|e| SourceError::Invalid(e.to_string()))?;

        let url = format!("{}/IPlayerService/GetOwnedGames/v1/", self.config.base_url);
        let query = [
            ("key", self.config.api_key.as_str()),
            ("format", "json"),
            ("input_json", input.as_str()),
        ];

        let envelope: OwnedGamesEnvelope = self.get_json(&url, &query).await?;
        let body = envelope.response;

        if body.game_count == 0 || body.games.is_empty() {
            tracing::debug!(account = %account, titles = ?appids, "Owned games query returned 0 games");
            return Err(SourceError::EmptyResult);
        }

        Ok(body
            .games
            .into_iter()
            .map(|g| {
                let title = TitleId(g.appid);
                (
                    title,
                    OwnedGame {
                        title,
                        name: g.name,
                        playtime_forever: g.playtime_forever,
                    },
                )
            })
            .collect())
    }

    fn name(&self) -> &str {
        "steam"
    }
}

// ============================================================================
// TESTS
// ============================================================================
