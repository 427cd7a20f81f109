//! Network contracts
//!
//! [`RemoteApi`] is everything the sync engine needs from the server:
//! snapshot fetches, single-entity fetches for realtime refreshes and
//! per-entity mutation pushes. [`HttpRemote`] implements it over HTTP.

use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::models::{AnyRecord, EntityKind, Recall, RecordKey};
use crate::pending::{ChangeAction, PendingChange};
use crate::reconcile::{PhoneSnapshot, TerritorySnapshot, TokenSnapshot};

#[derive(Error, Debug)]
pub enum RemoteError {
    /// Connection failure, timeout or server-side outage
    #[error("{0}")]
    Transport(String),

    /// The server refused the request
    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RemoteError {
    /// Whether the same request may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The server, as seen by the sync engine
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_territories(&self) -> RemoteResult<TerritorySnapshot>;

    async fn fetch_phone(&self) -> RemoteResult<PhoneSnapshot>;

    async fn fetch_tokens(&self) -> RemoteResult<TokenSnapshot>;

    async fn fetch_recalls(&self) -> RemoteResult<Vec<Recall>>;

    /// Current server state of one entity; `None` if it no longer exists
    async fn fetch_entity(&self, kind: EntityKind, key: &RecordKey)
        -> RemoteResult<Option<AnyRecord>>;

    /// Send one queued change
    async fn push(&self, change: &PendingChange) -> RemoteResult<()>;
}

/// [`RemoteApi`] over the Service Maps HTTP API
pub struct HttpRemote {
    client: Client,
    base: Url,
    token: RwLock<Option<String>>,
}

impl HttpRemote {
    pub fn new(config: &Config) -> RemoteResult<Self> {
        let mut raw = config.api_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|e| RemoteError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let token = config
            .session
            .as_ref()
            .and_then(|session| session.access_token.clone());

        Ok(Self {
            client,
            base,
            token: RwLock::new(token),
        })
    }

    /// Replace the bearer token sent with every request
    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.token.write() {
            *current = token;
        }
    }

    fn url(&self, path: &str) -> RemoteResult<Url> {
        self.base.join(path).map_err(|e| RemoteError::InvalidUrl {
            url: format!("{}{}", self.base, path),
            reason: e.to_string(),
        })
    }

    fn entity_url(&self, kind: EntityKind, key: Option<&RecordKey>) -> RemoteResult<Url> {
        let mut url = self.url(&format!("entities/{}", kind))?;
        if let Some(key) = key {
            url.path_segments_mut()
                .map_err(|_| RemoteError::InvalidUrl {
                    url: self.base.to_string(),
                    reason: "cannot be a base".to_string(),
                })?
                .push(&key.encode());
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        let token = self.token.read().ok().and_then(|token| token.clone());
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        let response = check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }
}

/// Map non-success statuses onto [`RemoteError`]
async fn check(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RemoteError::Unauthorized);
    }

    let message = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(RemoteError::Transport(format!(
            "server returned {}: {}",
            status, message
        )))
    } else {
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_territories(&self) -> RemoteResult<TerritorySnapshot> {
        self.get_json("sync/territories").await
    }

    async fn fetch_phone(&self) -> RemoteResult<PhoneSnapshot> {
        self.get_json("sync/phone").await
    }

    async fn fetch_tokens(&self) -> RemoteResult<TokenSnapshot> {
        self.get_json("sync/tokens").await
    }

    async fn fetch_recalls(&self) -> RemoteResult<Vec<Recall>> {
        self.get_json("sync/recalls").await
    }

    async fn fetch_entity(
        &self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> RemoteResult<Option<AnyRecord>> {
        let url = self.entity_url(kind, Some(key))?;
        debug!("GET {}", url);
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: serde_json::Value = check(response).await?.json().await?;
        AnyRecord::from_json(kind, value)
            .map(Some)
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn push(&self, change: &PendingChange) -> RemoteResult<()> {
        let method = match change.action {
            ChangeAction::Add => Method::POST,
            ChangeAction::Update => Method::PUT,
            ChangeAction::Delete => Method::DELETE,
        };
        let url = self.entity_url(change.kind, None)?;
        debug!("{} {} '{}'", method, url, change.target);

        let body = serde_json::json!({
            "key": change.target,
            "payload": change.payload,
        });
        check(self.request(method, url).json(&body).send().await?).await?;
        Ok(())
    }
}
