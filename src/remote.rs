use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::{BackendSettings, Secret};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRow {
    pub user_id: String,
    pub stamps: Vec<u32>,
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymousSession {
    pub user_id: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected backend response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::RemoteSyncFailed
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn sign_in_anonymously(&self) -> Result<AnonymousSession, RemoteError>;
    async fn sign_out(&self) -> Result<(), RemoteError>;
    async fn upsert_progress(&self, row: &ProgressRow) -> Result<(), RemoteError>;
    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressRow>, RemoteError>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_PREVIEW_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct SignUpResponse {
    access_token: Option<String>,
    user: Option<SignUpUser>,
}

#[derive(Debug, Deserialize)]
struct SignUpUser {
    id: String,
}

pub struct RestRemoteStore {
    client: reqwest::Client,
    settings: BackendSettings,
    access_token: Mutex<Option<Secret>>,
}

impl RestRemoteStore {
    pub fn new(settings: BackendSettings) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| RemoteError::Unreachable(error.to_string()))?;
        Ok(Self {
            client,
            settings,
            access_token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn bearer(&self) -> String {
        let token = self
            .access_token
            .lock()
            .ok()
            .and_then(|token| token.clone())
            .unwrap_or_else(|| self.settings.anon_key.clone());
        format!("Bearer {}", token.expose())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.endpoint(path))
            .header("apikey", self.settings.anon_key.expose())
            .header(reqwest::header::AUTHORIZATION, self.bearer())
    }

    fn set_token(&self, token: Option<Secret>) {
        if let Ok(mut current) = self.access_token.lock() {
            *current = token;
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        body: body.chars().take(BODY_PREVIEW_LIMIT).collect(),
    })
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    RemoteError::Unreachable(error.without_url().to_string())
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn sign_in_anonymously(&self) -> Result<AnonymousSession, RemoteError> {
        let response = self
            .client
            .post(self.endpoint("auth/v1/signup"))
            .header("apikey", self.settings.anon_key.expose())
            .json(&serde_json::json!({ "data": {} }))
            .send()
            .await
            .map_err(transport_error)?;
        let payload = check_status(response)
            .await?
            .json::<SignUpResponse>()
            .await
            .map_err(|error| RemoteError::Decode(error.without_url().to_string()))?;

        let user = payload
            .user
            .ok_or_else(|| RemoteError::Decode("sign-in response has no user".to_string()))?;
        self.set_token(payload.access_token.map(Secret::new));
        tracing::info!(user_id = %user.id, "signed in anonymously");
        Ok(AnonymousSession { user_id: user.id })
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let result = self
            .request(reqwest::Method::POST, "auth/v1/logout")
            .send()
            .await
            .map_err(transport_error);
        self.set_token(None);
        check_status(result?).await.map(|_| ())
    }

    async fn upsert_progress(&self, row: &ProgressRow) -> Result<(), RemoteError> {
        let path = format!(
            "rest/v1/{}?on_conflict=user_id",
            self.settings.progress_table
        );
        let response = self
            .request(reqwest::Method::POST, &path)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressRow>, RemoteError> {
        let path = format!("rest/v1/{}", self.settings.progress_table);
        let response = self
            .request(reqwest::Method::GET, &path)
            .query(&[
                ("user_id", format!("eq.{user_id}")),
                ("select", "user_id,stamps,is_completed".to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        let rows = check_status(response)
            .await?
            .json::<Vec<ProgressRow>>()
            .await
            .map_err(|error| RemoteError::Decode(error.without_url().to_string()))?;
        Ok(rows.into_iter().next())
    }
}
