use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::{EngineSettings, Secret};
use crate::error::ErrorKind;
use crate::media::{AudioGraph, AudioNode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub detection_tag: String,
    pub position: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RawDetection {
    pub meta: String,
    pub pos: f64,
}

impl From<RawDetection> for DetectionEvent {
    fn from(raw: RawDetection) -> Self {
        Self {
            detection_tag: raw.meta.trim().to_string(),
            position: raw.pos,
        }
    }
}

pub type DetectCallback = Arc<dyn Fn(DetectionEvent) + Send + Sync>;

pub trait Recognizer: Send + Sync {
    fn change_samplerate(&self, sample_rate_hz: u32);
    fn set_on_detect(&self, callback: DetectCallback);
    fn node(&self) -> Arc<dyn AudioNode>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to load recognition engine: {0}")]
    Load(String),
    #[error("failed to initialise recognition engine: {0}")]
    Init(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Load(_) => ErrorKind::EngineLoadFailed,
            EngineError::Init(_) => ErrorKind::EngineInitFailed,
        }
    }
}

#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(
        &self,
        graph: Arc<dyn AudioGraph>,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn Recognizer>, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineModule {
    pub url: Url,
    pub source: String,
}

#[async_trait]
pub trait ModuleHost: Send + Sync {
    async fn instantiate(
        &self,
        module: EngineModule,
        graph: Arc<dyn AudioGraph>,
        fingerprint_db_url: &str,
        api_key: Option<&Secret>,
    ) -> Result<Arc<dyn Recognizer>, EngineError>;
}

const MODULE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

pub struct ModuleEngineLoader<H: ModuleHost> {
    client: reqwest::Client,
    host: H,
}

impl<H: ModuleHost> ModuleEngineLoader<H> {
    pub fn new(host: H) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(MODULE_FETCH_TIMEOUT)
            .build()
            .map_err(|error| EngineError::Load(error.to_string()))?;
        Ok(Self { client, host })
    }

    pub async fn fetch_module(&self, settings: &EngineSettings) -> Result<EngineModule, EngineError> {
        let base = parse_module_url(settings)?;
        let request_url = module_request_url(settings)?;

        tracing::debug!(module = %base, "fetching recognition engine module");
        let response = self
            .client
            .get(request_url)
            .send()
            .await
            .map_err(|error| EngineError::Load(error.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Load(format!(
                "engine module request returned {}",
                response.status()
            )));
        }

        let source = response
            .text()
            .await
            .map_err(|error| EngineError::Load(error.without_url().to_string()))?;

        Ok(EngineModule {
            source: rewrite_relative_imports(&source, &base),
            url: base,
        })
    }
}

#[async_trait]
impl<H: ModuleHost> EngineLoader for ModuleEngineLoader<H> {
    async fn load(
        &self,
        graph: Arc<dyn AudioGraph>,
        settings: &EngineSettings,
    ) -> Result<Arc<dyn Recognizer>, EngineError> {
        let module = self.fetch_module(settings).await?;
        self.host
            .instantiate(
                module,
                graph,
                &settings.fingerprint_db_url,
                settings.api_key.as_ref(),
            )
            .await
    }
}

fn parse_module_url(settings: &EngineSettings) -> Result<Url, EngineError> {
    Url::parse(settings.module_url.trim())
        .map_err(|error| EngineError::Load(format!("invalid engine module url: {error}")))
}

pub fn module_request_url(settings: &EngineSettings) -> Result<Url, EngineError> {
    let mut url = parse_module_url(settings)?;
    if settings.api_key_in_module_url {
        if let Some(key) = settings.api_key.as_ref().filter(|key| !key.is_empty()) {
            url.query_pairs_mut().append_pair("key", key.expose());
        }
    }
    Ok(url)
}

/// Resolves `./` and `../` specifiers in `import`/`from` positions against `base`.
/// Comments and template literals pass through untouched.
pub fn rewrite_relative_imports(source: &str, base: &Url) -> String {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(index) = rest.find(['"', '\'', '`', '/']) {
        output.push_str(&rest[..index]);
        let tail = &rest[index..];

        let skipped = if let Some(comment) = tail.strip_prefix("//") {
            Some(comment.find('\n').map_or(tail.len(), |end| end + 2))
        } else if let Some(comment) = tail.strip_prefix("/*") {
            Some(comment.find("*/").map_or(tail.len(), |end| end + 4))
        } else if tail.starts_with('/') {
            Some(1)
        } else if let Some(template) = tail.strip_prefix('`') {
            Some(closing_quote(template, '`', true).map_or(tail.len(), |end| end + 2))
        } else {
            None
        };
        if let Some(skipped) = skipped {
            output.push_str(&tail[..skipped]);
            rest = &tail[skipped..];
            continue;
        }

        let quote = if tail.starts_with('"') { '"' } else { '\'' };
        let in_import_position = is_import_position(&output);
        output.push(quote);

        let body = &tail[1..];
        let Some(end) = closing_quote(body, quote, false) else {
            rest = body;
            continue;
        };

        let literal = &body[..end];
        if in_import_position && is_relative_specifier(literal) {
            match base.join(literal) {
                Ok(resolved) => output.push_str(resolved.as_str()),
                Err(_) => output.push_str(literal),
            }
        } else {
            output.push_str(literal);
        }
        output.push(quote);
        rest = &body[end + 1..];
    }

    output.push_str(rest);
    output
}

// Byte offset of the unescaped closing quote. Plain strings end at a newline.
fn closing_quote(body: &str, quote: char, multiline: bool) -> Option<usize> {
    let mut escaped = false;
    for (index, ch) in body.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '\n' if !multiline => return None,
            _ if ch == quote => return Some(index),
            _ => {}
        }
    }
    None
}

fn is_relative_specifier(literal: &str) -> bool {
    literal.starts_with("./") || literal.starts_with("../")
}

fn is_import_position(preceding: &str) -> bool {
    let trimmed = preceding.trim_end();
    let trimmed = trimmed.strip_suffix('(').map(str::trim_end).unwrap_or(trimmed);
    ["from", "import"].iter().any(|keyword| {
        trimmed
            .strip_suffix(keyword)
            .map(|head| {
                !head
                    .chars()
                    .last()
                    .is_some_and(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$' || ch == '.')
            })
            .unwrap_or(false)
    })
}
