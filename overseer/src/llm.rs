//! Completion-service abstraction and the HTTP client pool.
//!
//! The [`CompletionService`] trait decouples stages from the model backend.
//! Tests use scripted services that return predetermined replies without
//! any network traffic. The production implementation talks to OpenAI or
//! any OpenAI-compatible server over blocking HTTP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{ModelConfig, ModelProvider, OverseerConfig};
use crate::core::state::{Message, Role};
use crate::error::TransportError;

/// Abstraction over completion backends.
pub trait CompletionService {
    /// Complete the ordered role-tagged messages with the given model.
    fn complete(
        &self,
        messages: &[Message],
        model: &ModelConfig,
    ) -> Result<String, TransportError>;
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Connection parameters resolved from a [`ModelConfig`] plus global
/// defaults. Two models with the same key share one HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    provider: ModelProvider,
    base_url: Option<String>,
    api_key_env: String,
}

#[derive(Debug, Clone)]
struct ResolvedClient {
    base_url: String,
    api_key: String,
}

/// Pool of completion clients keyed by (provider, endpoint, credential).
///
/// Owned by the orchestrator's dependency set, constructed once and passed
/// down — there is no global client state.
pub struct ClientPool {
    default_base: Option<String>,
    default_key_env: String,
    http: reqwest::blocking::Client,
    resolved: Mutex<HashMap<ClientKey, ResolvedClient>>,
}

impl ClientPool {
    pub fn new(config: &OverseerConfig) -> Result<Self, TransportError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            default_base: config.api_base.clone(),
            default_key_env: config.api_key_env.clone(),
            http,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    fn key_for(&self, model: &ModelConfig) -> ClientKey {
        ClientKey {
            provider: model.provider,
            base_url: model.api_base.clone().or_else(|| self.default_base.clone()),
            api_key_env: model
                .api_key_env
                .clone()
                .unwrap_or_else(|| self.default_key_env.clone()),
        }
    }

    fn resolve(&self, key: &ClientKey) -> Result<ResolvedClient, TransportError> {
        if let Some(found) = self
            .resolved
            .lock()
            .expect("client pool lock poisoned")
            .get(key)
        {
            return Ok(found.clone());
        }

        let api_key = std::env::var(&key.api_key_env).unwrap_or_default();
        let resolved = match key.provider {
            ModelProvider::OpenAi => {
                if api_key.is_empty() {
                    return Err(TransportError::MissingCredential(key.api_key_env.clone()));
                }
                ResolvedClient {
                    base_url: key
                        .base_url
                        .clone()
                        .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                    api_key,
                }
            }
            ModelProvider::OpenAiCompatible => {
                let Some(base_url) = key.base_url.clone() else {
                    return Err(TransportError::Http(
                        "openai_compatible provider requires api_base".to_string(),
                    ));
                };
                // Compatible servers usually ignore the key, but the header
                // must be present.
                ResolvedClient {
                    base_url,
                    api_key: if api_key.is_empty() {
                        "dummy".to_string()
                    } else {
                        api_key
                    },
                }
            }
        };

        debug!(base_url = %resolved.base_url, key_env = %key.api_key_env, "created completion client");
        self.resolved
            .lock()
            .expect("client pool lock poisoned")
            .insert(key.clone(), resolved.clone());
        Ok(resolved)
    }
}

impl CompletionService for ClientPool {
    #[instrument(skip_all, fields(model = %model.model))]
    fn complete(
        &self,
        messages: &[Message],
        model: &ModelConfig,
    ) -> Result<String, TransportError> {
        let key = self.key_for(model);
        let client = self.resolve(&key)?;

        let body = CompletionRequest {
            model: &model.model,
            messages: messages
                .iter()
                .map(|m| ApiMessage {
                    role: role_str(m.role),
                    content: &m.content,
                })
                .collect(),
            temperature: model.temperature,
            max_tokens: model.max_output_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            client.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&client.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                warn!(err = %e, "completion request failed");
                TransportError::Http(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(TransportError::Api(format!("{status}: {detail}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::InvalidResponse("no choices in response".to_string()))?;
        Ok(content)
    }
}
