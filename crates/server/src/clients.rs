//! HTTP clients behind the completion, search and email ports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use concierge_core::config::{EmailConfig, LlmConfig, LlmProvider, SearchConfig};
use concierge_core::errors::ServiceError;
use concierge_core::ports::{
    CalendarEvent, CalendarService, CompletionLimits, CompletionService, Embedder, EmailSender,
    OutgoingEmail, Prompt, SearchHit, SearchService,
};
use concierge_core::schedule::TimeWindow;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn http_client() -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|error| ServiceError::unavailable(error.to_string()))
}

fn transport_error(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::unavailable(format!("request timed out: {error}"))
    } else {
        ServiceError::unavailable(error.to_string())
    }
}

/// Maps a non-success HTTP status onto [`ServiceError`].
pub fn status_error(service: &str, status: StatusCode, body: &str) -> ServiceError {
    let detail: String = body.chars().take(200).collect();
    let message = format!("{service} returned {status}: {detail}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
            ServiceError::Rejected(message)
        }
        StatusCode::NOT_FOUND => ServiceError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited(message),
        _ => ServiceError::Unavailable(message),
    }
}

async fn read_json(service: &str, response: reqwest::Response) -> Result<Value, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(service, status, &body));
    }
    response.json::<Value>().await.map_err(transport_error)
}

/// Chat completions over the OpenAI wire format. Ollama serves the same
/// format under `/v1`, so both providers share this client.
pub struct ChatCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

/// Root of the OpenAI-compatible API for the configured provider.
fn api_base(config: &LlmConfig) -> Result<String, ServiceError> {
    let base_url = match config.provider {
        LlmProvider::OpenAi => config.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_owned()),
        LlmProvider::Ollama => {
            let base = config.base_url.as_deref().ok_or_else(|| {
                ServiceError::NotConfigured("llm.base_url is required for ollama".to_owned())
            })?;
            format!("{}/v1", base.trim_end_matches('/'))
        }
    };
    Ok(base_url.trim_end_matches('/').to_owned())
}

impl ChatCompletionClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client()?,
            endpoint: format!("{}/chat/completions", api_base(config)?),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn payload(&self, prompt: &Prompt, limits: CompletionLimits) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "max_tokens": limits.max_tokens,
            "temperature": limits.temperature,
        });
        if limits.json_output {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        payload
    }
}

#[async_trait]
impl CompletionService for ChatCompletionClient {
    async fn complete(
        &self,
        prompt: &Prompt,
        limits: CompletionLimits,
    ) -> Result<String, ServiceError> {
        let mut request = self.client.post(&self.endpoint).json(&self.payload(prompt, limits));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await.map_err(transport_error)?;
        let body = read_json("completion", response).await?;

        debug!(event_name = "llm.completion_received", model = %self.model, "completion received");
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ServiceError::unavailable("completion response had no content"))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Dense vectors from an OpenAI-compatible `/embeddings` route.
pub struct EmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl EmbeddingClient {
    /// `None` when the provider has no embedding model configured.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>, ServiceError> {
        let Some(model) = config.resolved_embedding_model() else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: http_client()?,
            endpoint: format!("{}/embeddings", api_base(config)?),
            api_key: config.api_key.clone(),
            model: model.to_owned(),
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Takes the first vector out of an `{"data": [{"embedding": [...]}]}` body.
pub fn first_embedding(body: Value) -> Result<Vec<f32>, ServiceError> {
    let parsed: EmbeddingResponse = serde_json::from_value(body)
        .map_err(|error| ServiceError::unavailable(format!("embedding response: {error}")))?;
    parsed
        .data
        .into_iter()
        .next()
        .map(|data| data.embedding)
        .filter(|vector| !vector.is_empty())
        .ok_or_else(|| ServiceError::unavailable("embedding response had no vector"))
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "model": self.model, "input": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request.send().await.map_err(transport_error)?;
        let body = read_json("embeddings", response).await?;
        let vector = first_embedding(body)?;

        debug!(
            event_name = "llm.embedding_received",
            model = %self.model,
            dimensions = vector.len(),
            "embedding received"
        );
        Ok(vector)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceResult>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceResult {
    name: String,
    formatted_address: Option<String>,
    rating: Option<f32>,
    place_id: Option<String>,
}

/// Google Places text search.
pub struct PlacesSearchClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl PlacesSearchClient {
    pub fn from_config(config: &SearchConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.places_base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        })
    }
}

fn place_hit(place: PlaceResult) -> SearchHit {
    let url = place
        .place_id
        .map(|id| format!("https://www.google.com/maps/place/?q=place_id:{id}"));
    SearchHit {
        title: place.name,
        snippet: String::new(),
        url,
        address: place.formatted_address,
        rating: place.rating,
    }
}

#[async_trait]
impl SearchService for PlacesSearchClient {
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        let Some(key) = &self.api_key else {
            return Err(ServiceError::NotConfigured("search.api_key is not set".to_owned()));
        };
        let response = self
            .client
            .get(format!("{}/textsearch/json", self.base_url))
            .query(&[("query", text), ("key", key.expose_secret())])
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json("places", response).await?;
        let parsed: PlacesResponse = serde_json::from_value(body)
            .map_err(|error| ServiceError::unavailable(error.to_string()))?;

        match parsed.status.as_str() {
            "OK" | "ZERO_RESULTS" => {
                Ok(parsed.results.into_iter().take(limit).map(place_hit).collect())
            }
            "OVER_QUERY_LIMIT" => Err(ServiceError::RateLimited(parsed.status)),
            "REQUEST_DENIED" | "INVALID_REQUEST" => Err(ServiceError::Rejected(format!(
                "{}: {}",
                parsed.status,
                parsed.error_message.unwrap_or_default()
            ))),
            _ => Err(ServiceError::unavailable(parsed.status)),
        }
    }
}

/// Full-text web search against a Brave-style `web.results` API.
pub struct WebSearchClient {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<SecretString>,
}

impl WebSearchClient {
    pub fn from_config(config: &SearchConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client()?,
            base_url: config.web_base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Pulls ranked hits out of a `{"web": {"results": [...]}}` body.
pub fn web_hits(body: &Value, limit: usize) -> Vec<SearchHit> {
    body["web"]["results"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .filter_map(|result| {
                    let title = result["title"].as_str()?;
                    Some(SearchHit {
                        title: title.to_owned(),
                        snippet: result["description"].as_str().unwrap_or_default().to_owned(),
                        url: result["url"].as_str().map(str::to_owned),
                        address: None,
                        rating: None,
                    })
                })
                .take(limit)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchService for WebSearchClient {
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        let Some(base_url) = &self.base_url else {
            return Err(ServiceError::NotConfigured("search.web_base_url is not set".to_owned()));
        };
        let count = limit.to_string();
        let mut request =
            self.client.get(base_url).query(&[("q", text), ("count", count.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Subscription-Token", key.expose_secret());
        }
        let response = request.send().await.map_err(transport_error)?;
        let body = read_json("web search", response).await?;
        Ok(web_hits(&body, limit))
    }
}

/// Sends mail through the Resend HTTP API.
pub struct ResendEmailSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    from: Option<String>,
}

impl ResendEmailSender {
    pub fn from_config(config: &EmailConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client()?,
            endpoint: format!("{}/emails", config.api_base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            from: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError> {
        let (Some(key), Some(from)) = (&self.api_key, &self.from) else {
            return Err(ServiceError::NotConfigured(
                "email.api_key and email.from_address are required".to_owned(),
            ));
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key.expose_secret())
            .json(&json!({
                "from": from,
                "to": [email.to],
                "subject": email.subject,
                "text": email.body,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json("email", response).await?;
        Ok(body["id"].as_str().unwrap_or_default().to_owned())
    }
}

/// Calendar stand-in for deployments without calendar credentials.
pub struct UnconfiguredCalendar;

#[async_trait]
impl CalendarService for UnconfiguredCalendar {
    async fn list_events(
        &self,
        _window: &TimeWindow,
        _max_results: usize,
    ) -> Result<Vec<CalendarEvent>, ServiceError> {
        Err(ServiceError::NotConfigured("no calendar account is connected".to_owned()))
    }

    async fn create_event(&self, _event: &CalendarEvent) -> Result<CalendarEvent, ServiceError> {
        Err(ServiceError::NotConfigured("no calendar account is connected".to_owned()))
    }
}
