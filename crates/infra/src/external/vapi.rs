//! Outbound call placement through Vapi.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use eatsavvy_core::phone::to_e164;
use eatsavvy_core::{ProviderCallId, Restaurant};

use crate::config::VapiConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Webhook messages the assistant should send back.
const END_OF_CALL_REPORT: &str = "end-of-call-report";

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// No connection to the provider was made; the request never left.
    #[error("could not reach call provider: {0}")]
    Connect(String),

    /// 429 or 503: the provider refused the request without processing it.
    #[error("call provider unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    /// The request was sent but its fate is unknown (timeout, dropped connection,
    /// 500/502/504). The call may have been placed.
    #[error("call outcome unknown: {0}")]
    Indeterminate(String),

    /// Any other 4xx: the request itself is wrong.
    #[error("call rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The request could not be built (bad phone number, missing config).
    #[error("invalid call request: {0}")]
    InvalidRequest(String),

    /// 2xx but the body did not carry a call id. The call may have been placed.
    #[error("malformed call response: {0}")]
    MalformedResponse(String),
}

impl CallError {
    /// Safe to retry: the provider certainly did not place the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Connect(_) | CallError::Unavailable { .. })
    }

    fn from_send(err: reqwest::Error) -> Self {
        if err.is_builder() {
            CallError::InvalidRequest(err.to_string())
        } else if err.is_connect() {
            CallError::Connect(err.to_string())
        } else {
            CallError::Indeterminate(err.to_string())
        }
    }

    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            CallError::Unavailable {
                status: status.as_u16(),
                body,
            }
        } else if status.is_server_error() {
            CallError::Indeterminate(format!("provider answered {status}: {body}"))
        } else {
            CallError::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

#[async_trait]
pub trait CallClient: Send + Sync {
    /// Place a call to `restaurant` and return the provider's call id.
    async fn create_call(&self, restaurant: &Restaurant) -> Result<ProviderCallId, CallError>;
}

#[async_trait]
impl<C> CallClient for std::sync::Arc<C>
where
    C: CallClient + ?Sized,
{
    async fn create_call(&self, restaurant: &Restaurant) -> Result<ProviderCallId, CallError> {
        (**self).create_call(restaurant).await
    }
}

/// `POST /call` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub phone_number_id: String,
    pub customer: Customer,
    pub assistant: Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customer {
    /// E.164.
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assistant {
    pub transcriber: Transcriber,
    pub voice: Voice,
    pub model: Model,
    pub first_message: String,
    pub background_speech_denoising_plan: DenoisingPlan,
    pub server: Server,
    pub server_messages: Vec<String>,
    pub artifact_plan: ArtifactPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcriber {
    pub provider: String,
    pub model: String,
    pub language: String,
}

impl Default for Transcriber {
    fn default() -> Self {
        Self {
            provider: "deepgram".into(),
            model: "nova-2".into(),
            language: "en".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Voice {
    pub provider: String,
    pub voice_id: String,
    pub model: String,
    pub speed: f32,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            provider: "11labs".into(),
            voice_id: "sarah".into(),
            model: "eleven_turbo_v2_5".into(),
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    pub provider: String,
    pub model: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenoisingPlan {
    pub smart_denoising_plan: Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub url: String,
    pub static_ip_addresses_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPlan {
    pub structured_output_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    id: String,
}

impl CreateCallRequest {
    pub fn builder() -> CreateCallRequestBuilder {
        CreateCallRequestBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateCallRequestBuilder {
    phone_number_id: Option<String>,
    customer_number: Option<String>,
    restaurant_name: Option<String>,
    system_prompt: Option<String>,
    webhook_url: Option<String>,
    structured_output_ids: Vec<String>,
}

impl CreateCallRequestBuilder {
    pub fn phone_number_id(mut self, id: impl Into<String>) -> Self {
        self.phone_number_id = Some(id.into());
        self
    }

    /// Any format `to_e164` accepts.
    pub fn customer_number(mut self, number: impl Into<String>) -> Self {
        self.customer_number = Some(number.into());
        self
    }

    pub fn restaurant_name(mut self, name: impl Into<String>) -> Self {
        self.restaurant_name = Some(name.into());
        self
    }

    /// `{restaurant}` is replaced by the restaurant name.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn structured_output_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.structured_output_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<CreateCallRequest, CallError> {
        let phone_number_id = self
            .phone_number_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CallError::InvalidRequest("phone number id is required".into()))?;

        let raw_number = self
            .customer_number
            .ok_or_else(|| CallError::InvalidRequest("customer number is required".into()))?;
        let number = to_e164(&raw_number).map_err(|e| CallError::InvalidRequest(e.to_string()))?;

        let webhook_url = self
            .webhook_url
            .filter(|u| u.starts_with("https://") || u.starts_with("http://"))
            .ok_or_else(|| CallError::InvalidRequest("webhook url must be http(s)".into()))?;

        let name = self
            .restaurant_name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| CallError::InvalidRequest("restaurant name is required".into()))?;

        let prompt = self
            .system_prompt
            .unwrap_or_else(|| crate::config::DEFAULT_SYSTEM_PROMPT.to_string())
            .replace("{restaurant}", &name);

        Ok(CreateCallRequest {
            phone_number_id,
            customer: Customer { number },
            assistant: Assistant {
                transcriber: Transcriber::default(),
                voice: Voice::default(),
                model: Model {
                    provider: "openai".into(),
                    model: "gpt-4.1".into(),
                    messages: vec![Message {
                        role: "system".into(),
                        content: prompt,
                    }],
                },
                first_message: format!("Hi, is this {name}?"),
                background_speech_denoising_plan: DenoisingPlan {
                    smart_denoising_plan: Toggle { enabled: true },
                },
                server: Server {
                    url: webhook_url,
                    static_ip_addresses_enabled: true,
                },
                server_messages: vec![END_OF_CALL_REPORT.to_string()],
                artifact_plan: ArtifactPlan {
                    structured_output_ids: self.structured_output_ids,
                },
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct VapiClient {
    http: reqwest::Client,
    config: VapiConfig,
}

impl VapiClient {
    pub fn new(config: &VapiConfig) -> Result<Self, CallError> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    fn with_timeout(config: &VapiConfig, timeout: Duration) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Build the request for `restaurant` from configuration.
    pub fn request_for(&self, restaurant: &Restaurant) -> Result<CreateCallRequest, CallError> {
        let number = self
            .config
            .customer_number_override
            .clone()
            .or_else(|| restaurant.phone_number.clone())
            .ok_or_else(|| CallError::InvalidRequest(format!("restaurant {} has no phone number", restaurant.place_id)))?;

        CreateCallRequest::builder()
            .phone_number_id(&self.config.phone_number_id)
            .customer_number(number)
            .restaurant_name(&restaurant.name)
            .system_prompt(&self.config.system_prompt)
            .webhook_url(&self.config.webhook_url)
            .structured_output_ids(self.config.structured_output_ids.iter().cloned())
            .build()
    }
}

#[async_trait]
impl CallClient for VapiClient {
    #[instrument(skip(self, restaurant), fields(place_id = %restaurant.place_id), err)]
    async fn create_call(&self, restaurant: &Restaurant) -> Result<ProviderCallId, CallError> {
        let request = self.request_for(restaurant)?;

        let resp = self
            .http
            .post(format!("{}/call", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(CallError::from_send)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CallError::from_status(status, resp.text().await.unwrap_or_default()));
        }
        // From here on the provider accepted the call.

        let body: CreateCallResponse = resp
            .json()
            .await
            .map_err(|e| CallError::MalformedResponse(e.to_string()))?;
        ProviderCallId::new(body.id).map_err(|e| CallError::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder() -> CreateCallRequestBuilder {
        CreateCallRequest::builder()
            .phone_number_id("pn-1")
            .customer_number("(425) 268-4016")
            .restaurant_name("Pho Bac")
            .system_prompt("Ask {restaurant} about oils.")
            .webhook_url("https://example.test/process-eocr")
            .structured_output_ids(["a", "b"])
    }

    #[test]
    fn request_serialises_with_provider_field_names() {
        let request = builder().build().unwrap();
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["phoneNumberId"], json!("pn-1"));
        assert_eq!(value["customer"]["number"], json!("+14252684016"));
        assert_eq!(value["assistant"]["firstMessage"], json!("Hi, is this Pho Bac?"));
        assert_eq!(
            value["assistant"]["model"]["messages"][0]["content"],
            json!("Ask Pho Bac about oils.")
        );
        assert_eq!(
            value["assistant"]["server"],
            json!({"url": "https://example.test/process-eocr", "staticIpAddressesEnabled": true})
        );
        assert_eq!(value["assistant"]["serverMessages"], json!(["end-of-call-report"]));
        assert_eq!(
            value["assistant"]["artifactPlan"]["structuredOutputIds"],
            json!(["a", "b"])
        );
        assert_eq!(
            value["assistant"]["backgroundSpeechDenoisingPlan"]["smartDenoisingPlan"]["enabled"],
            json!(true)
        );
        assert_eq!(value["assistant"]["voice"]["voiceId"], json!("sarah"));
    }

    #[test]
    fn builder_rejects_bad_inputs() {
        assert!(matches!(
            builder().customer_number("12345").build(),
            Err(CallError::InvalidRequest(_))
        ));
        assert!(matches!(
            builder().phone_number_id("  ").build(),
            Err(CallError::InvalidRequest(_))
        ));
        assert!(matches!(
            builder().webhook_url("ftp://x").build(),
            Err(CallError::InvalidRequest(_))
        ));
    }

    #[test]
    fn status_classification() {
        let unavailable = CallError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, String::new());
        let throttled = CallError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        let rejected = CallError::from_status(reqwest::StatusCode::BAD_REQUEST, String::new());

        assert!(unavailable.is_transient());
        assert!(throttled.is_transient());
        assert!(!rejected.is_transient());
        assert!(!CallError::MalformedResponse("x".into()).is_transient());

        // A gateway error may hide a call the provider already placed.
        for status in [
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            reqwest::StatusCode::BAD_GATEWAY,
            reqwest::StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = CallError::from_status(status, String::new());
            assert!(matches!(err, CallError::Indeterminate(_)));
            assert!(!err.is_transient());
        }
    }

    fn config(base_url: String) -> VapiConfig {
        VapiConfig {
            api_key: "key".into(),
            base_url,
            phone_number_id: "pn-1".into(),
            webhook_url: "https://example.test/process-eocr".into(),
            structured_output_ids: Vec::new(),
            customer_number_override: None,
            system_prompt: "Ask {restaurant} about oils.".into(),
        }
    }

    fn restaurant() -> Restaurant {
        let now = chrono::Utc::now();
        let mut r = Restaurant::pending_stub(eatsavvy_core::PlaceId::new("p1").unwrap(), "Pho Bac", now);
        r.phone_number = Some("(425) 268-4016".into());
        r
    }

    #[tokio::test]
    async fn timeout_after_sending_is_not_retryable() {
        // Accepts the request and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });

        let client = VapiClient::with_timeout(&config(format!("http://{addr}")), Duration::from_millis(200)).unwrap();
        let err = client.create_call(&restaurant()).await.unwrap_err();
        server.abort();

        assert!(matches!(err, CallError::Indeterminate(_)), "got {err:?}");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = VapiClient::with_timeout(&config(format!("http://{addr}")), Duration::from_secs(2)).unwrap();
        let err = client.create_call(&restaurant()).await.unwrap_err();

        assert!(matches!(err, CallError::Connect(_)), "got {err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_gateway_response_is_not_retryable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let client = VapiClient::with_timeout(&config(format!("http://{addr}")), Duration::from_secs(2)).unwrap();
        let err = client.create_call(&restaurant()).await.unwrap_err();
        server.abort();

        assert!(matches!(err, CallError::Indeterminate(_)), "got {err:?}");
    }
}
