//! Process configuration.
//!
//! Built once at startup (`AppConfig::from_env`) and handed to each component's
//! constructor by reference; nothing below this module reads the environment.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queue: QueueConfig,
    pub vapi: VapiConfig,
    pub places: PlacesConfig,
    pub api: ApiConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base name; the Redis queue derives its stream/delayed keys from it.
    pub name: String,
    /// Consumer group shared by all worker instances.
    pub group: String,
    /// Bound on every broker round-trip.
    pub io_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "enrich_restaurant_details".to_string(),
            group: "enrichment-workers".to_string(),
            io_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VapiConfig {
    pub api_key: String,
    pub base_url: String,
    pub phone_number_id: String,
    /// Where the provider posts the end-of-call report.
    pub webhook_url: String,
    pub structured_output_ids: Vec<String>,
    /// Dial this number instead of the restaurant's (staging).
    pub customer_number_override: Option<String>,
    /// Assistant system prompt; `{restaurant}` is replaced by the restaurant name.
    pub system_prompt: String,
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly and polite caller asking the restaurant {restaurant} \
about dietary and nutritional information. Keep the conversation natural and brief, and thank them for their time.";

#[derive(Debug, Clone)]
pub struct PlacesConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Static bearer token required on every route except `/health`.
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on a single receive wait; shutdown is observed between waits.
    pub poll_interval: Duration,
    /// Transient-failure attempts before a restaurant is marked failed.
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let millis = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(name) {
                Some(raw) => raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|e| {
                    ConfigError::Invalid {
                        name,
                        reason: e.to_string(),
                    }
                }),
                None => Ok(Duration::from_millis(default)),
            }
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            name: get("QUEUE_NAME").unwrap_or(queue_defaults.name),
            group: get("QUEUE_GROUP").unwrap_or(queue_defaults.group),
            io_timeout: millis("QUEUE_IO_TIMEOUT_MS", 5_000)?,
        };

        let webhook_url = required("VAPI_WEBHOOK_URL")?;
        if !(webhook_url.starts_with("https://") || webhook_url.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                name: "VAPI_WEBHOOK_URL",
                reason: "must be an http(s) URL".to_string(),
            });
        }

        let vapi = VapiConfig {
            api_key: required("VAPI_API_KEY")?,
            base_url: get("VAPI_BASE_URL").unwrap_or_else(|| "https://api.vapi.ai".to_string()),
            phone_number_id: required("VAPI_PHONE_NUMBER_ID")?,
            webhook_url,
            structured_output_ids: get("VAPI_STRUCTURED_OUTPUT_IDS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            customer_number_override: get("VAPI_CUSTOMER_NUMBER_OVERRIDE"),
            system_prompt: get("VAPI_SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let places = PlacesConfig {
            api_key: required("GOOGLE_PLACES_API_KEY")?,
            base_url: get("PLACES_BASE_URL").unwrap_or_else(|| "https://places.googleapis.com".to_string()),
        };

        let api = ApiConfig {
            bind_addr: get("API_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            api_key: required("EATSAVVY_API_KEY")?,
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            poll_interval: millis("WORKER_POLL_MS", worker_defaults.poll_interval.as_millis() as u64)?,
            max_attempts: match get("WORKER_MAX_ATTEMPTS") {
                Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                    name: "WORKER_MAX_ATTEMPTS",
                    reason: e.to_string(),
                })?,
                None => worker_defaults.max_attempts,
            },
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            queue,
            vapi,
            places,
            api,
            worker,
        })
    }
}
