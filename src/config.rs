use anyhow::Context;

/// Runtime configuration, read once at startup. Only the store is mandatory;
/// every external endpoint degrades gracefully when absent.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub inference_url: Option<String>,
    pub classifier_url: Option<String>,
    pub llm_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_fallback_url: Option<String>,
    pub llm_fallback_api_key: Option<String>,
    pub llm_fallback_model: String,
    pub event_bus_url: Option<String>,
    pub event_bus_name: String,
    pub model_version: String,
    pub batch_size: i64,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn or_default(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let batch_size = match optional("BATCH_SIZE") {
            Some(raw) => raw.parse().context("BATCH_SIZE must be an integer")?,
            None => 100,
        };

        Ok(Self {
            database_url,
            inference_url: optional("INFERENCE_URL"),
            classifier_url: optional("CLASSIFIER_URL"),
            llm_url: optional("LLM_API_URL"),
            llm_api_key: optional("LLM_API_KEY"),
            llm_model: or_default("LLM_MODEL", "claude-3-5-haiku"),
            llm_fallback_url: optional("LLM_FALLBACK_URL"),
            llm_fallback_api_key: optional("LLM_FALLBACK_API_KEY"),
            llm_fallback_model: or_default("LLM_FALLBACK_MODEL", "gpt-4"),
            event_bus_url: optional("EVENT_BUS_URL"),
            event_bus_name: or_default("EVENT_BUS_NAME", "default"),
            model_version: or_default("MODEL_VERSION", "marketplace-health-v1"),
            batch_size,
        })
    }
}
