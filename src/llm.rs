use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::models::{Alert, AlertType, Insight, Metrics, MetricsRecord, PredictionType};
use crate::nodes::{AnalysisSource, NodeAssessment};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

/// Alert-path insights live longer than pipeline insights; they feed weekly
/// operational reviews.
const ALERT_INSIGHT_TTL_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no completion service configured")]
    NotConfigured,
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion response missing content")]
    MissingContent,
    #[error("response does not contain a JSON object")]
    MissingJson,
    #[error("response JSON missing field {0}")]
    MissingField(&'static str),
    #[error("unsupported alert type {0}")]
    UnsupportedAlert(String),
    #[error("invalid JSON in response: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A text-completion provider. Implementations are interchangeable; the
/// router only needs prompt-in, text-out.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat-completions client with bounded retries on
/// throttling and timeouts.
pub struct ChatCompletionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionClient {
    pub fn new(url: String, api_key: Option<String>, model: String) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
            model,
        })
    }

    async fn request(&self, prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.7,
            "max_tokens": 1000,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: serde_json::Value = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(LlmError::MissingContent)
    }
}

#[async_trait]
impl CompletionService for ChatCompletionClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.request(prompt).await {
                Ok(text) => return Ok(text),
                Err(error) => {
                    let retryable = matches!(
                        &error,
                        LlmError::Http(e) if e.is_timeout()
                            || e.status().is_some_and(|s| s.as_u16() == 429)
                    );
                    if !retryable || attempt >= MAX_RETRIES {
                        return Err(error);
                    }
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS << attempt);
                    warn!(model = %self.model, attempt, %error, "completion failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Primary completion provider with an optional secondary tried before any
/// caller-side deterministic fallback.
pub struct LlmRouter {
    primary: Option<Arc<dyn CompletionService>>,
    fallback: Option<Arc<dyn CompletionService>>,
}

impl LlmRouter {
    pub fn new(
        primary: Option<Arc<dyn CompletionService>>,
        fallback: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        Self { primary, fallback }
    }

    pub fn unconfigured() -> Self {
        Self {
            primary: None,
            fallback: None,
        }
    }

    /// Returns the completion text and the model label to record, falling
    /// back to the secondary provider when the primary fails.
    async fn complete(&self, prompt: &str) -> Result<(String, String), LlmError> {
        let primary_error = match &self.primary {
            Some(primary) => match primary.complete(prompt).await {
                Ok(text) => return Ok((text, primary.model_name().to_string())),
                Err(error) => {
                    warn!(%error, "primary completion service failed, trying fallback");
                    Some(error)
                }
            },
            None => None,
        };

        match &self.fallback {
            Some(fallback) => {
                let text = fallback.complete(prompt).await?;
                let label = if self.primary.is_some() {
                    format!("{}-fallback", fallback.model_name())
                } else {
                    fallback.model_name().to_string()
                };
                Ok((text, label))
            }
            None => Err(primary_error.unwrap_or(LlmError::NotConfigured)),
        }
    }

    /// Builds one qualitative insight from an alert. Missing JSON or missing
    /// required fields fail this insight outright; there is no rules
    /// fallback on the alert path.
    pub async fn generate_alert_insight(
        &self,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> Result<Insight, LlmError> {
        let prompt = build_alert_prompt(alert)?;
        let (text, model_used) = self.complete(&prompt).await?;

        let parsed: serde_json::Value = serde_json::from_str(extract_json(&text)?)?;
        let risk_score = parsed
            .get("risk_score")
            .and_then(|v| v.as_f64())
            .ok_or(LlmError::MissingField("risk_score"))?;
        let explanation = parsed
            .get("explanation")
            .and_then(|v| v.as_str())
            .ok_or(LlmError::MissingField("explanation"))?
            .to_string();
        let recommendations = parsed
            .get("recommendations")
            .and_then(|v| v.as_array())
            .ok_or(LlmError::MissingField("recommendations"))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        Ok(Insight {
            insight_id: format!(
                "{}_{}_{}",
                alert.alert_type,
                alert.entity_id,
                now.timestamp_millis()
            ),
            related_entity: alert.entity_id.clone(),
            prediction_type: prediction_type_for_alert(alert.alert_type)?,
            risk_score: risk_score.round() as i64,
            explanation,
            recommendations,
            confidence: AnalysisSource::Llm.confidence(),
            model_used,
            created_at: now,
            expires_at: now + chrono::Duration::days(ALERT_INSIGHT_TTL_DAYS),
        })
    }

    /// Qualitative node analysis, second rung of the storage provider chain.
    /// Unlike the alert path, absent fields default rather than fail; only a
    /// missing or unparseable JSON block errors out to the rules fallback.
    pub async fn node_assessment(
        &self,
        record: &MetricsRecord,
    ) -> Result<(NodeAssessment, String), LlmError> {
        let prompt = build_node_prompt(record);
        let (text, model_used) = self.complete(&prompt).await?;

        let parsed: serde_json::Value = serde_json::from_str(extract_json(&text)?)?;
        let assessment = NodeAssessment {
            risk_score: parsed
                .get("risk_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .round() as i64,
            analysis: parsed
                .get("analysis")
                .and_then(|v| v.as_str())
                .unwrap_or("No analysis provided")
                .to_string(),
            recommendations: parsed
                .get("recommendations")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        };

        Ok((assessment, model_used))
    }
}

/// First top-level `{...}` block in the completion text; models often wrap
/// the JSON in prose or markdown fences.
pub fn extract_json(text: &str) -> Result<&str, LlmError> {
    let start = text.find('{').ok_or(LlmError::MissingJson)?;
    let end = text.rfind('}').ok_or(LlmError::MissingJson)?;
    if end < start {
        return Err(LlmError::MissingJson);
    }
    Ok(&text[start..=end])
}

fn detail_num(alert: &Alert, key: &str) -> f64 {
    alert.details.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn detail_str<'a>(alert: &'a Alert, key: &str) -> &'a str {
    alert
        .details
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

fn build_alert_prompt(alert: &Alert) -> Result<String, LlmError> {
    match alert.alert_type {
        AlertType::HighIbCallFrequency => Ok(format!(
            "Analyze this student's behavior and predict churn risk:\n\n\
             Student ID: {}\n\
             IB Calls (14 days): {}\n\
             Health Score: {}\n\n\
             Provide a JSON response with:\n\
             1. \"risk_score\": A number between 0-100 representing churn risk\n\
             2. \"explanation\": A clear explanation of why this student is at risk\n\
             3. \"recommendations\": An array of 2-3 specific actions to prevent churn\n\n\
             Format your response as valid JSON only, no additional text.",
            alert.entity_id,
            detail_num(alert, "ib_calls_14d"),
            detail_num(alert, "health_score"),
        )),
        AlertType::LowHealthScore => Ok(format!(
            "Analyze this student's health metrics and predict churn risk:\n\n\
             Student ID: {}\n\
             Health Score: {}\n\
             Sessions (7 days): {}\n\
             IB Calls (14 days): {}\n\n\
             Provide a JSON response with:\n\
             1. \"risk_score\": A number between 0-100 representing churn risk\n\
             2. \"explanation\": A clear explanation of concerning patterns\n\
             3. \"recommendations\": An array of 2-3 specific interventions\n\n\
             Format your response as valid JSON only, no additional text.",
            alert.entity_id,
            detail_num(alert, "health_score"),
            detail_num(alert, "sessions_7d"),
            detail_num(alert, "ib_calls_14d"),
        )),
        AlertType::SupplyDemandImbalance => Ok(format!(
            "Analyze this supply/demand imbalance and recommend actions:\n\n\
             Subject: {}\n\
             Balance Status: {}\n\
             Demand Score: {}\n\
             Supply Score: {}\n\n\
             Provide a JSON response with:\n\
             1. \"risk_score\": A number between 0-100 representing business impact\n\
             2. \"explanation\": Why this imbalance is occurring\n\
             3. \"recommendations\": An array of 2-3 specific actions to address it\n\n\
             Format your response as valid JSON only, no additional text.",
            alert.entity_id,
            detail_str(alert, "balance_status"),
            detail_num(alert, "demand_score"),
            detail_num(alert, "supply_score"),
        )),
        AlertType::HighRiskDetected => {
            Err(LlmError::UnsupportedAlert(alert.alert_type.to_string()))
        }
    }
}

fn prediction_type_for_alert(alert_type: AlertType) -> Result<PredictionType, LlmError> {
    match alert_type {
        AlertType::HighIbCallFrequency => Ok(PredictionType::HighIbCallFrequency),
        AlertType::LowHealthScore => Ok(PredictionType::LowHealthScore),
        AlertType::SupplyDemandImbalance => Ok(PredictionType::SupplyDemandImbalance),
        AlertType::HighRiskDetected => {
            Err(LlmError::UnsupportedAlert(alert_type.to_string()))
        }
    }
}

fn build_node_prompt(record: &MetricsRecord) -> String {
    let m: &Metrics = &record.metrics;
    format!(
        "You are an expert in InfiniBand storage protocols and high-performance \
         computing infrastructure.\n\n\
         Analyze the following InfiniBand storage metrics and provide insights:\n\n\
         Node {}: IOPS={}, Latency={}ms, ErrorRate={}%, Throughput={}MB/s, \
         QueueDepth={}, Connections={}\n\n\
         Provide your analysis in the following JSON format:\n\
         {{\n\
           \"risk_score\": <number 0-100>,\n\
           \"analysis\": \"<detailed analysis of the metrics>\",\n\
           \"recommendations\": [\"<recommendation 1>\", \"<recommendation 2>\", ...]\n\
         }}\n\n\
         Focus on:\n\
         1. IOPS bottlenecks and throughput issues\n\
         2. Latency patterns indicating network congestion\n\
         3. Error rates suggesting hardware or protocol issues\n\
         4. Queue depth indicating saturation\n\
         5. Connection patterns and their impact on performance\n\n\
         Return ONLY the JSON object, no additional text.",
        record.entity_id,
        m.iops.unwrap_or(0.0),
        m.latency_ms.unwrap_or(0.0),
        m.error_rate_pct.unwrap_or(0.0),
        m.throughput_mbps.unwrap_or(0.0),
        m.queue_depth.unwrap_or(0.0),
        m.active_connections.unwrap_or(0.0),
    )
}
