use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::models::{Prediction, PredictionSource};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no inference endpoint configured")]
    NotConfigured,
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed inference response: {0}")]
    Malformed(String),
}

/// One remote model endpoint. Takes the serialized feature row, returns the
/// raw JSON body; shape normalization happens in the adapter.
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    async fn invoke(&self, body: String) -> Result<serde_json::Value, InferenceError>;
}

/// POSTs the feature row as `text/csv`, the wire format the trained models
/// consume.
pub struct HttpInferenceEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpInferenceEndpoint {
    pub fn new(url: String) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl InferenceEndpoint for HttpInferenceEndpoint {
    async fn invoke(&self, body: String) -> Result<serde_json::Value, InferenceError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Normalizes the heterogeneous endpoint responses into canonical records
/// and owns the availability contract: marketplace predictions never fail,
/// they degrade to the conservative default.
#[derive(Clone)]
pub struct InferenceAdapter {
    endpoint: Option<Arc<dyn InferenceEndpoint>>,
    name: String,
}

impl InferenceAdapter {
    pub fn new(endpoint: Arc<dyn InferenceEndpoint>, name: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint),
            name: name.into(),
        }
    }

    pub fn unconfigured(name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Multi-task prediction for marketplace entities. Any failure - missing
    /// endpoint, transport, shape - yields the fixed conservative default so
    /// the pipeline always completes.
    pub async fn predict(&self, features: &[f64]) -> (Prediction, PredictionSource) {
        match self.invoke_raw(features).await.and_then(parse_prediction) {
            Ok(prediction) => (prediction, PredictionSource::Model),
            Err(error) => {
                warn!(endpoint = %self.name, %error, "inference failed, using conservative default");
                (Prediction::conservative_default(), PredictionSource::Fallback)
            }
        }
    }

    /// Scalar risk level (0-3) from the storage-fabric classifier. Errors
    /// propagate so the caller can walk the provider chain.
    pub async fn classify_risk(&self, features: &[f64]) -> Result<f64, InferenceError> {
        let value = self.invoke_raw(features).await?;
        parse_scalar(&value)
            .ok_or_else(|| InferenceError::Malformed(format!("expected scalar risk level, got {value}")))
    }

    async fn invoke_raw(&self, features: &[f64]) -> Result<serde_json::Value, InferenceError> {
        let endpoint = self.endpoint.as_ref().ok_or(InferenceError::NotConfigured)?;
        endpoint.invoke(csv_row(features)).await
    }
}

/// Single CSV row, the exact order the model was trained on.
pub fn csv_row(features: &[f64]) -> String {
    features
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Accepts both response shapes: `{"predictions": [[five floats]]}` in task
/// order, or a keyed map of `field_name -> [value]`.
fn parse_prediction(value: serde_json::Value) -> Result<Prediction, InferenceError> {
    if let Some(outer) = value.get("predictions").and_then(|p| p.as_array()) {
        let row = outer
            .first()
            .and_then(|r| r.as_array())
            .ok_or_else(|| InferenceError::Malformed("empty predictions array".to_string()))?;
        if row.len() < 5 {
            return Err(InferenceError::Malformed(format!(
                "expected 5 task outputs, got {}",
                row.len()
            )));
        }
        let at = |i: usize| {
            row[i]
                .as_f64()
                .ok_or_else(|| InferenceError::Malformed(format!("non-numeric output at {i}")))
        };
        return Ok(Prediction {
            first_session_success: at(0)?,
            session_velocity: at(1)?,
            churn_risk_14d: at(2)?,
            churn_risk_30d: at(3)?,
            health_score: at(4)?,
        });
    }

    let keyed = |field: &str| {
        let entry = value
            .get(field)
            .ok_or_else(|| InferenceError::Malformed(format!("missing field {field}")))?;
        entry
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_f64())
            .or_else(|| entry.as_f64())
            .ok_or_else(|| InferenceError::Malformed(format!("non-numeric field {field}")))
    };

    Ok(Prediction {
        first_session_success: keyed("first_session_success")?,
        session_velocity: keyed("session_velocity")?,
        churn_risk_14d: keyed("churn_risk_14d")?,
        churn_risk_30d: keyed("churn_risk_30d")?,
        health_score: keyed("health_score")?,
    })
}

fn parse_scalar(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_array().and_then(|a| a.first()).and_then(|v| v.as_f64()))
        .or_else(|| {
            value
                .get("predictions")
                .and_then(|p| p.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_f64())
        })
}

#[cfg(test)]
pub mod stub {
    use std::sync::Mutex;

    use super::*;

    /// Scripted endpoint returning canned bodies, or an error when empty.
    pub struct StubEndpoint {
        responses: Mutex<Vec<serde_json::Value>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl StubEndpoint {
        pub fn returning(responses: Vec<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn failing() -> Arc<Self> {
            Self::returning(Vec::new())
        }
    }

    #[async_trait]
    impl InferenceEndpoint for StubEndpoint {
        async fn invoke(&self, body: String) -> Result<serde_json::Value, InferenceError> {
            self.requests.lock().unwrap().push(body);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(InferenceError::Malformed("endpoint unavailable".to_string()));
            }
            Ok(responses.remove(0))
        }
    }
}
