//! Structure inference collaborator
//!
//! The model that looks at HTML samples and proposes selectors lives outside
//! this crate. It is reached through [`StructureInference`]; the default
//! implementation POSTs JSON to an HTTP endpoint.

use crate::config::AnalyzerConfig;
use crate::site::{CrawlFrequency, PaginationPattern, Selectors};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an inference call
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed inference answer: {0}")]
    Malformed(String),

    #[error("no inference endpoint configured")]
    NotConfigured,
}

/// One fetched page handed to inference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSample {
    pub url: String,
    pub html: String,
}

/// What is sent to the inference collaborator
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub domain: String,

    /// The listing page first, then sample detail pages
    pub samples: Vec<PageSample>,

    /// 1 for the first call, incremented on every retry
    pub attempt: u32,

    /// Why the previous answer was rejected
    pub feedback: Option<String>,
}

fn default_pagination() -> PaginationPattern {
    PaginationPattern::None
}

/// A proposed site structure
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InferredStructure {
    pub selectors: Selectors,

    #[serde(default = "default_pagination")]
    pub pagination: PaginationPattern,

    /// Field names the model considers extractable from the samples
    #[serde(default)]
    pub fields: Vec<String>,

    /// The model's own confidence, 0-10
    #[serde(default)]
    pub quality_hint: Option<f64>,

    #[serde(default)]
    pub suggested_rate_limit_seconds: Option<f64>,

    #[serde(default)]
    pub suggested_workers: Option<u32>,

    #[serde(default)]
    pub recommended_frequency: Option<CrawlFrequency>,

    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// Proposes selectors and pagination for a site from HTML samples
#[async_trait]
pub trait StructureInference: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferredStructure, InferenceError>;
}

/// Inference over HTTP: the request is POSTed as JSON, the answer is an
/// [`InferredStructure`] JSON object
pub struct HttpStructureInference {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpStructureInference {
    pub fn new(client: Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Builds the client from the analyzer configuration
    ///
    /// # Returns
    ///
    /// * `Ok(HttpStructureInference)` - Ready to call the endpoint
    /// * `Err(InferenceError::NotConfigured)` - No endpoint was configured
    pub fn from_config(config: &AnalyzerConfig, client: Client) -> Result<Self, InferenceError> {
        let endpoint = config
            .inference_endpoint
            .clone()
            .ok_or(InferenceError::NotConfigured)?;
        Ok(Self::new(client, endpoint, config.inference_timeout()))
    }

    async fn call(&self, request: &InferenceRequest) -> Result<InferredStructure, InferenceError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| InferenceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl StructureInference for HttpStructureInference {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferredStructure, InferenceError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            domain = %request.domain,
            attempt = request.attempt,
            samples = request.samples.len(),
            "Calling structure inference"
        );

        tokio::time::timeout(self.timeout, self.call(request))
            .await
            .map_err(|_| InferenceError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> InferenceRequest {
        InferenceRequest {
            domain: "example.com".to_string(),
            samples: vec![PageSample {
                url: "https://example.com/list".to_string(),
                html: "<html></html>".to_string(),
            }],
            attempt: 2,
            feedback: Some("card selector matched nothing".to_string()),
        }
    }

    #[test]
    fn test_structure_defaults() {
        let structure: InferredStructure =
            serde_json::from_str(r#"{"selectors": {"card": "li.item"}}"#).unwrap();
        assert_eq!(structure.pagination, PaginationPattern::None);
        assert!(structure.fields.is_empty());
        assert!(structure.suggested_workers.is_none());
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let config = AnalyzerConfig::default();
        assert!(matches!(
            HttpStructureInference::from_config(&config, Client::new()),
            Err(InferenceError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_http_inference_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .and(body_string_contains("\"attempt\":2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "selectors": {"card": "div.card", "fields": {"price": ".price"}},
                "pagination": {"type": "query_param", "param": "page", "start": 1},
                "fields": ["price"],
                "quality_hint": 8.5,
                "recommended_frequency": "hourly"
            })))
            .mount(&server)
            .await;

        let inference = HttpStructureInference::new(
            Client::new(),
            format!("{}/infer", server.uri()),
            Duration::from_secs(5),
        );
        let structure = inference.infer(&request()).await.unwrap();
        assert_eq!(structure.selectors.card, "div.card");
        assert_eq!(structure.fields, vec!["price"]);
        assert_eq!(structure.recommended_frequency, Some(CrawlFrequency::Hourly));
        assert_eq!(
            structure.pagination,
            PaginationPattern::QueryParam {
                param: "page".to_string(),
                start: 1
            }
        );
    }

    #[tokio::test]
    async fn test_http_inference_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let inference =
            HttpStructureInference::new(Client::new(), server.uri(), Duration::from_secs(5));
        let err = inference.infer(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_http_inference_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{}")
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let inference =
            HttpStructureInference::new(Client::new(), server.uri(), Duration::from_millis(50));
        let err = inference.infer(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_http_inference_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let inference =
            HttpStructureInference::new(Client::new(), server.uri(), Duration::from_secs(5));
        let err = inference.infer(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }
}
