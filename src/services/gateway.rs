use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::fingerprint::EmbedContent;
use crate::core::model::EmbeddingKind;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Embedding service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed embedding response: {message}")]
    Protocol { message: String },

    #[error("Embedding service unavailable: {message}")]
    Unavailable { message: String },
}

#[derive(Debug, Clone)]
pub struct EmbedItem {
    pub file_id: String,
    pub content: EmbedContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedVector {
    pub file_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedFailure {
    pub file_id: String,
    pub error: String,
}

/// Result of one batch call. A non-empty `failures` list is a partial failure:
/// the successful subset is still usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedResponse {
    #[serde(default)]
    pub results: Vec<EmbeddedVector>,
    #[serde(default)]
    pub failures: Vec<EmbedFailure>,
}

impl EmbedResponse {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// External embedding provider. Every call carries items of a single kind;
/// the engine caps batch size and applies its own deadline around the call.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(
        &self,
        kind: EmbeddingKind,
        items: Vec<EmbedItem>,
    ) -> Result<EmbedResponse, GatewayError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    kind: EmbeddingKind,
    items: Vec<WireItem<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireItem<'a> {
    file_id: &'a str,
    content: String,
}

/// JSON-over-HTTP client for the embedding service.
pub struct HttpEmbeddingGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, kind: EmbeddingKind) -> String {
        format!("{}/embeddings/{}", self.base_url, kind.as_str())
    }

    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("Embedding service health check failed: {}", e);
                false
            }
        }
    }

    fn encode_item(item: &EmbedItem) -> WireItem<'_> {
        let content = match &item.content {
            EmbedContent::Text(text) => text.clone(),
            EmbedContent::Image(png) => BASE64.encode(png),
        };
        WireItem {
            file_id: &item.file_id,
            content,
        }
    }
}

#[async_trait]
impl EmbeddingGateway for HttpEmbeddingGateway {
    async fn embed(
        &self,
        kind: EmbeddingKind,
        items: Vec<EmbedItem>,
    ) -> Result<EmbedResponse, GatewayError> {
        if items.is_empty() {
            return Ok(EmbedResponse::default());
        }

        let request = WireRequest {
            kind,
            items: items.iter().map(Self::encode_item).collect(),
        };

        let response = self
            .client
            .post(self.endpoint(kind))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Unavailable {
                        message: format!("request timed out: {}", e),
                    }
                } else {
                    GatewayError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice::<EmbedResponse>(&bytes).map_err(|e| GatewayError::Protocol {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_per_kind() {
        let gateway =
            HttpEmbeddingGateway::new("http://localhost:3002/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            gateway.endpoint(EmbeddingKind::Text),
            "http://localhost:3002/embeddings/text"
        );
        assert_eq!(
            gateway.endpoint(EmbeddingKind::Image),
            "http://localhost:3002/embeddings/image"
        );
    }

    #[test]
    fn test_request_wire_format() {
        let items = vec![
            EmbedItem {
                file_id: "t1".to_string(),
                content: EmbedContent::Text("hello".to_string()),
            },
            EmbedItem {
                file_id: "i1".to_string(),
                content: EmbedContent::Image(vec![1, 2, 3]),
            },
        ];
        let request = WireRequest {
            kind: EmbeddingKind::Text,
            items: items.iter().map(HttpEmbeddingGateway::encode_item).collect(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["items"][0]["fileId"], "t1");
        assert_eq!(json["items"][0]["content"], "hello");
        assert_eq!(json["items"][1]["content"], "AQID");
    }

    #[test]
    fn test_response_failures_default_to_empty() {
        let response: EmbedResponse =
            serde_json::from_str(r#"{ "results": [{ "fileId": "a", "vector": [0.5, 0.25] }] }"#)
                .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].vector, vec![0.5, 0.25]);
        assert!(!response.is_partial());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let gateway =
            HttpEmbeddingGateway::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let result = gateway
            .embed(
                EmbeddingKind::Text,
                vec![EmbedItem {
                    file_id: "a".to_string(),
                    content: EmbedContent::Text("x".to_string()),
                }],
            )
            .await;
        assert!(result.is_err());
        assert!(!gateway.health_check().await);
    }
}
