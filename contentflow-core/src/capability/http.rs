//! JSON-over-HTTP capability adapter

use crate::capability::Capability;
use crate::error::CapabilityError;
use crate::models::workflow::{StepOutput, StepPayload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

/// POSTs the step payload to an endpoint and decodes the step output
pub struct HttpCapability {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpCapability {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("Invalid capability endpoint URL")?;
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
        let detail = format!("HTTP {}: {}", status, body.trim());
        if status == StatusCode::TOO_MANY_REQUESTS {
            CapabilityError::RateLimited(detail)
        } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            CapabilityError::Timeout
        } else if status.is_server_error() {
            CapabilityError::ServiceError(detail)
        } else {
            CapabilityError::InvalidPayload(detail)
        }
    }
}

#[async_trait]
impl Capability for HttpCapability {
    async fn invoke(&self, payload: &StepPayload) -> Result<StepOutput, CapabilityError> {
        let mut request = self.client.post(self.endpoint.clone()).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::Timeout
            } else {
                CapabilityError::ServiceError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        response.json::<StepOutput>().await.map_err(|e| {
            CapabilityError::ServiceError(format!("endpoint returned malformed output: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::StepKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Serve a single canned HTTP response and return the endpoint URL
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{}/invoke", address)
    }

    fn payload() -> StepPayload {
        StepPayload {
            session_id: Uuid::new_v4(),
            step: StepKind::VisualGeneration,
            prompt: "spring launch".to_string(),
            upstream: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_http_success() {
        let url = serve_once(
            "200 OK",
            r#"{"step":"visual-generation","data":{"uri":"s3://img/1.png","mime_type":"image/png"}}"#,
        )
        .await;
        let capability = HttpCapability::new(&url, None).unwrap();

        let output = capability.invoke(&payload()).await.unwrap();
        assert_eq!(output.kind(), StepKind::VisualGeneration);
    }

    #[tokio::test]
    async fn test_http_rate_limited() {
        let url = serve_once("429 Too Many Requests", "{}").await;
        let capability = HttpCapability::new(&url, None).unwrap();

        assert!(matches!(
            capability.invoke(&payload()).await,
            Err(CapabilityError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_http_server_error() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        let capability = HttpCapability::new(&url, None).unwrap();

        assert!(matches!(
            capability.invoke(&payload()).await,
            Err(CapabilityError::ServiceError(_))
        ));
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpCapability::new("not a url", None).is_err());
    }
}
