//! Arms reached over HTTP.
//!
//! ```text
//! POST {endpoint}/invoke   Authorization: Bearer <token JWT>
//!                          body: {"token": CapabilityToken, "request": DispatchRequest}
//!                          200 -> ExecutionResult
//! GET  {endpoint}/health   200 -> healthy, other status -> degraded,
//!                          no answer -> unreachable
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::registry::{Arm, ArmHealth};
use crate::sandbox::ExecutionError;
use crate::task::{DispatchRequest, ExecutionResult};
use crate::token::CapabilityToken;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest error body echoed into a failure message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct InvokeBody<'a> {
    token: &'a CapabilityToken,
    request: &'a DispatchRequest,
}

/// HTTP client for one remote arm.
pub struct HttpArm {
    client: Client,
    endpoint: Url,
}

impl HttpArm {
    pub fn new(endpoint: &str) -> Result<Self, url::ParseError> {
        let mut endpoint = Url::parse(endpoint)?;
        // Keep any path prefix when joining "invoke"/"health"
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, route: &str) -> Result<Url, ExecutionError> {
        self.endpoint
            .join(route)
            .map_err(|e| ExecutionError::Failure(format!("bad arm endpoint: {}", e)))
    }
}

#[async_trait]
impl Arm for HttpArm {
    async fn invoke(
        &self,
        token: &CapabilityToken,
        request: &DispatchRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        let wall_clock = request.limits.wall_clock;
        let response = self
            .client
            .post(self.url("invoke")?)
            .bearer_auth(&token.signature)
            .json(&InvokeBody { token, request })
            .timeout(wall_clock)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Timeout { after: wall_clock }
                } else {
                    ExecutionError::Failure(format!("arm {} unreachable: {}", token.issued_to, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Failure(format!(
                "arm {} returned {}: {}",
                token.issued_to,
                status,
                crate::memory::truncate(&body, MAX_ERROR_BODY)
            )));
        }

        response.json::<ExecutionResult>().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout { after: wall_clock }
            } else {
                ExecutionError::Failure(format!("arm {} sent an unreadable result: {}", token.issued_to, e))
            }
        })
    }

    async fn health(&self) -> ArmHealth {
        let Ok(url) = self.url("health") else {
            return ArmHealth::Unreachable;
        };
        match self.client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => ArmHealth::Healthy,
            Ok(response) => {
                tracing::debug!(endpoint = %self.endpoint, status = %response.status(), "Arm reports degraded health");
                ArmHealth::Degraded
            }
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Arm health check failed");
                ArmHealth::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::registry::ArmCapability;
    use crate::sandbox::ResourceLimits;
    use crate::task::fixtures::result_with;
    use crate::task::{Action, AttemptContext, TaskId};
    use crate::token::TokenIssuer;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });
        (format!("http://{}/arm", addr), rx)
    }

    fn token_and_request() -> (CapabilityToken, DispatchRequest) {
        let mut issuer = TokenIssuer::new("secret", Duration::from_secs(60), 1);
        let caps = CapabilitySet::parse(["skill:summarize"]).unwrap();
        let arm = ArmCapability::new("summarizer", caps.clone(), 1, 1);
        let task_id = TaskId::new();
        let token = issuer.issue_for(task_id, 1, caps, &arm).unwrap();
        let request = DispatchRequest {
            task_id,
            step: 1,
            attempt: 1,
            action: Action::Invoke { operation: "summarize".into(), payload: json!({"text": "..."}) },
            attempt_context: AttemptContext::default(),
            prior_results: vec![],
            limits: ResourceLimits::default(),
        };
        (token, request)
    }

    #[tokio::test]
    async fn test_invoke_posts_token_and_request() {
        let expected = result_with(json!("a summary"));
        let (endpoint, request_rx) =
            serve_once("200 OK", serde_json::to_string(&expected).unwrap()).await;
        let arm = HttpArm::new(&endpoint).unwrap();
        let (token, request) = token_and_request();

        let result = arm.invoke(&token, &request).await.unwrap();
        assert_eq!(result.output, json!("a summary"));

        let raw = request_rx.await.unwrap();
        assert!(raw.starts_with("POST /arm/invoke "));
        assert!(raw.contains(&format!("authorization: Bearer {}", token.signature)));
        assert!(raw.contains("\"operation\":\"summarize\""));
    }

    #[tokio::test]
    async fn test_invoke_error_status_is_failure() {
        let (endpoint, _rx) = serve_once("500 Internal Server Error", "{\"error\":\"boom\"}".into()).await;
        let arm = HttpArm::new(&endpoint).unwrap();
        let (token, request) = token_and_request();
        let err = arm.invoke(&token, &request).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Failure(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_health_states() {
        let (endpoint, _rx) = serve_once("200 OK", "{}".into()).await;
        assert_eq!(HttpArm::new(&endpoint).unwrap().health().await, ArmHealth::Healthy);

        let (endpoint, _rx) = serve_once("503 Service Unavailable", "{}".into()).await;
        assert_eq!(HttpArm::new(&endpoint).unwrap().health().await, ArmHealth::Degraded);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let arm = HttpArm::new(&format!("http://{}", addr)).unwrap();
        assert_eq!(arm.health().await, ArmHealth::Unreachable);
    }
}
