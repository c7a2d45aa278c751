//! Network fetches limited to the host a token grants.

use tokio_util::sync::CancellationToken;

use super::{ExecutionError, ResourceLimits};

/// HTTP client that never follows redirects, so a granted host cannot
/// bounce a request somewhere else.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) struct FetchOutput {
    pub status: u16,
    pub body: String,
    pub truncated: bool,
}

pub(crate) async fn http_get(
    client: &reqwest::Client,
    url: &str,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<FetchOutput, ExecutionError> {
    let fetch = async {
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecutionError::Failure(format!("GET {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ExecutionError::Failure(format!("reading {} failed: {}", url, e)))?
        {
            let room = limits.max_output_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(FetchOutput {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
            truncated,
        })
    };

    tokio::select! {
        result = tokio::time::timeout(limits.wall_clock, fetch) => match result {
            Ok(output) => output,
            Err(_) => Err(ExecutionError::Timeout { after: limits.wall_clock }),
        },
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
    }
}
