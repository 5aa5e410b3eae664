//! HTTP transport for api_call tasks.
//!
//! Sends the rendered context payload as JSON and returns the response
//! body. Non-2xx statuses map to `TaskError::Http` so the engine can
//! classify 429/5xx as transient and everything else as fatal.

use stagegate_core::task::HttpCaller;
use stagegate_types::error::TaskError;

/// Response bodies longer than this are truncated in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// `HttpCaller` backed by a shared [`reqwest::Client`].
#[derive(Clone, Default)]
pub struct ReqwestCaller {
    client: reqwest::Client,
}

impl ReqwestCaller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpCaller for ReqwestCaller {
    async fn call(
        &self,
        method: &str,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<String, TaskError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| TaskError::Failed(format!("invalid HTTP method '{method}'")))?;

        let mut request = self.client.request(method.clone(), endpoint);
        // GET carries the payload in no body; everything else posts JSON.
        if method != reqwest::Method::GET {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(TaskError::Http {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        Ok(body)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TaskError {
    TaskError::Network(err.to_string())
}
