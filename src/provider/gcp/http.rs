//! REST plumbing shared by the per-service clients
//!
//! Thin wrapper over reqwest that attaches the bearer token, decodes the
//! standard Google error envelope, and classifies failures into the
//! provider error taxonomy.

use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use super::GcpContext;
use crate::provider::error::classify_status;
use crate::provider::ProviderError;

/// Extract the human-readable message from a Google error envelope.
fn error_message(body: &Value) -> String {
    body.pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_string()
}

impl GcpContext {
    /// Send a request and decode the JSON response.
    ///
    /// Non-2xx responses are classified into the provider taxonomy with the
    /// message from the error envelope.
    pub(super) async fn request(
        &self,
        method: Method,
        url: &str,
        kind: &'static str,
        id: &str,
        body: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let token = self.token.token(&self.http).await?;

        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        debug!(method = %method, url = %url, "API request");
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if (200..300).contains(&status) {
            Ok(payload)
        } else {
            Err(classify_status(status, kind, id, &error_message(&payload)))
        }
    }

    /// GET that maps 404 to `Ok(None)`, for state lookups.
    pub(super) async fn get_opt(
        &self,
        url: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<Option<Value>, ProviderError> {
        match self.request(Method::GET, url, kind, id, None).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_reads_envelope() {
        let body = serde_json::json!({
            "error": {"code": 403, "message": "Permission denied on secret"}
        });
        assert_eq!(error_message(&body), "Permission denied on secret");
        assert_eq!(error_message(&Value::Null), "no error message");
    }
}
