//! HTTP plumbing shared by the cloud adapters.

use super::{retry_after_from_headers, CancellationToken, TranscriptionError};
use serde::de::DeserializeOwned;

/// Send `request`, racing it against `token`, and map failures to
/// transcription errors. Returns the parsed JSON body on success.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    token: &CancellationToken,
) -> Result<T, TranscriptionError> {
    token
        .run(async {
            let response = request
                .send()
                .await
                .map_err(TranscriptionError::from_reqwest)?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = retry_after_from_headers(response.headers());
                let body = response.text().await.unwrap_or_default();
                return Err(TranscriptionError::from_status(status, &body, retry_after));
            }

            response
                .json::<T>()
                .await
                .map_err(TranscriptionError::from_reqwest)
        })
        .await
}

/// Render a JSON option value as a form field or query parameter
pub(crate) fn option_value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
