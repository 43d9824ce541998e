//! # Credential Minter
//!
//! Exchanges the long-lived provider API key for a short-lived session
//! credential with one authenticated HTTP POST. Called once per session;
//! no retry and no local state. The caller decides whether a failure
//! ends the session (it does).

use crate::config::ProviderConfig;
use crate::error::RelayError;
use serde_json::{json, Value};
use tracing::debug;

/// Mint one ephemeral credential for a new session.
///
/// Fails with [`RelayError::Credential`] on transport errors, non-2xx
/// responses, or a response body without the credential field.
pub async fn mint_credential(
    http: &reqwest::Client,
    provider: &ProviderConfig,
) -> Result<String, RelayError> {
    debug!(url = %provider.sessions_url, "minting ephemeral credential");

    let response = http
        .post(&provider.sessions_url)
        .bearer_auth(&provider.api_key)
        .json(&json!({ "model": provider.model, "voice": "echo" }))
        .send()
        .await
        .map_err(|err| RelayError::Credential(format!("request failed: {}", err)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Credential(format!(
            "provider returned {}: {}",
            status, body
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|err| RelayError::Credential(format!("invalid response body: {}", err)))?;

    extract_client_secret(&body).ok_or_else(|| {
        RelayError::Credential("'client_secret' missing from session response".to_string())
    })
}

/// Pull the ephemeral credential out of the session-creation response.
/// The field is either a bare string or an object with a string `value`.
pub(crate) fn extract_client_secret(body: &Value) -> Option<String> {
    match body.get("client_secret")? {
        Value::String(secret) => Some(secret.clone()),
        Value::Object(obj) => obj
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
