//! HTTP plumbing shared by the adapters: endpoint URLs, auth headers and
//! mapping transport failures and error statuses onto [`ProviderError`].

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::ProviderKind;
use crate::core::chat_stream::api_error_message;
use crate::core::error::ProviderError;

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Joins a base URL and an endpoint path without doubling slashes.
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Anthropic takes `x-api-key` plus a version header; everyone else takes a
/// bearer token.
pub(crate) fn with_auth(
    request: RequestBuilder,
    provider: ProviderKind,
    credential: &str,
) -> RequestBuilder {
    match provider {
        ProviderKind::Anthropic => request
            .header("x-api-key", credential)
            .header("anthropic-version", ANTHROPIC_VERSION),
        _ => request.header("Authorization", format!("Bearer {credential}")),
    }
}

pub(crate) fn transport_error(provider: ProviderKind, err: &reqwest::Error) -> ProviderError {
    if err.is_decode() {
        return ProviderError::api(provider, format!("invalid response body: {err}"));
    }
    ProviderError::Unavailable {
        provider,
        message: err.to_string(),
    }
}

/// Sends the request and turns non-success statuses into typed errors.
pub(crate) async fn send(
    provider: ProviderKind,
    request: RequestBuilder,
) -> Result<Response, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|err| transport_error(provider, &err))?;
    check_status(provider, response).await
}

async fn check_status(provider: ProviderKind, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = api_error_message(&body);
    debug!(provider = %provider, status = status.as_u16(), %message, "Provider returned error status");

    Err(match status.as_u16() {
        401 | 403 => ProviderError::Authentication { provider, message },
        429 => ProviderError::RateLimited {
            provider,
            retry_after,
            message,
        },
        code => ProviderError::Api {
            provider,
            status: Some(code),
            message,
        },
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: ProviderKind,
    response: Response,
) -> Result<T, ProviderError> {
    let body = response
        .bytes()
        .await
        .map_err(|err| transport_error(provider, &err))?;
    serde_json::from_slice(&body)
        .map_err(|err| ProviderError::api(provider, format!("invalid response body: {err}")))
}

/// Reads a credential, failing with an authentication error naming the
/// variable when it is missing or blank.
pub(crate) fn require_env(
    provider: ProviderKind,
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
) -> Result<String, ProviderError> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProviderError::Authentication {
            provider,
            message: format!("Missing env var: {name}"),
        })
}
