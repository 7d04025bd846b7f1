//! IBM watsonx.ai adapter.
//!
//! An IAM access token is exchanged for the API key and cached until shortly
//! before it expires. watsonx has no streaming path here, so `stream_turn`
//! falls back to a single complete reply.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::http::{self, construct_api_url, with_auth};
use super::openai::{reply_from_completion, to_chat_messages, to_chat_tools};
use super::{ChatProvider, ProviderKind, ProviderReply, TurnRequest};
use crate::api::watsonx::{IamTokenResponse, WatsonxChatRequest};
use crate::api::ChatCompletion;
use crate::core::error::ProviderError;

const KIND: ProviderKind = ProviderKind::Watsonx;
const CHAT_API_VERSION: &str = "2024-10-08";
const MAX_TOKENS: u32 = 4096;
/// Tokens are refreshed this many seconds before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

pub const IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";
pub const WATSONX_API_KEY_ENV: &str = "WATSONX_IAM_API_KEY";
pub const WATSONX_PROJECT_ENV: &str = "WATSONX_PROJECT";
pub const WATSONX_URL_ENV: &str = "WATSONX_URL";

#[derive(Debug, Clone)]
struct IamToken {
    access_token: String,
    expires_at: i64,
}

impl IamToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_REFRESH_MARGIN_SECS < self.expires_at
    }
}

pub struct WatsonxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    project_id: String,
    iam_url: String,
    token: Mutex<Option<IamToken>>,
}

impl WatsonxProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        project_id: String,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            project_id,
            iam_url: IAM_TOKEN_URL.to_string(),
            token: Mutex::new(None),
        }
    }

    /// `WATSONX_URL`, when set, overrides the configured regional endpoint.
    pub fn from_env(
        client: reqwest::Client,
        base_url: String,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = http::require_env(KIND, lookup, WATSONX_API_KEY_ENV)?;
        let project_id = http::require_env(KIND, lookup, WATSONX_PROJECT_ENV)?;
        let base_url = lookup(WATSONX_URL_ENV)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(base_url);
        Ok(Self::new(client, base_url, api_key, project_id))
    }

    pub fn with_iam_url(mut self, iam_url: impl Into<String>) -> Self {
        self.iam_url = iam_url.into();
        self
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(now)) {
            return Ok(token.access_token.clone());
        }

        debug!(url = %self.iam_url, "Requesting IAM access token");
        let request = self
            .client
            .post(&self.iam_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", self.api_key.as_str()),
            ]);
        // IAM answers an unknown key with 400 rather than 401.
        let response = http::send(KIND, request).await.map_err(|err| match err {
            ProviderError::Api {
                status: Some(400),
                message,
                ..
            } => ProviderError::Authentication {
                provider: KIND,
                message,
            },
            other => other,
        })?;
        let body: IamTokenResponse = http::read_json(KIND, response).await?;
        let expires_at = body
            .expiration
            .or_else(|| body.expires_in.map(|secs| now + secs))
            .unwrap_or(now + DEFAULT_TOKEN_LIFETIME_SECS);
        let token = IamToken {
            access_token: body.access_token,
            expires_at,
        };
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl ChatProvider for WatsonxProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<ProviderReply, ProviderError> {
        request.check_content(KIND)?;
        let token = self.access_token().await?;
        let body = WatsonxChatRequest {
            model_id: request.model.to_string(),
            project_id: self.project_id.clone(),
            messages: to_chat_messages(request),
            tools: to_chat_tools(request.wire_tools()),
            max_tokens: MAX_TOKENS,
        };
        debug!(
            model = %body.model_id,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "Sending watsonx chat request"
        );

        let url = format!(
            "{}?version={CHAT_API_VERSION}",
            construct_api_url(&self.base_url, "ml/v1/text/chat")
        );
        let response = match http::send(
            KIND,
            with_auth(self.client.post(url), KIND, &token).json(&body),
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, ProviderError::Authentication { .. }) {
                    self.clear_token().await;
                }
                return Err(err);
            }
        };
        let completion: ChatCompletion = http::read_json(KIND, response).await?;
        reply_from_completion(KIND, completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{ContentBlock, Message};
    use crate::core::providers::ReplyKind;
    use crate::core::registry::ProviderCapability;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GRANITE: ProviderCapability = ProviderCapability {
        supports_images: false,
        supports_tools: true,
    };

    async fn mount_iam(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/identity/token"))
            .and(body_string_contains("apikey=iam-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-1",
                "expiration": Utc::now().timestamp() + 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> WatsonxProvider {
        WatsonxProvider::new(
            reqwest::Client::new(),
            server.uri(),
            "iam-key".to_string(),
            "proj-1".to_string(),
        )
        .with_iam_url(format!("{}/identity/token", server.uri()))
    }

    #[tokio::test]
    async fn token_is_cached_across_turns() {
        let server = MockServer::start().await;
        mount_iam(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/ml/v1/text/chat"))
            .and(query_param("version", CHAT_API_VERSION))
            .and(header("Authorization", "Bearer tok-1"))
            .and(body_string_contains("\"project_id\":\"proj-1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "2 + 2 = 4"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 8, "completion_tokens": 6}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let messages = vec![Message::user(vec![ContentBlock::text("What's 2+2?")])];
        let request = TurnRequest::new("ibm/granite-3-8b-instruct", &messages, GRANITE);
        for _ in 0..2 {
            let reply = provider.send_turn(&request).await.unwrap();
            assert_eq!(
                reply.kind,
                ReplyKind::AssistantTurn {
                    text: "2 + 2 = 4".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn rejected_api_key_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identity/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errorCode": "BXNIM0415E",
                "errorMessage": "Provided API key could not be found."
            })))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let messages = vec![Message::user(vec![ContentBlock::text("hi")])];
        let err = provider
            .send_turn(&TurnRequest::new("ibm/granite-3-8b-instruct", &messages, GRANITE))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Authentication { ref message, .. } if message == "Provided API key could not be found."
        ));
    }

    #[tokio::test]
    async fn images_are_rejected_before_any_request() {
        let server = MockServer::start().await;
        mount_iam(&server, 0).await;
        let provider = provider(&server);
        let messages = vec![Message::user(vec![ContentBlock::Image {
            mime_type: "image/png".to_string(),
            data: vec![0],
            name: None,
        }])];
        let err = provider
            .send_turn(&TurnRequest::new("ibm/granite-3-8b-instruct", &messages, GRANITE))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedContent { .. }));
    }

    #[test]
    fn env_overrides_regional_url() {
        let lookup = |name: &str| match name {
            WATSONX_API_KEY_ENV => Some("key".to_string()),
            WATSONX_PROJECT_ENV => Some("proj".to_string()),
            WATSONX_URL_ENV => Some("https://eu-de.ml.cloud.ibm.com".to_string()),
            _ => None,
        };
        let provider = WatsonxProvider::from_env(
            reqwest::Client::new(),
            "https://us-south.ml.cloud.ibm.com".to_string(),
            &lookup,
        )
        .unwrap();
        assert_eq!(provider.base_url, "https://eu-de.ml.cloud.ibm.com");

        let missing_project = |name: &str| (name == WATSONX_API_KEY_ENV).then(|| "key".to_string());
        assert!(matches!(
            WatsonxProvider::from_env(reqwest::Client::new(), String::new(), &missing_project),
            Err(ProviderError::Authentication { ref message, .. }) if message.contains(WATSONX_PROJECT_ENV)
        ));
    }

    #[test]
    fn token_freshness_respects_margin() {
        let token = IamToken {
            access_token: "t".to_string(),
            expires_at: 1_000,
        };
        assert!(token.is_fresh(900));
        assert!(!token.is_fresh(950));
    }
}
