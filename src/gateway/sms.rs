//! SMS transport — HTTP API client for the texting provider.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::{DeliveryReceipt, MessageTransport};

/// SMS provider configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub account_id: String,
    pub auth_token: SecretString,
    pub from_number: String,
}

impl SmsConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMS_API_URL` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("SMS_API_URL").ok()?;
        let account_id = std::env::var("SMS_ACCOUNT_ID").unwrap_or_default();
        let auth_token = SecretString::from(std::env::var("SMS_AUTH_TOKEN").unwrap_or_default());
        let from_number = std::env::var("SMS_FROM_NUMBER").unwrap_or_default();

        Some(Self {
            api_url,
            account_id,
            auth_token,
            from_number,
        })
    }
}

pub struct SmsTransport {
    config: SmsConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: String,
}

impl SmsTransport {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageTransport for SmsTransport {
    fn name(&self) -> &str {
        "sms"
    }

    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError> {
        let url = format!(
            "{}/accounts/{}/messages",
            self.config.api_url.trim_end_matches('/'),
            self.config.account_id
        );

        debug!(%to, "Dispatching SMS");
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.auth_token.expose_secret())
            .json(&serde_json::json!({
                "to": to,
                "from": self.config.from_number,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GatewayError::AuthFailed { name: "sms".into() });
        }
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
                message: "bad request".into(),
            });
            return Err(GatewayError::InvalidRecipient {
                recipient: to.to_string(),
                reason: body.message,
            });
        }
        if !status.is_success() {
            return Err(GatewayError::SendFailed {
                name: "sms".into(),
                reason: format!("provider returned {status}"),
            });
        }

        let parsed: SendResponse =
            response
                .json()
                .await
                .map_err(|e| GatewayError::SendFailed {
                    name: "sms".into(),
                    reason: format!("unreadable provider response: {e}"),
                })?;

        Ok(DeliveryReceipt {
            provider_message_id: parsed.message_id,
        })
    }
}
