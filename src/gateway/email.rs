//! Email notifier — SMTP via lettre, used for owner-facing notifications
//! (new booking confirmations). Lead-facing traffic stays on SMS.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::GatewayError;

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Business owner's address for booking notifications.
    pub notify_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (notifications disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let notify_address = std::env::var("OWNER_NOTIFY_ADDRESS").unwrap_or_default();

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
            notify_address,
        })
    }
}

pub struct EmailNotifier {
    config: SmtpConfig,
}

impl EmailNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Send a notification email to the configured owner address.
    ///
    /// SMTP via lettre is blocking, so the send runs in `spawn_blocking`.
    pub async fn notify_owner(&self, subject: &str, body: &str) -> Result<(), GatewayError> {
        if self.config.notify_address.is_empty() {
            return Ok(());
        }

        let config = self.config.clone();
        let subject = subject.to_string();
        let body = body.to_string();

        tokio::task::spawn_blocking(move || send_email(&config, &subject, &body))
            .await
            .map_err(|e| GatewayError::SendFailed {
                name: "email".into(),
                reason: format!("notification task panicked: {e}"),
            })?
    }
}

fn send_email(config: &SmtpConfig, subject: &str, body: &str) -> Result<(), GatewayError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| GatewayError::SendFailed {
            name: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(config.from_address.parse().map_err(|e| {
            GatewayError::SendFailed {
                name: "email".into(),
                reason: format!("Invalid from address: {e}"),
            }
        })?)
        .to(config.notify_address.parse().map_err(|e| {
            GatewayError::SendFailed {
                name: "email".into(),
                reason: format!("Invalid notify address: {e}"),
            }
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| GatewayError::SendFailed {
            name: "email".into(),
            reason: format!("Failed to build email: {e}"),
        })?;

    transport.send(&email).map_err(|e| GatewayError::SendFailed {
        name: "email".into(),
        reason: format!("SMTP send failed: {e}"),
    })?;

    tracing::info!("Owner notification sent");
    Ok(())
}
