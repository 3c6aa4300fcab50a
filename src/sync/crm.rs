//! HTTP CRM adapter.
//!
//! Maps the full internal lead and booking shape into the CRM's JSON
//! payloads — contact email, address, schedule window, and technician all
//! travel with the request.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::conductor::lead::Lead;
use crate::error::SyncError;
use crate::scheduling::Slot;
use crate::store::Booking;
use crate::sync::CrmIntegration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpCrmConfig {
    pub base_url: String,
    pub api_key: SecretString,
}

impl HttpCrmConfig {
    /// Build config from environment variables.
    /// Returns `None` if `CRM_API_URL` is not set (sync disabled).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CRM_API_URL").ok()?;
        let api_key = SecretString::from(std::env::var("CRM_API_KEY").unwrap_or_default());
        Some(Self { base_url, api_key })
    }
}

pub struct HttpCrm {
    config: HttpCrmConfig,
    client: reqwest::Client,
}

impl HttpCrm {
    pub fn new(config: HttpCrmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, SyncError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(self.config.api_key.expose_secret())
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout {
                        name: "http_crm".into(),
                        timeout: REQUEST_TIMEOUT,
                    }
                } else {
                    SyncError::RequestFailed {
                        name: "http_crm".into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RequestFailed {
                name: "http_crm".into(),
                reason: format!("HTTP {status}"),
            });
        }

        response.json().await.map_err(|e| SyncError::InvalidResponse {
            name: "http_crm".into(),
            reason: e.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct SlotsResponse {
    slots: Vec<SlotEntry>,
}

#[derive(Deserialize)]
struct SlotEntry {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[async_trait::async_trait]
impl CrmIntegration for HttpCrm {
    fn name(&self) -> &str {
        "http_crm"
    }

    async fn create_customer(&self, lead: &Lead) -> Result<String, SyncError> {
        let body = serde_json::json!({
            "name": lead.name,
            "phone": lead.phone,
            "email": lead.email,
            "address": lead.address,
            "external_ref": lead.id.to_string(),
        });
        let created: IdResponse = self.post_json("/api/customers", body).await?;
        Ok(created.id)
    }

    async fn create_booking(
        &self,
        lead: &Lead,
        booking: &Booking,
        crm_customer_id: &str,
    ) -> Result<String, SyncError> {
        let body = serde_json::json!({
            "customer_id": crm_customer_id,
            "window_start": booking.window_start.to_rfc3339(),
            "window_end": booking.window_end.to_rfc3339(),
            "technician": booking.technician,
            "address": lead.address,
            "contact_phone": lead.phone,
            "contact_email": lead.email,
            "external_ref": booking.id.to_string(),
        });
        let created: IdResponse = self.post_json("/api/appointments", body).await?;
        Ok(created.id)
    }

    async fn get_available_slots(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Slot>, SyncError> {
        let response = self
            .client
            .get(self.url("/api/availability"))
            .bearer_auth(self.config.api_key.expose_secret())
            .timeout(REQUEST_TIMEOUT)
            .query(&[
                ("tenant", tenant_id),
                ("start", &start.to_rfc3339()),
                ("end", &end.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::RequestFailed {
                name: "http_crm".into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RequestFailed {
                name: "http_crm".into(),
                reason: format!("HTTP {status}"),
            });
        }

        let parsed: SlotsResponse =
            response.json().await.map_err(|e| SyncError::InvalidResponse {
                name: "http_crm".into(),
                reason: e.to_string(),
            })?;
        Ok(parsed
            .slots
            .into_iter()
            .map(|s| Slot {
                start: s.start,
                end: s.end,
            })
            .collect())
    }
}
