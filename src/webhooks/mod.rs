//! Webhook ingestion gateway — one endpoint per untrusted lead source.
//!
//! Every source carries its own authenticity check: shared tokens for the
//! website form and missed-call trigger, HMAC-SHA256 signatures over the
//! raw body for the lead-ads platform and the SMS provider. Unverifiable
//! deliveries are rejected and logged; a source with no configured secret
//! rejects everything rather than skipping the check. Batch payloads are
//! processed record by record and the response reports how many succeeded.
//!
//! Callers never see internal error detail; that goes to the operator log
//! and the audit trail only.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::conductor::{Conductor, LeadEvent, LeadSource};
use crate::error::WebhookError;
use crate::events::{EventKind, EventLogEntry};
use crate::config::WebhookSecrets;
use crate::store::{Database, DeliveryStatus};

type HmacSha256 = Hmac<Sha256>;

/// Auth failures from one source before rejections log at error level.
const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

#[derive(Clone)]
pub struct WebhookState {
    pub conductor: Arc<Conductor>,
    pub store: Arc<dyn Database>,
    pub secrets: Arc<WebhookSecrets>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl WebhookState {
    pub fn new(
        conductor: Arc<Conductor>,
        store: Arc<dyn Database>,
        secrets: Arc<WebhookSecrets>,
    ) -> Self {
        for source in secrets.unconfigured_sources() {
            error!(
                source,
                "No signing secret configured; this source will reject all deliveries"
            );
        }
        Self {
            conductor,
            store,
            secrets,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn record_rejection(&self, tenant: &str, source: &str, reason: &WebhookError) {
        let count = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(source.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        // Repeated failures look like misconfiguration or probing.
        if count >= FAILURE_ESCALATION_THRESHOLD {
            error!(source, count, reason = %reason, "Webhook rejected");
        } else {
            warn!(source, reason = %reason, "Webhook rejected");
        }

        if let Err(e) = self
            .store
            .append_event(&EventLogEntry::new(
                tenant,
                EventKind::WebhookRejected,
                format!("{source}: {reason}"),
            ))
            .await
        {
            error!(error = %e, "Failed to record webhook rejection");
        }
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/{tenant}/form", post(handle_form))
        .route("/webhooks/{tenant}/lead-ads", post(handle_lead_ads))
        .route("/webhooks/{tenant}/missed-call", post(handle_missed_call))
        .route("/webhooks/{tenant}/sms", post(handle_sms))
        .route("/webhooks/{tenant}/delivery", post(handle_delivery))
        .with_state(state)
}

// ── Authenticity checks ─────────────────────────────────────────────

fn check_token(
    secret: Option<&SecretString>,
    headers: &HeaderMap,
    source: &str,
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Err(WebhookError::MissingSecret {
            origin: source.into(),
        });
    };
    let provided = headers
        .get("x-webhook-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| WebhookError::MissingSignature {
            origin: source.into(),
        })?;
    if provided != secret.expose_secret() {
        return Err(WebhookError::BadSignature {
            origin: source.into(),
        });
    }
    Ok(())
}

fn check_signature(
    secret: Option<&SecretString>,
    headers: &HeaderMap,
    body: &[u8],
    source: &str,
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        return Err(WebhookError::MissingSecret {
            origin: source.into(),
        });
    };
    let provided = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| WebhookError::MissingSignature {
            origin: source.into(),
        })?;

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()).map_err(|_| {
        WebhookError::MissingSecret {
            origin: source.into(),
        }
    })?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(WebhookError::BadSignature {
            origin: source.into(),
        });
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Normalize a phone number to E.164 (NANP only).
pub fn normalize_phone(raw: &str) -> Result<String, WebhookError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => Ok(format!("+1{digits}")),
        11 if digits.starts_with('1') => Ok(format!("+{digits}")),
        _ => Err(WebhookError::InvalidPhone(raw.to_string())),
    }
}

// ── Error responses ─────────────────────────────────────────────────

/// HTTP mapping for webhook failures. Bodies never carry internal detail.
struct ApiError(StatusCode);

impl From<&WebhookError> for ApiError {
    fn from(e: &WebhookError) -> Self {
        let status = match e {
            WebhookError::MissingSignature { .. } | WebhookError::BadSignature { .. } => {
                StatusCode::UNAUTHORIZED
            }
            WebhookError::MissingSecret { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::MalformedPayload { .. } | WebhookError::InvalidPhone(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self(status)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.0 {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::SERVICE_UNAVAILABLE => "source not configured",
            StatusCode::BAD_REQUEST => "invalid payload",
            _ => "internal error",
        };
        (self.0, Json(json!({ "error": body }))).into_response()
    }
}

// ── Payload shapes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FormPayload {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeadAdsPayload {
    leads: Vec<FormPayload>,
}

#[derive(Debug, Deserialize)]
struct MissedCallPayload {
    caller: String,
}

#[derive(Debug, Deserialize)]
struct InboundSmsPayload {
    from: String,
    body: String,
    #[serde(default)]
    received_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DeliveryPayload {
    message_id: String,
    status: String,
}

// ── Handlers ────────────────────────────────────────────────────────

async fn handle_form(
    State(state): State<WebhookState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = check_token(state.secrets.form_token.as_ref(), &headers, "form") {
        state.record_rejection(&tenant, "form", &e).await;
        return Err(ApiError::from(&e));
    }

    let payload: FormPayload = parse_body(&body, "form")
        .map_err(|e| reject_sync(&tenant, "form", e))?;

    let processed = ingest_intake(&state, &tenant, LeadSource::WebForm, payload).await;
    Ok(Json(json!({ "processed": processed })))
}

async fn handle_lead_ads(
    State(state): State<WebhookState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = check_signature(
        state.secrets.lead_ads_secret.as_ref(),
        &headers,
        &body,
        "lead_ads",
    ) {
        state.record_rejection(&tenant, "lead_ads", &e).await;
        return Err(ApiError::from(&e));
    }

    let payload: LeadAdsPayload = parse_body(&body, "lead_ads")
        .map_err(|e| reject_sync(&tenant, "lead_ads", e))?;

    // Every record in the batch is processed; one bad entry never drops
    // the rest. Records are distinct leads, so they can ingest concurrently.
    let results = futures::future::join_all(
        payload
            .leads
            .into_iter()
            .map(|record| ingest_intake(&state, &tenant, LeadSource::LeadAds, record)),
    )
    .await;
    let processed: usize = results.into_iter().sum();
    Ok(Json(json!({ "processed": processed })))
}

async fn handle_missed_call(
    State(state): State<WebhookState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = check_token(
        state.secrets.missed_call_token.as_ref(),
        &headers,
        "missed_call",
    ) {
        state.record_rejection(&tenant, "missed_call", &e).await;
        return Err(ApiError::from(&e));
    }

    let payload: MissedCallPayload = parse_body(&body, "missed_call")
        .map_err(|e| reject_sync(&tenant, "missed_call", e))?;
    let phone = normalize_phone(&payload.caller)
        .map_err(|e| reject_sync(&tenant, "missed_call", e))?;

    let event = LeadEvent::Intake {
        source: LeadSource::MissedCall,
        name: None,
        email: None,
        address: None,
        notes: Some("missed call".into()),
    };
    match state.conductor.ingest(&tenant, &phone, event).await {
        Ok(_) => Ok(Json(json!({ "processed": 1 }))),
        Err(e) => {
            error!(error = %e, "Missed-call ingest failed");
            Ok(Json(json!({ "processed": 0 })))
        }
    }
}

async fn handle_sms(
    State(state): State<WebhookState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = check_signature(
        state.secrets.sms_provider_secret.as_ref(),
        &headers,
        &body,
        "sms_provider",
    ) {
        state.record_rejection(&tenant, "sms_provider", &e).await;
        return Err(ApiError::from(&e));
    }

    let payload: InboundSmsPayload = parse_body(&body, "sms_provider")
        .map_err(|e| reject_sync(&tenant, "sms_provider", e))?;
    let phone = normalize_phone(&payload.from)
        .map_err(|e| reject_sync(&tenant, "sms_provider", e))?;

    let event = LeadEvent::InboundSms {
        body: payload.body,
        received_at: payload.received_at.unwrap_or_else(Utc::now),
    };
    match state.conductor.ingest(&tenant, &phone, event).await {
        Ok(_) => Ok(Json(json!({ "processed": 1 }))),
        Err(e) => {
            error!(error = %e, "Inbound SMS ingest failed");
            Ok(Json(json!({ "processed": 0 })))
        }
    }
}

async fn handle_delivery(
    State(state): State<WebhookState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = check_signature(
        state.secrets.sms_provider_secret.as_ref(),
        &headers,
        &body,
        "sms_provider",
    ) {
        state.record_rejection(&tenant, "sms_provider", &e).await;
        return Err(ApiError::from(&e));
    }

    let payload: DeliveryPayload = parse_body(&body, "sms_provider")
        .map_err(|e| reject_sync(&tenant, "sms_provider", e))?;
    let status = DeliveryStatus::parse(&payload.status).ok_or_else(|| {
        reject_sync(
            &tenant,
            "sms_provider",
            WebhookError::MalformedPayload {
                origin: "sms_provider".into(),
                reason: format!("unknown delivery status '{}'", payload.status),
            },
        )
    })?;

    // Duplicate callbacks for the same message id are no-ops.
    let applied = state
        .store
        .apply_delivery_status(&payload.message_id, status)
        .await
        .map_err(|e| {
            error!(error = %e, "Delivery status update failed");
            ApiError(StatusCode::INTERNAL_SERVER_ERROR)
        })?;

    Ok(Json(json!({ "processed": usize::from(applied) })))
}

// ── Shared handler plumbing ─────────────────────────────────────────

fn parse_body<T: serde::de::DeserializeOwned>(
    body: &[u8],
    source: &str,
) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload {
        origin: source.into(),
        reason: e.to_string(),
    })
}

/// Log a validation rejection; details go to the operator log only.
fn reject_sync(tenant: &str, source: &str, e: WebhookError) -> ApiError {
    warn!(tenant, source, reason = %e, "Webhook payload rejected");
    ApiError::from(&e)
}

async fn ingest_intake(
    state: &WebhookState,
    tenant: &str,
    source: LeadSource,
    payload: FormPayload,
) -> usize {
    let phone = match normalize_phone(&payload.phone) {
        Ok(phone) => phone,
        Err(e) => {
            warn!(tenant, reason = %e, "Skipping lead record with bad phone");
            return 0;
        }
    };

    let event = LeadEvent::Intake {
        source,
        name: payload.name,
        email: payload.email,
        address: payload.address,
        notes: payload.notes,
    };
    match state.conductor.ingest(tenant, &phone, event).await {
        Ok(_) => 1,
        Err(e) => {
            error!(tenant, error = %e, "Lead ingest failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(555) 123-0000").unwrap(), "+15551230000");
        assert_eq!(normalize_phone("15551230000").unwrap(), "+15551230000");
        assert_eq!(normalize_phone("+1 555 123 0000").unwrap(), "+15551230000");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("not a phone").is_err());
    }

    #[test]
    fn token_check_rejects_missing_secret() {
        let headers = HeaderMap::new();
        let err = check_token(None, &headers, "form").unwrap_err();
        assert!(matches!(err, WebhookError::MissingSecret { .. }));
    }

    #[test]
    fn token_check_rejects_wrong_token() {
        let secret = SecretString::from("right");
        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-token", "wrong".parse().unwrap());
        let err = check_token(Some(&secret), &headers, "form").unwrap_err();
        assert!(matches!(err, WebhookError::BadSignature { .. }));
    }

    #[test]
    fn signature_check_round_trip() {
        let secret = SecretString::from("shhh");
        let body = br#"{"leads":[]}"#;

        let mut mac = HmacSha256::new_from_slice(b"shhh").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("x-signature", sig.parse().unwrap());
        assert!(check_signature(Some(&secret), &headers, body, "lead_ads").is_ok());

        // Tampered body fails.
        assert!(matches!(
            check_signature(Some(&secret), &headers, br#"{"leads":[{}]}"#, "lead_ads"),
            Err(WebhookError::BadSignature { .. })
        ));
    }
}
