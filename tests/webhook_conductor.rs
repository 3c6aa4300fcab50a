//! End-to-end webhook → conductor → store flows against the real router,
//! an in-memory database, and scripted provider/transport doubles.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::sync::Mutex;
use tower::ServiceExt;

use lead_conductor::agents::AgentRoster;
use lead_conductor::conductor::{Conductor, LeadState};
use lead_conductor::config::{Persona, StaticSettings, TenantSettings, WebhookSecrets};
use lead_conductor::error::{GatewayError, LlmError};
use lead_conductor::events::EventKind;
use lead_conductor::gateway::{DeliveryReceipt, MessageTransport, MessagingGateway};
use lead_conductor::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use lead_conductor::store::{Database, DeliveryStatus, LibSqlBackend, MessageDirection};
use lead_conductor::webhooks::{self, WebhookState};

const ADS_SECRET: &str = "ads-secret";
const SMS_SECRET: &str = "sms-secret";
const FORM_TOKEN: &str = "form-token";

struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    calls: AtomicUsize,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push((to.to_string(), body.to_string()));
        Ok(DeliveryReceipt {
            provider_message_id: format!("SM{n}"),
        })
    }
}

struct ScriptedProvider;

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: r#"{"message": "Hi, this is Apex Plumbing! How can we help? Reply STOP to opt out."}"#
                .into(),
            input_tokens: 100,
            output_tokens: 40,
            finish_reason: FinishReason::Stop,
        })
    }
}

fn settings() -> TenantSettings {
    TenantSettings {
        persona: Persona {
            business_name: "Apex Plumbing".into(),
            tone: "friendly".into(),
            rep_name: None,
        },
        business_hours: Default::default(),
        compliance: Default::default(),
        daily_capacity: 8,
        service_area: vec![],
        default_tz_offset_minutes: 0,
    }
}

// Noon UTC with offset-0 leads: inside the allowed send window.
fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap()
}

fn secrets() -> WebhookSecrets {
    WebhookSecrets {
        form_token: Some(secrecy::SecretString::from(FORM_TOKEN)),
        lead_ads_secret: Some(secrecy::SecretString::from(ADS_SECRET)),
        missed_call_token: Some(secrecy::SecretString::from("call-token")),
        sms_provider_secret: Some(secrecy::SecretString::from(SMS_SECRET)),
    }
}

async fn app(transport: Arc<RecordingTransport>) -> (Router, Arc<dyn Database>) {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let gateway = Arc::new(MessagingGateway::new(
        transport,
        4,
        std::time::Duration::from_secs(5),
    ));
    let conductor = Arc::new(
        Conductor::new(
            Arc::clone(&store),
            Arc::new(StaticSettings::new(settings())),
            AgentRoster::new(Arc::new(ScriptedProvider)),
            gateway,
            None,
        )
        .with_clock(Arc::new(noon)),
    );
    let state = WebhookState::new(conductor, Arc::clone(&store), Arc::new(secrets()));
    (webhooks::router(state), store)
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn signed_post(path: &str, secret: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-signature", sign(secret, &body))
        .body(Body::from(body))
        .unwrap()
}

fn token_post(path: &str, token: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-webhook-token", token)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn lead_ads_batch_creates_and_contacts_every_lead() {
    let transport = RecordingTransport::new();
    let (app, store) = app(Arc::clone(&transport)).await;

    let body = json!({
        "leads": [
            { "phone": "555-123-0001", "name": "Dana" },
            { "phone": "(555) 123-0002", "name": "Ed", "notes": "water heater" },
        ]
    })
    .to_string();

    let response = app
        .oneshot(signed_post("/webhooks/t1/lead-ads", ADS_SECRET, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["processed"], 2);

    for phone in ["+15551230001", "+15551230002"] {
        let lead = store.find_lead("t1", phone).await.unwrap().unwrap();
        assert_eq!(lead.state, LeadState::IntakeSent);
    }
    assert_eq!(transport.sent_count().await, 2);
}

#[tokio::test]
async fn lead_ads_bad_signature_is_rejected_without_side_effects() {
    let transport = RecordingTransport::new();
    let (app, store) = app(Arc::clone(&transport)).await;

    let body = json!({ "leads": [{ "phone": "5551230001" }] }).to_string();
    let response = app
        .oneshot(signed_post("/webhooks/t1/lead-ads", "wrong-secret", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(store.find_lead("t1", "+15551230001").await.unwrap().is_none());
    assert_eq!(transport.sent_count().await, 0);
}

#[tokio::test]
async fn stop_reply_over_webhook_opts_the_lead_out() {
    let transport = RecordingTransport::new();
    let (app, store) = app(Arc::clone(&transport)).await;

    let intake = json!({ "phone": "5551230001", "name": "Dana" }).to_string();
    let response = app
        .clone()
        .oneshot(token_post("/webhooks/t1/form", FORM_TOKEN, intake))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stop = json!({ "from": "5551230001", "body": "STOP" }).to_string();
    let response = app
        .oneshot(signed_post("/webhooks/t1/sms", SMS_SECRET, stop))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let lead = store.find_lead("t1", "+15551230001").await.unwrap().unwrap();
    assert_eq!(lead.state, LeadState::OptedOut);

    let consent = store.get_consent("t1", "+15551230001").await.unwrap().unwrap();
    assert!(consent.opted_out);

    let opt_outs = store
        .events_for_lead(lead.id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::OptOut)
        .count();
    assert_eq!(opt_outs, 1);

    // Only the initial intake text went out; the STOP got no reply.
    assert_eq!(transport.sent_count().await, 1);
}

#[tokio::test]
async fn delivery_callbacks_are_idempotent() {
    let transport = RecordingTransport::new();
    let (app, store) = app(Arc::clone(&transport)).await;

    let intake = json!({ "phone": "5551230001" }).to_string();
    app.clone()
        .oneshot(token_post("/webhooks/t1/form", FORM_TOKEN, intake))
        .await
        .unwrap();

    let lead = store.find_lead("t1", "+15551230001").await.unwrap().unwrap();
    let provider_id = store
        .messages_for_lead(lead.id)
        .await
        .unwrap()
        .iter()
        .find(|m| m.direction == MessageDirection::Outbound)
        .and_then(|m| m.provider_message_id.clone())
        .unwrap();

    let delivered = json!({ "message_id": provider_id, "status": "delivered" }).to_string();
    let response = app
        .clone()
        .oneshot(signed_post("/webhooks/t1/delivery", SMS_SECRET, delivered.clone()))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["processed"], 1);

    // Replayed callback is a no-op.
    let response = app
        .clone()
        .oneshot(signed_post("/webhooks/t1/delivery", SMS_SECRET, delivered))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["processed"], 0);

    // A late regression to a non-terminal status is refused too.
    let late = json!({ "message_id": provider_id, "status": "sent" }).to_string();
    let response = app
        .oneshot(signed_post("/webhooks/t1/delivery", SMS_SECRET, late))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["processed"], 0);

    let message = store
        .messages_for_lead(lead.id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.provider_message_id.as_deref() == Some(provider_id.as_str()))
        .unwrap();
    assert_eq!(message.delivery_status, Some(DeliveryStatus::Delivered));
}

#[tokio::test]
async fn missed_call_with_invalid_number_is_a_bad_request() {
    let transport = RecordingTransport::new();
    let (app, _store) = app(Arc::clone(&transport)).await;

    let body = json!({ "caller": "1234" }).to_string();
    let response = app
        .oneshot(token_post("/webhooks/t1/missed-call", "call-token", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(transport.sent_count().await, 0);
}
