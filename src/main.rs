use std::sync::Arc;
use std::time::Duration;

use lead_conductor::agents::AgentRoster;
use lead_conductor::conductor::Conductor;
use lead_conductor::config::{
    HttpSettingsStore, Persona, SettingsStore, StaticSettings, TenantSettings, WebhookSecrets,
};
use lead_conductor::followup::FollowUpScheduler;
use lead_conductor::gateway::{EmailNotifier, MessagingGateway, SmsConfig, SmsTransport, SmtpConfig};
use lead_conductor::llm::{LlmConfig, create_provider};
use lead_conductor::store::{Database, LibSqlBackend};
use lead_conductor::sync::crm::{HttpCrm, HttpCrmConfig};
use lead_conductor::sync::SyncWorker;
use lead_conductor::webhooks::{self, WebhookState};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Read API key from environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let model = std::env::var("LEAD_CONDUCTOR_MODEL")
        .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

    let port: u16 = std::env::var("LEAD_CONDUCTOR_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("📞 Lead Conductor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);
    eprintln!("   Webhooks: http://0.0.0.0:{}/webhooks/<tenant>/...", port);

    // Create LLM provider
    let llm_config = LlmConfig {
        api_key: secrecy::SecretString::from(api_key),
        model,
    };
    let llm = create_provider(&llm_config)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::env::var("LEAD_CONDUCTOR_DB_PATH")
        .unwrap_or_else(|_| "./data/lead-conductor.db".to_string());

    let db_path_ref = std::path::Path::new(&db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );

    eprintln!("   Database: {}", db_path);

    // ── Messaging gateway ────────────────────────────────────────────────
    let sms_config = SmsConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: SMS provider not configured");
        eprintln!("  export SMS_API_URL, SMS_ACCOUNT_ID, SMS_AUTH_TOKEN, SMS_FROM_NUMBER");
        std::process::exit(1);
    });
    let max_in_flight: usize = std::env::var("SMS_MAX_IN_FLIGHT")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .unwrap_or(4);
    let gateway = Arc::new(MessagingGateway::new(
        Arc::new(SmsTransport::new(sms_config)),
        max_in_flight,
        Duration::from_secs(10),
    ));

    let notifier = match SmtpConfig::from_env() {
        Some(config) => {
            eprintln!("   Owner notifications: enabled");
            Some(Arc::new(EmailNotifier::new(config)))
        }
        None => {
            eprintln!("   Owner notifications: disabled (SMTP_HOST not set)");
            None
        }
    };

    // ── Tenant settings ──────────────────────────────────────────────────
    let settings: Arc<dyn SettingsStore> = match std::env::var("SETTINGS_API_URL") {
        Ok(base_url) => {
            let token = std::env::var("SETTINGS_API_TOKEN").unwrap_or_else(|_| {
                eprintln!("Error: SETTINGS_API_URL set but SETTINGS_API_TOKEN missing");
                std::process::exit(1);
            });
            eprintln!("   Settings: {}", base_url);
            Arc::new(HttpSettingsStore::new(
                base_url,
                secrecy::SecretString::from(token),
            ))
        }
        Err(_) => {
            // Single-tenant fallback driven entirely by the environment.
            let business_name = std::env::var("BUSINESS_NAME").unwrap_or_else(|_| {
                eprintln!("Error: neither SETTINGS_API_URL nor BUSINESS_NAME set");
                std::process::exit(1);
            });
            let tz_offset: i32 = std::env::var("DEFAULT_TZ_OFFSET_MINUTES")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0);
            let tenant = TenantSettings {
                persona: Persona {
                    business_name,
                    tone: "friendly and concise".to_string(),
                    rep_name: std::env::var("REP_NAME").ok(),
                },
                business_hours: Default::default(),
                compliance: Default::default(),
                daily_capacity: 8,
                service_area: Vec::new(),
                default_tz_offset_minutes: tz_offset,
            };
            if let Err(e) = tenant.validate() {
                eprintln!("Error: invalid tenant settings: {}", e);
                std::process::exit(1);
            }
            eprintln!("   Settings: single-tenant ({})", tenant.persona.business_name);
            Arc::new(StaticSettings::new(tenant))
        }
    };

    // ── Conductor ────────────────────────────────────────────────────────
    let conductor = Arc::new(Conductor::new(
        Arc::clone(&db),
        settings,
        AgentRoster::new(llm),
        gateway,
        notifier,
    ));

    // ── Background tickers ───────────────────────────────────────────────
    let mut tickers = Vec::new();
    match HttpCrmConfig::from_env() {
        Some(config) => {
            let worker = Arc::new(SyncWorker::new(
                Arc::clone(&db),
                Arc::new(HttpCrm::new(config)),
            ));
            tickers.push(worker.spawn(Duration::from_secs(30)));
            eprintln!("   CRM sync: enabled");
        }
        None => {
            eprintln!("   CRM sync: disabled (CRM_API_URL not set)");
        }
    }

    let scheduler = Arc::new(FollowUpScheduler::new(
        Arc::clone(&db),
        Arc::clone(&conductor),
    ));
    tickers.push(scheduler.spawn(Duration::from_secs(30)));

    // ── Webhook server ───────────────────────────────────────────────────
    let secrets = Arc::new(WebhookSecrets::from_env());
    let state = WebhookState::new(conductor, db, secrets);
    let app = webhooks::router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Webhook server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight webhook requests have drained; stop the tickers. Their
    // work is all persisted state, so an abort mid-poll loses nothing.
    for ticker in tickers {
        ticker.abort();
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
