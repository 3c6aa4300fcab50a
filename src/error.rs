//! Error types for the lead conductor.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("CRM sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Conductor error: {0}")]
    Conductor(#[from] ConductorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Settings fetch failed for tenant {tenant}: {reason}")]
    SettingsFetch { tenant: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Transport {name} failed to send: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Transport {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid recipient {recipient}: {reason}")]
    InvalidRecipient { recipient: String, reason: String },

    #[error("Provider {name} rejected credentials")]
    AuthFailed { name: String },

    #[error("Send pool is shut down")]
    PoolClosed,

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Webhook ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing signature for source {origin}")]
    MissingSignature { origin: String },

    #[error("Signature verification failed for source {origin}")]
    BadSignature { origin: String },

    #[error("No signing secret configured for source {origin}")]
    MissingSecret { origin: String },

    #[error("Malformed payload from {origin}: {reason}")]
    MalformedPayload { origin: String, reason: String },

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),
}

/// CRM synchronization errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("CRM {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("CRM {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("CRM {name} returned an invalid response: {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("Booking {id} exhausted {attempts} sync attempts")]
    RetriesExhausted { id: Uuid, attempts: u32 },
}

/// Conductor/state-machine errors.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("Lead {id} not found")]
    LeadNotFound { id: Uuid },

    #[error("Invalid transition for lead {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Agent failed to compose for stage {stage}: {reason}")]
    ComposeFailed { stage: String, reason: String },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
