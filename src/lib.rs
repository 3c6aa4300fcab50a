//! Lead Conductor — SMS lead qualification and compliance core.

pub mod agents;
pub mod compliance;
pub mod conductor;
pub mod config;
pub mod error;
pub mod events;
pub mod followup;
pub mod gateway;
pub mod llm;
pub mod scheduling;
pub mod store;
pub mod sync;
pub mod webhooks;
