//! Configuration types.
//!
//! Everything the core consumes is an explicit, validated structure: tenant
//! settings come from an external settings store, never from a free-form
//! payload merged at runtime. Missing security material (webhook secrets)
//! puts the affected source into reject mode rather than disabling the check.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ConfigError;

/// Quiet-hours window in lead-local time. Sends are allowed in
/// `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for QuietHours {
    fn default() -> Self {
        // TCPA-safe default: 8AM–9PM local.
        Self {
            start: NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(21, 0, 0).expect("valid time"),
        }
    }
}

impl QuietHours {
    /// Whether `local` falls inside the allowed send window.
    pub fn allows(&self, local: NaiveTime) -> bool {
        local >= self.start && local < self.end
    }
}

/// Open/close hours for one day. `None` means closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DayHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

/// Business hours with weekend overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct BusinessHours {
    pub weekday: DayHours,
    /// Saturday override; closed when absent.
    #[serde(default)]
    pub saturday: Option<DayHours>,
    /// Sunday override; closed when absent.
    #[serde(default)]
    pub sunday: Option<DayHours>,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            weekday: DayHours {
                open: NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
                close: NaiveTime::from_hms_opt(17, 0, 0).expect("valid time"),
            },
            saturday: None,
            sunday: None,
        }
    }
}

impl BusinessHours {
    /// Hours for a given weekday, if the business is open that day.
    pub fn for_weekday(&self, day: Weekday) -> Option<DayHours> {
        match day {
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
            _ => Some(self.weekday),
        }
    }
}

/// Persona/tone settings used when composing outbound texts.
#[derive(Debug, Clone, Deserialize)]
pub struct Persona {
    pub business_name: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    /// Technician/owner name mentioned in messages, if any.
    #[serde(default)]
    pub rep_name: Option<String>,
}

fn default_tone() -> String {
    "friendly and concise".to_string()
}

/// Compliance policy knobs consumed by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct CompliancePolicy {
    /// Maximum unsolicited (non-reply) sends per lead.
    #[serde(default = "default_cold_cap")]
    pub cold_outreach_cap: u32,
    /// Whether outbound texts must carry an AI-disclosure notice.
    #[serde(default)]
    pub ai_disclosure_required: bool,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    /// Link-shortener domains that must never appear in outbound texts.
    #[serde(default = "default_banned_domains")]
    pub banned_link_domains: Vec<String>,
}

fn default_cold_cap() -> u32 {
    3
}

fn default_banned_domains() -> Vec<String> {
    ["bit.ly", "tinyurl.com", "goo.gl", "t.co", "ow.ly"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for CompliancePolicy {
    fn default() -> Self {
        Self {
            cold_outreach_cap: default_cold_cap(),
            ai_disclosure_required: false,
            quiet_hours: QuietHours::default(),
            banned_link_domains: default_banned_domains(),
        }
    }
}

/// Per-tenant settings produced by the external settings API.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantSettings {
    pub persona: Persona,
    #[serde(default)]
    pub business_hours: BusinessHours,
    #[serde(default)]
    pub compliance: CompliancePolicy,
    /// Maximum bookings per day for this tenant.
    #[serde(default = "default_daily_capacity")]
    pub daily_capacity: u32,
    /// Zip/area codes served; empty means no restriction.
    #[serde(default)]
    pub service_area: Vec<String>,
    /// Fallback UTC offset (minutes) for leads whose source carries none.
    #[serde(default)]
    pub default_tz_offset_minutes: i32,
}

fn default_daily_capacity() -> u32 {
    8
}

impl TenantSettings {
    /// Validate cross-field constraints the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persona.business_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "persona.business_name".into(),
                message: "must not be empty (required for first-contact identification)".into(),
            });
        }
        if self.daily_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "daily_capacity".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.default_tz_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::InvalidValue {
                key: "default_tz_offset_minutes".into(),
                message: "outside the valid UTC offset range".into(),
            });
        }
        Ok(())
    }
}

/// Source of per-tenant settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn tenant_settings(&self, tenant_id: &str) -> Result<TenantSettings, ConfigError>;
}

/// HTTP settings store — fetches validated settings from the dashboard API.
pub struct HttpSettingsStore {
    client: reqwest::Client,
    base_url: String,
    api_token: SecretString,
}

impl HttpSettingsStore {
    pub fn new(base_url: String, api_token: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_token,
        }
    }
}

#[async_trait]
impl SettingsStore for HttpSettingsStore {
    async fn tenant_settings(&self, tenant_id: &str) -> Result<TenantSettings, ConfigError> {
        let url = format!("{}/api/tenants/{}/settings", self.base_url, tenant_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_token.expose_secret())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ConfigError::SettingsFetch {
                tenant: tenant_id.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConfigError::SettingsFetch {
                tenant: tenant_id.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let settings: TenantSettings =
            response
                .json()
                .await
                .map_err(|e| ConfigError::SettingsFetch {
                    tenant: tenant_id.to_string(),
                    reason: format!("invalid settings body: {e}"),
                })?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Fixed settings — used in tests and single-tenant deployments.
pub struct StaticSettings {
    settings: TenantSettings,
}

impl StaticSettings {
    pub fn new(settings: TenantSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn tenant_settings(&self, _tenant_id: &str) -> Result<TenantSettings, ConfigError> {
        Ok(self.settings.clone())
    }
}

/// Shared-secret material for webhook source verification.
///
/// A `None` secret means the corresponding source operates in reject mode:
/// every delivery is refused and an operator warning is emitted at startup.
#[derive(Clone, Default)]
pub struct WebhookSecrets {
    /// Shared token for website form submissions.
    pub form_token: Option<SecretString>,
    /// HMAC signing secret for the lead-ads platform.
    pub lead_ads_secret: Option<SecretString>,
    /// Shared token for missed-call triggers.
    pub missed_call_token: Option<SecretString>,
    /// HMAC signing secret for the SMS provider (replies + delivery status).
    pub sms_provider_secret: Option<SecretString>,
}

impl WebhookSecrets {
    /// Read secrets from the environment. Missing values are left unset;
    /// the webhook layer logs a loud warning and rejects those sources.
    pub fn from_env() -> Self {
        Self {
            form_token: env_secret("LEAD_FORM_TOKEN"),
            lead_ads_secret: env_secret("LEAD_ADS_SECRET"),
            missed_call_token: env_secret("MISSED_CALL_TOKEN"),
            sms_provider_secret: env_secret("SMS_PROVIDER_SECRET"),
        }
    }

    /// Names of sources that have no secret configured.
    pub fn unconfigured_sources(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.form_token.is_none() {
            missing.push("form");
        }
        if self.lead_ads_secret.is_none() {
            missing.push("lead_ads");
        }
        if self.missed_call_token.is_none() {
            missing.push("missed_call");
        }
        if self.sms_provider_secret.is_none() {
            missing.push("sms_provider");
        }
        missing
    }
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TenantSettings {
        TenantSettings {
            persona: Persona {
                business_name: "Apex Plumbing".into(),
                tone: default_tone(),
                rep_name: None,
            },
            business_hours: BusinessHours::default(),
            compliance: CompliancePolicy::default(),
            daily_capacity: 8,
            service_area: vec![],
            default_tz_offset_minutes: -300,
        }
    }

    #[test]
    fn quiet_hours_boundaries() {
        let qh = QuietHours::default();
        assert!(qh.allows(NaiveTime::from_hms_opt(8, 0, 1).unwrap()));
        assert!(qh.allows(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
        assert!(!qh.allows(NaiveTime::from_hms_opt(7, 59, 59).unwrap()));
        assert!(!qh.allows(NaiveTime::from_hms_opt(21, 0, 0).unwrap()));
        assert!(qh.allows(NaiveTime::from_hms_opt(20, 59, 59).unwrap()));
    }

    #[test]
    fn business_hours_weekend_closed_by_default() {
        let hours = BusinessHours::default();
        assert!(hours.for_weekday(Weekday::Mon).is_some());
        assert!(hours.for_weekday(Weekday::Sat).is_none());
        assert!(hours.for_weekday(Weekday::Sun).is_none());
    }

    #[test]
    fn business_hours_saturday_override() {
        let hours = BusinessHours {
            saturday: Some(DayHours {
                open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                close: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            }),
            ..BusinessHours::default()
        };
        let sat = hours.for_weekday(Weekday::Sat).unwrap();
        assert_eq!(sat.open, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn settings_validation_rejects_empty_business_name() {
        let mut s = settings();
        s.persona.business_name = "  ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn settings_validation_rejects_zero_capacity() {
        let mut s = settings();
        s.daily_capacity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn settings_validation_accepts_defaults() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn unconfigured_sources_lists_missing_secrets() {
        let secrets = WebhookSecrets {
            form_token: Some(SecretString::from("tok")),
            ..WebhookSecrets::default()
        };
        let missing = secrets.unconfigured_sources();
        assert!(!missing.contains(&"form"));
        assert!(missing.contains(&"lead_ads"));
        assert!(missing.contains(&"sms_provider"));
    }
}
