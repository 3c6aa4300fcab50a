//! Staged conversation agents — compose outbound texts per lead stage.
//!
//! Each stage carries its own prompt: intake acknowledges and asks the first
//! qualifying question, qualifying extracts job details and scores the lead,
//! booking offers concrete arrival windows, follow-up nudges a quiet lead.
//! The model returns structured JSON; the composed text plus extracted
//! fields flow back to the conductor, which runs the compliance passes —
//! nothing here sends anything.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Persona;
use crate::conductor::lead::Lead;
use crate::error::ConductorError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::scheduling::Slot;
use crate::store::{MessageDirection, MessageRecord};

/// Max tokens for a compose call (SMS-length output, kept tight).
const COMPOSE_MAX_TOKENS: u32 = 512;

/// Temperature for composition.
const COMPOSE_TEMPERATURE: f32 = 0.4;

/// How many prior messages the prompt carries.
const HISTORY_WINDOW: usize = 10;

/// Conversation stage an agent composes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStage {
    Intake,
    Qualifying,
    Booking,
    FollowUp,
}

impl AgentStage {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Qualifying => "qualifying",
            Self::Booking => "booking",
            Self::FollowUp => "follow_up",
        }
    }
}

/// Contact fields the model extracted from the conversation.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub name: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// One composed outbound message plus structured agent signals.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub content: String,
    pub agent_id: String,
    /// 0-100 qualification score, when the stage produces one.
    pub score: Option<i64>,
    pub extracted: ExtractedFields,
    /// The lead is ready to be offered appointment windows.
    pub ready_to_book: bool,
    /// Index into the offered slot list the lead accepted.
    pub chosen_slot: Option<usize>,
    /// Cost of the underlying completion.
    pub cost: Decimal,
}

pub struct AgentRoster {
    llm: Arc<dyn LlmProvider>,
}

impl AgentRoster {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Compose the next outbound text for a lead.
    ///
    /// `inbound` is the triggering message, when there is one; `slots` is
    /// the window list a booking-stage agent may offer.
    pub async fn compose(
        &self,
        stage: AgentStage,
        lead: &Lead,
        persona: &Persona,
        history: &[MessageRecord],
        inbound: Option<&str>,
        slots: &[Slot],
        first_contact: bool,
    ) -> Result<AgentOutcome, ConductorError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(stage, persona, first_contact)),
            ChatMessage::user(build_user_prompt(lead, history, inbound, slots)),
        ])
        .with_temperature(COMPOSE_TEMPERATURE)
        .with_max_tokens(COMPOSE_MAX_TOKENS);

        let response =
            self.llm
                .complete(request)
                .await
                .map_err(|e| ConductorError::ComposeFailed {
                    stage: stage.id().to_string(),
                    reason: format!("LLM call failed: {e}"),
                })?;

        let (per_in, per_out) = self.llm.cost_per_token();
        let cost = response.cost(per_in, per_out);

        let mut outcome = parse_compose_response(&response.content).map_err(|e| {
            warn!(
                stage = stage.id(),
                raw_response = %response.content,
                error = %e,
                "Failed to parse compose response"
            );
            ConductorError::ComposeFailed {
                stage: stage.id().to_string(),
                reason: e,
            }
        })?;

        if first_contact {
            outcome.content = with_compliance_footer(&outcome.content, persona);
        }

        outcome.agent_id = stage.id().to_string();
        outcome.cost = cost;
        debug!(stage = stage.id(), lead_id = %lead.id, "Composed outbound message");
        Ok(outcome)
    }
}

/// Append identification and the opt-out notice when the draft lacks them.
fn with_compliance_footer(content: &str, persona: &Persona) -> String {
    let lower = content.to_lowercase();
    let mut out = content.trim_end().to_string();

    if !lower.contains(&persona.business_name.to_lowercase()) {
        out = format!("{} - {}", out, persona.business_name);
    }
    if !lower.contains("stop") {
        out.push_str(" Reply STOP to opt out.");
    }
    out
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(stage: AgentStage, persona: &Persona, first_contact: bool) -> String {
    let mut prompt = format!(
        "You are an SMS assistant for {business}, a home-service business. \
         Tone: {tone}. Write like a real dispatcher texting a customer: short, \
         plain, no emoji, one question at a time. Hard limit 320 characters.\n\n",
        business = persona.business_name,
        tone = persona.tone,
    );

    if let Some(rep) = &persona.rep_name {
        prompt.push_str(&format!("You may refer to the technician as {rep}.\n"));
    }

    let stage_brief = match stage {
        AgentStage::Intake => {
            "Stage: intake. Thank them for reaching out and ask the single most \
             useful qualifying question (what's the issue, where, how urgent)."
        }
        AgentStage::Qualifying => {
            "Stage: qualifying. Work out job type, urgency, location, and \
             ownership. Extract any name/email/address they mention. Score the \
             lead 0-100 on fit and urgency. Set ready_to_book true once you \
             have enough to offer an appointment."
        }
        AgentStage::Booking => {
            "Stage: booking. Offer the provided arrival windows by number. If \
             the customer's last message accepts one, set slot_index to it \
             (0-based) and confirm."
        }
        AgentStage::FollowUp => {
            "Stage: follow-up. The lead went quiet. Send one gentle nudge \
             referencing the earlier conversation. Do not pressure."
        }
    };
    prompt.push_str(stage_brief);

    if first_contact {
        prompt.push_str(
            "\n\nThis is the first message this person receives from us: \
             identify the business by name.",
        );
    }

    prompt.push_str(
        "\n\nRespond with ONLY a JSON object:\n\
         {\"message\": \"...\", \"score\": 0, \"ready_to_book\": false, \
         \"slot_index\": null, \"name\": \"...\", \"email\": \"...\", \"address\": \"...\"}\n\
         Omit fields that don't apply. \"message\" is required.",
    );
    prompt
}

fn build_user_prompt(
    lead: &Lead,
    history: &[MessageRecord],
    inbound: Option<&str>,
    slots: &[Slot],
) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("Lead source: {}\n", lead.source.as_str()));
    if let Some(name) = &lead.name {
        prompt.push_str(&format!("Known name: {name}\n"));
    }
    if let Some(address) = &lead.address {
        prompt.push_str(&format!("Known address: {address}\n"));
    }

    if !slots.is_empty() {
        prompt.push_str("\nAvailable arrival windows:\n");
        for (i, slot) in slots.iter().enumerate() {
            prompt.push_str(&format!(
                "  [{i}] {} to {}\n",
                slot.start.format("%a %b %e, %l%P"),
                slot.end.format("%l%P"),
            ));
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for msg in history.iter().rev().take(HISTORY_WINDOW).rev() {
            let who = match msg.direction {
                MessageDirection::Inbound => "customer",
                MessageDirection::Outbound => "you",
            };
            let preview: String = msg.content.chars().take(300).collect();
            prompt.push_str(&format!("  {who}: {preview}\n"));
        }
    }

    match inbound {
        Some(text) => {
            let preview: String = text.chars().take(1000).collect();
            prompt.push_str(&format!("\nCustomer's new message:\n{preview}"));
        }
        None => prompt.push_str("\nNo new message; you are reaching out."),
    }

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ComposeResponse {
    message: String,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    ready_to_book: bool,
    #[serde(default)]
    slot_index: Option<usize>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

fn parse_compose_response(raw: &str) -> Result<AgentOutcome, String> {
    let json_str = extract_json_object(raw);
    let response: ComposeResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    if response.message.trim().is_empty() {
        return Err("empty message field".into());
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    Ok(AgentOutcome {
        content: response.message,
        agent_id: String::new(),
        score: response.score.map(|s| s.clamp(0, 100)),
        extracted: ExtractedFields {
            name: non_empty(response.name),
            email: non_empty(response.email),
            address: non_empty(response.address),
        },
        ready_to_book: response.ready_to_book,
        chosen_slot: response.slot_index,
        cost: Decimal::ZERO,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Last resort: first brace to last brace.
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}'))
        && open < close
    {
        return trimmed[open..=close].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::lead::LeadSource;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use async_trait::async_trait;

    struct CannedProvider {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn model_name(&self) -> &str {
            "canned"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.reply.clone(),
                input_tokens: 100,
                output_tokens: 50,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn persona() -> Persona {
        Persona {
            business_name: "Apex Plumbing".into(),
            tone: "friendly".into(),
            rep_name: None,
        }
    }

    fn lead() -> Lead {
        Lead::new("t1", "+15551230000", LeadSource::WebForm, -300)
    }

    fn roster(reply: &str) -> AgentRoster {
        AgentRoster::new(Arc::new(CannedProvider {
            reply: reply.to_string(),
        }))
    }

    #[tokio::test]
    async fn first_contact_gets_footer_when_draft_lacks_it() {
        let roster = roster(r#"{"message": "Hi! Thanks for reaching out. What's going on with your plumbing?"}"#);
        let outcome = roster
            .compose(AgentStage::Intake, &lead(), &persona(), &[], None, &[], true)
            .await
            .unwrap();

        assert!(outcome.content.contains("Apex Plumbing"));
        assert!(outcome.content.contains("STOP"));
        assert_eq!(outcome.agent_id, "intake");
    }

    #[tokio::test]
    async fn footer_not_duplicated_when_model_included_it() {
        let roster = roster(
            r#"{"message": "Hi, this is Apex Plumbing! What's going on? Reply STOP to opt out."}"#,
        );
        let outcome = roster
            .compose(AgentStage::Intake, &lead(), &persona(), &[], None, &[], true)
            .await
            .unwrap();

        assert_eq!(outcome.content.matches("Apex Plumbing").count(), 1);
        assert_eq!(outcome.content.matches("STOP").count(), 1);
    }

    #[tokio::test]
    async fn later_messages_carry_no_footer() {
        let roster = roster(r#"{"message": "Got it, sounds like a water heater issue."}"#);
        let outcome = roster
            .compose(
                AgentStage::Qualifying,
                &lead(),
                &persona(),
                &[],
                Some("my water heater is leaking"),
                &[],
                false,
            )
            .await
            .unwrap();

        assert!(!outcome.content.contains("STOP"));
    }

    #[tokio::test]
    async fn markdown_wrapped_json_is_parsed() {
        let roster = roster(
            "```json\n{\"message\": \"When works for you?\", \"score\": 85, \"ready_to_book\": true}\n```",
        );
        let outcome = roster
            .compose(
                AgentStage::Qualifying,
                &lead(),
                &persona(),
                &[],
                Some("pipe burst, need someone today"),
                &[],
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.score, Some(85));
        assert!(outcome.ready_to_book);
    }

    #[tokio::test]
    async fn slot_acceptance_is_surfaced() {
        let roster =
            roster(r#"{"message": "You're set for Tuesday 8-10am!", "slot_index": 0}"#);
        let slots = vec![Slot {
            start: chrono::Utc::now(),
            end: chrono::Utc::now() + chrono::Duration::hours(2),
        }];
        let outcome = roster
            .compose(
                AgentStage::Booking,
                &lead(),
                &persona(),
                &[],
                Some("the first one works"),
                &slots,
                false,
            )
            .await
            .unwrap();

        assert_eq!(outcome.chosen_slot, Some(0));
    }

    #[tokio::test]
    async fn unparseable_response_is_a_compose_failure() {
        let roster = roster("Sure! I'd be happy to help with that.");
        let err = roster
            .compose(AgentStage::Intake, &lead(), &persona(), &[], None, &[], true)
            .await
            .unwrap_err();

        assert!(matches!(err, ConductorError::ComposeFailed { .. }));
    }

    #[test]
    fn extracted_fields_drop_empty_strings() {
        let outcome = parse_compose_response(
            r#"{"message": "ok", "name": "Dana", "email": "", "address": "  "}"#,
        )
        .unwrap();
        assert_eq!(outcome.extracted.name.as_deref(), Some("Dana"));
        assert!(outcome.extracted.email.is_none());
        assert!(outcome.extracted.address.is_none());
    }
}
