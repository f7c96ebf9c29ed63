//! Prompt construction and parsing of structured completions.
//!
//! The completion service only ever translates text into fields; every
//! decision about what to do with those fields stays in the handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::errors::{ServiceError, TurnError};
use concierge_core::ports::{CompletionLimits, CompletionService, Prompt, SearchHit};
use concierge_core::supervisor::{Deadline, Supervisor, TaskResult};

const MAX_PROMPT_INPUT_CHARS: usize = 2_000;

/// Strips control characters and double quotes, and collapses whitespace so
/// user text cannot break the JSON the model is asked to produce.
pub fn sanitize_for_prompt(text: &str) -> String {
    let cleaned = text
        .chars()
        .filter(|character| !character.is_control() || character.is_whitespace())
        .map(|character| if character == '"' { '\'' } else { character })
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_PROMPT_INPUT_CHARS).collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("completion did not contain a JSON object")]
    MissingJson,
    #[error("completion JSON did not match the expected shape: {0}")]
    Shape(String),
}

/// Fields a routed message may carry. Every field is optional; handlers
/// decide which ones they need.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extraction {
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub subject: Option<String>,
    pub email_body: Option<String>,
    pub contact_action: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub lookup_field: Option<String>,
    pub update_field: Option<String>,
    pub update_value: Option<String>,
    pub calendar_action: Option<String>,
    pub calendar_summary: Option<String>,
    pub calendar_start: Option<String>,
    pub calendar_end: Option<String>,
    pub calendar_description: Option<String>,
    pub place_query: Option<String>,
    pub place_location: Option<String>,
    pub search_query: Option<String>,
}

/// Treats empty strings and the usual "nothing here" spellings as absent.
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| {
        !value.is_empty()
            && !["null", "none", "n/a", "unknown"]
                .iter()
                .any(|placeholder| value.eq_ignore_ascii_case(placeholder))
    })
}

/// Parses the first JSON object in a completion, tolerating code fences and
/// surrounding prose.
pub fn parse_json_object<T>(raw: &str) -> Result<T, ExtractionError>
where
    T: for<'de> Deserialize<'de>,
{
    let start = raw.find('{').ok_or(ExtractionError::MissingJson)?;
    let end = raw.rfind('}').ok_or(ExtractionError::MissingJson)?;
    if end < start {
        return Err(ExtractionError::MissingJson);
    }
    serde_json::from_str(&raw[start..=end])
        .map_err(|error| ExtractionError::Shape(error.to_string()))
}

pub fn extraction_limits(max_tokens: u32) -> CompletionLimits {
    CompletionLimits { max_tokens, temperature: 0.0, json_output: true }
}

pub fn extraction_prompt(
    category: IntentCategory,
    message: &str,
    memory_context: &str,
    now: DateTime<FixedOffset>,
) -> Prompt {
    let fields = match category {
        IntentCategory::Email => {
            "recipient_email, recipient_name, subject, email_body (signed with the user's sign-off)"
        }
        IntentCategory::Contact => {
            "contact_action (lookup | add | update | delete), contact_name, contact_email, \
             contact_phone, lookup_field (email | phone | address | all), update_field \
             (email | phone | address | notes), update_value"
        }
        IntentCategory::Calendar => {
            "calendar_action (list | create), calendar_summary, calendar_start and calendar_end \
             (RFC 3339 with offset), calendar_description"
        }
        IntentCategory::PlaceSearch => "place_query, place_location (area name or null)",
        IntentCategory::WebSearch | IntentCategory::General => "search_query",
    };

    let mut system = String::from(
        "You extract structured fields from chat messages for a personal assistant. \
         Respond only with one JSON object. Use null for anything the message does not say.",
    );
    if !memory_context.is_empty() {
        system.push_str("\n\n");
        system.push_str(memory_context);
    }

    let user = format!(
        "Current local time: {}\nCategory: {}\nFields: {fields}\n\nMessage:\n\"\"\"{}\"\"\"",
        now.to_rfc3339(),
        category.as_str(),
        sanitize_for_prompt(message),
    );
    Prompt { system, user }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Follow-up task recorded when the draft was first shown.
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisedDraft {
    subject: String,
    email_body: String,
}

pub fn revision_prompt(draft: &EmailDraft, instruction: &str) -> Prompt {
    Prompt {
        system: "You revise email drafts according to the user's feedback. Keep the recipient. \
                 Respond only with JSON: {\"subject\": ..., \"email_body\": ...}."
            .to_owned(),
        user: format!(
            "To: {}\nSubject: {}\nBody:\n{}\n\nRevision request: \"{}\"",
            draft.to,
            sanitize_for_prompt(&draft.subject),
            draft.body,
            sanitize_for_prompt(instruction),
        ),
    }
}

pub fn parse_revision(draft: &EmailDraft, raw: &str) -> Result<EmailDraft, ExtractionError> {
    let revised: RevisedDraft = parse_json_object(raw)?;
    if revised.subject.trim().is_empty() || revised.email_body.trim().is_empty() {
        return Err(ExtractionError::Shape("revision left subject or body empty".to_owned()));
    }
    Ok(EmailDraft {
        to: draft.to.clone(),
        subject: revised.subject,
        body: revised.email_body,
        task_id: draft.task_id.clone(),
    })
}

pub fn search_summary_prompt(query: &str, hits: &[SearchHit]) -> Prompt {
    let sources = hits
        .iter()
        .enumerate()
        .map(|(index, hit)| format!("[{}] {}: {}", index + 1, hit.title, hit.snippet))
        .collect::<Vec<_>>()
        .join("\n");
    Prompt {
        system: "Answer the question in at most five short sentences using only the numbered \
                 sources. Cite sources like [1]."
            .to_owned(),
        user: format!("Question: {}\n\nSources:\n{sources}", sanitize_for_prompt(query)),
    }
}

pub fn general_prompt(message: &str, memory_context: &str) -> Prompt {
    let mut system = String::from(
        "You are a concise personal assistant on WhatsApp. Answer briefly. If the request \
         needs an action you cannot take, say which of email, contacts, calendar, places or \
         web search could help.",
    );
    if !memory_context.is_empty() {
        system.push_str("\n\n");
        system.push_str(memory_context);
    }
    Prompt { system, user: sanitize_for_prompt(message) }
}

/// Supervised access to the completion service.
#[derive(Clone)]
pub struct LlmGateway {
    completion: Arc<dyn CompletionService>,
    supervisor: Supervisor,
    max_tokens: u32,
}

impl LlmGateway {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        supervisor: Supervisor,
        max_tokens: u32,
    ) -> Self {
        Self { completion, supervisor, max_tokens }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn complete(
        &self,
        operation: &str,
        prompt: &Prompt,
        limits: CompletionLimits,
        deadline: Deadline,
        budget: Duration,
    ) -> TaskResult<String, ServiceError> {
        self.supervisor
            .run_within(operation, deadline, budget, self.completion.complete(prompt, limits))
            .await
    }

    /// Mandatory structured extraction for a routed message.
    pub async fn extract(
        &self,
        category: IntentCategory,
        message: &str,
        memory_context: &str,
        now: DateTime<FixedOffset>,
        deadline: Deadline,
    ) -> Result<Extraction, TurnError> {
        let budget = self.supervisor.budgets().extraction;
        let prompt = extraction_prompt(category, message, memory_context, now);
        let raw = self
            .complete("llm.extract", &prompt, extraction_limits(self.max_tokens), deadline, budget)
            .await
            .into_required("llm.extract", budget)?;
        parse_json_object(&raw).map_err(|error| TurnError::dependency("llm.extract", error))
    }

    pub async fn revise_draft(
        &self,
        draft: &EmailDraft,
        instruction: &str,
        deadline: Deadline,
    ) -> Result<EmailDraft, TurnError> {
        let budget = self.supervisor.budgets().extraction;
        let raw = self
            .complete(
                "llm.revise_draft",
                &revision_prompt(draft, instruction),
                extraction_limits(self.max_tokens),
                deadline,
                budget,
            )
            .await
            .into_required("llm.revise_draft", budget)?;
        parse_revision(draft, &raw)
            .map_err(|error| TurnError::dependency("llm.revise_draft", error))
    }

    pub fn reply_limits(&self) -> CompletionLimits {
        CompletionLimits { max_tokens: self.max_tokens, ..CompletionLimits::default() }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use concierge_core::domain::intent::IntentCategory;

    use super::{
        extraction_prompt, parse_json_object, parse_revision, present, sanitize_for_prompt,
        EmailDraft, Extraction, ExtractionError,
    };

    #[test]
    fn sanitize_removes_control_characters_and_quotes() {
        let sanitized = sanitize_for_prompt("Tell \"John\"\u{0007} the\n\n  report\tis late");
        assert_eq!(sanitized, "Tell 'John' the report is late");
    }

    #[test]
    fn extraction_parses_inside_code_fences() {
        let raw = "```json\n{\"recipient_name\": \"John\", \"subject\": \"Report\", \"email_body\": null}\n```";
        let extraction: Extraction = parse_json_object(raw).expect("valid json");

        assert_eq!(present(&extraction.recipient_name), Some("John"));
        assert_eq!(present(&extraction.email_body), None);
        assert_eq!(present(&Some("N/A".to_owned())), None);
    }

    #[test]
    fn missing_json_is_reported() {
        let result = parse_json_object::<Extraction>("I could not help with that");
        assert_eq!(result, Err(ExtractionError::MissingJson));
    }

    #[test]
    fn revision_keeps_recipient() {
        let draft = EmailDraft {
            to: "john@example.com".to_owned(),
            subject: "Report".to_owned(),
            body: "Hi John".to_owned(),
            task_id: Some("task-report".to_owned()),
        };
        let revised = parse_revision(
            &draft,
            r#"{"to_email": "someone@else.com", "subject": "Q3 report", "email_body": "Hello John"}"#,
        )
        .expect("valid revision");

        assert_eq!(revised.to, "john@example.com");
        assert_eq!(revised.subject, "Q3 report");
        assert_eq!(revised.task_id.as_deref(), Some("task-report"));
    }

    #[test]
    fn extraction_prompt_carries_memory_and_sanitized_message() {
        let now = FixedOffset::east_opt(4 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
            .single()
            .expect("time");
        let prompt = extraction_prompt(
            IntentCategory::Email,
            "email \"John\"",
            "Preferences:\n- email tone: polite",
            now,
        );

        assert!(prompt.system.contains("email tone: polite"));
        assert!(prompt.user.contains("email 'John'"));
        assert!(prompt.user.contains("2026-10-16T09:00:00+04:00"));
    }
}
