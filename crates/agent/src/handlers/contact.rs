use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use concierge_core::cache::{CacheError, RecordCache};
use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::record::{find_by_name, Record, TableName};
use concierge_core::errors::{ServiceError, TurnError};
use concierge_core::supervisor::Deadline;

use super::{cache_failure, ActionHandler, HandlerOutcome, TurnContext};
use crate::llm::{present, Extraction, LlmGateway};

const EDITABLE_FIELDS: [&str; 4] = ["email", "phone", "address", "notes"];

/// Spoken-style addresses ("sam at example dot com") to a plain address.
pub fn normalize_email(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let spoken = lowered.replace(" at ", "@").replace(" dot ", ".");
    spoken.split_whitespace().collect()
}

fn describe(record: &Record, field: Option<&str>) -> String {
    match field.filter(|field| !field.eq_ignore_ascii_case("all")) {
        Some(field) => match record.field(field).filter(|value| !value.trim().is_empty()) {
            Some(value) => format!("{}'s {field}: {value}", record.key),
            None => format!("{} has no {field} saved.", record.key),
        },
        None => {
            let mut lines = vec![record.key.clone()];
            for (name, value) in &record.fields {
                if !value.trim().is_empty() {
                    lines.push(format!("{}: {value}", capitalize(name)));
                }
            }
            lines.join("\n")
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut characters = word.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters).collect(),
        None => String::new(),
    }
}

fn is_missing_record(error: &CacheError) -> bool {
    matches!(error, CacheError::Write { cause: ServiceError::NotFound(_), .. })
}

/// Looks up and edits the contacts table through the record cache.
pub struct ContactHandler {
    llm: LlmGateway,
    records: Arc<RecordCache>,
    contacts: TableName,
}

impl ContactHandler {
    pub fn new(llm: LlmGateway, records: Arc<RecordCache>, contacts: TableName) -> Self {
        Self { llm, records, contacts }
    }

    async fn find(&self, name: &str, deadline: Deadline) -> Result<Option<Record>, TurnError> {
        let snapshot = self
            .records
            .get_within(&self.contacts, deadline)
            .await
            .map_err(|error| cache_failure("contacts.lookup", error))?;
        Ok(find_by_name(&snapshot, name).cloned())
    }

    async fn lookup(
        &self,
        name: &str,
        extraction: &Extraction,
        deadline: Deadline,
    ) -> Result<HandlerOutcome, TurnError> {
        let field = present(&extraction.lookup_field);
        Ok(match self.find(name, deadline).await? {
            Some(record) => HandlerOutcome::reply(describe(&record, field)),
            None => HandlerOutcome::reply(format!("I couldn't find {name} in your contacts.")),
        })
    }

    async fn add(
        &self,
        name: &str,
        extraction: &Extraction,
        deadline: Deadline,
    ) -> Result<HandlerOutcome, TurnError> {
        if let Some(existing) =
            self.find(name, deadline).await?.filter(|record| record.key_matches(name))
        {
            return Ok(HandlerOutcome::reply(format!(
                "{} is already in your contacts.",
                existing.key
            )));
        }

        let mut record = Record::new(name);
        if let Some(email) = present(&extraction.contact_email) {
            let email = normalize_email(email);
            if !email.contains('@') {
                return Ok(HandlerOutcome::reply(format!(
                    "\"{email}\" doesn't look like an email address. Could you check it?"
                )));
            }
            record = record.with_field("email", email);
        }
        if let Some(phone) = present(&extraction.contact_phone) {
            record = record.with_field("phone", phone);
        }

        self.records
            .create_within(&self.contacts, record, deadline)
            .await
            .map_err(|error| cache_failure("contacts.create", error))?;
        info!(event_name = "contacts.created", contact = name, "contact added");
        Ok(HandlerOutcome::reply(format!("Added {name} to your contacts.")))
    }

    async fn update(
        &self,
        name: &str,
        extraction: &Extraction,
        deadline: Deadline,
    ) -> Result<HandlerOutcome, TurnError> {
        let field = present(&extraction.update_field).map(str::to_lowercase);
        let Some(field) = field.filter(|field| EDITABLE_FIELDS.contains(&field.as_str())) else {
            return Ok(HandlerOutcome::reply(
                "Which detail should I update: email, phone, address or notes?",
            ));
        };
        let Some(value) = present(&extraction.update_value) else {
            return Ok(HandlerOutcome::reply(format!("What should {name}'s new {field} be?")));
        };
        let value = if field == "email" { normalize_email(value) } else { value.to_owned() };

        let Some(record) = self.find(name, deadline).await? else {
            return Ok(HandlerOutcome::reply(format!("I couldn't find {name} in your contacts.")));
        };
        match self
            .records
            .update_field_within(&self.contacts, &record.key, &field, &value, deadline)
            .await
        {
            Ok(()) => {
                info!(
                    event_name = "contacts.updated",
                    contact = %record.key,
                    field = %field,
                    "contact updated"
                );
                Ok(HandlerOutcome::reply(format!("Updated {}'s {field} to {value}.", record.key)))
            }
            Err(error) if is_missing_record(&error) => Ok(HandlerOutcome::reply(format!(
                "I couldn't find {} in your contacts anymore.",
                record.key
            ))),
            Err(error) => Err(cache_failure("contacts.update", error)),
        }
    }

    async fn delete(&self, name: &str, deadline: Deadline) -> Result<HandlerOutcome, TurnError> {
        let Some(record) = self.find(name, deadline).await? else {
            return Ok(HandlerOutcome::reply(format!("I couldn't find {name} in your contacts.")));
        };
        match self.records.delete_within(&self.contacts, &record.key, deadline).await {
            Ok(()) => {
                Ok(HandlerOutcome::reply(format!("Removed {} from your contacts.", record.key)))
            }
            Err(error) if is_missing_record(&error) => Ok(HandlerOutcome::reply(format!(
                "{} was already removed from your contacts.",
                record.key
            ))),
            Err(error) => Err(cache_failure("contacts.delete", error)),
        }
    }
}

#[async_trait]
impl ActionHandler for ContactHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::Contact
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let extraction = self
            .llm
            .extract(IntentCategory::Contact, &turn.message, &turn.memory, turn.now, turn.deadline)
            .await?;
        let Some(name) = present(&extraction.contact_name) else {
            return Ok(HandlerOutcome::reply("Which contact do you mean?"));
        };
        let action = present(&extraction.contact_action).unwrap_or("lookup").to_lowercase();

        match action.as_str() {
            "lookup" | "find" | "get" => self.lookup(name, &extraction, turn.deadline).await,
            "add" | "create" => self.add(name, &extraction, turn.deadline).await,
            "update" | "edit" | "change" => self.update(name, &extraction, turn.deadline).await,
            "delete" | "remove" => self.delete(name, turn.deadline).await,
            _ => Ok(HandlerOutcome::reply(
                "Do you want me to look up, add, update or delete a contact?",
            )),
        }
    }
}
