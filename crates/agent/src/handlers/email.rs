use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use concierge_core::cache::RecordCache;
use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::memory::{new_task_id, TaskStatus};
use concierge_core::domain::record::{find_by_name, TableName};
use concierge_core::errors::TurnError;
use concierge_core::ports::{EmailSender, OutgoingEmail};
use concierge_core::supervisor::{Deadline, TaskResult};

use super::{cache_failure, ActionHandler, HandlerOutcome, TurnContext};
use crate::deferred::{TaskResolution, WriteSignals};
use crate::llm::{present, EmailDraft, LlmGateway};
use crate::session::{classify_draft_reply, DraftReply, PendingAction, SessionStore};

/// Drafts emails and holds them until the user confirms.
pub struct EmailHandler {
    llm: LlmGateway,
    records: Arc<RecordCache>,
    contacts: TableName,
    sessions: Arc<SessionStore>,
    sender: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(
        llm: LlmGateway,
        records: Arc<RecordCache>,
        contacts: TableName,
        sessions: Arc<SessionStore>,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        Self { llm, records, contacts, sessions, sender }
    }

    async fn email_for(&self, name: &str, deadline: Deadline) -> Result<Option<String>, TurnError> {
        let snapshot = self
            .records
            .get_within(&self.contacts, deadline)
            .await
            .map_err(|error| cache_failure("contacts.lookup", error))?;
        Ok(find_by_name(&snapshot, name)
            .and_then(|record| record.field("email"))
            .map(str::trim)
            .filter(|email| email.contains('@'))
            .map(str::to_owned))
    }

    /// Continues a conversation that has a draft waiting for confirmation.
    pub async fn resolve_draft(
        &self,
        turn: &TurnContext,
        draft: EmailDraft,
    ) -> Result<HandlerOutcome, TurnError> {
        match classify_draft_reply(&turn.message) {
            DraftReply::Cancel => {
                Ok(HandlerOutcome::reply("Email draft cancelled. No email was sent.").with_signals(
                    WriteSignals {
                        resolved_task: resolution(&draft, TaskStatus::Cancelled),
                        ..WriteSignals::default()
                    },
                ))
            }
            DraftReply::Approve => {
                let budget = self.llm.supervisor().budgets().external_write;
                let email = OutgoingEmail {
                    to: draft.to.clone(),
                    subject: draft.subject.clone(),
                    body: draft.body.clone(),
                };
                let sent = self
                    .llm
                    .supervisor()
                    .run_within("email.send", turn.deadline, budget, self.sender.send(&email))
                    .await;
                let message_id = match sent {
                    TaskResult::Success(message_id) => message_id,
                    TaskResult::Timeout => {
                        // The provider may have accepted it; never offer a resend.
                        warn!(
                            event_name = "email.send_unconfirmed",
                            correlation_id = %turn.correlation_id,
                            "email send timed out; delivery unknown"
                        );
                        return Ok(HandlerOutcome::reply(format!(
                            "I couldn't confirm that the email to {} went out. It may already \
                             have been sent, so please check your Sent folder before asking me \
                             to write it again.",
                            draft.to
                        )));
                    }
                    TaskResult::Failure(cause) => {
                        // Refused before delivery; a plain "yes" can retry.
                        self.sessions.put(&turn.user_id, PendingAction::EmailDraft(draft));
                        return Err(TurnError::dependency("email.send", cause));
                    }
                };
                info!(
                    event_name = "email.sent",
                    correlation_id = %turn.correlation_id,
                    message_id = %message_id,
                    "email delivered to provider"
                );
                let resolved_task = resolution(&draft, TaskStatus::Done);
                Ok(HandlerOutcome::reply(format!(
                    "Email sent.\n\nTo: {}\nSubject: {}",
                    draft.to, draft.subject
                ))
                .with_signals(WriteSignals {
                    email_body: Some(draft.body),
                    resolved_task,
                    ..WriteSignals::default()
                }))
            }
            DraftReply::Revise => {
                match self.llm.revise_draft(&draft, &turn.message, turn.deadline).await {
                    Ok(revised) => {
                        let reply = draft_reply("Here is your revised email draft", &revised);
                        self.sessions.put(&turn.user_id, PendingAction::EmailDraft(revised));
                        Ok(HandlerOutcome::reply(reply))
                    }
                    Err(error) => {
                        self.sessions.put(&turn.user_id, PendingAction::EmailDraft(draft));
                        Err(error)
                    }
                }
            }
        }
    }
}

fn resolution(draft: &EmailDraft, status: TaskStatus) -> Option<TaskResolution> {
    draft.task_id.clone().map(|task_id| TaskResolution { task_id, status })
}

fn draft_reply(intro: &str, draft: &EmailDraft) -> String {
    format!(
        "{intro}:\n\nTo: {}\nSubject: {}\n\n{}\n\nReply 'Yes, send it' to send, describe any \
         changes, or 'No' to cancel.",
        draft.to, draft.subject, draft.body
    )
}

#[async_trait]
impl ActionHandler for EmailHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::Email
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let extraction = self
            .llm
            .extract(IntentCategory::Email, &turn.message, &turn.memory, turn.now, turn.deadline)
            .await?;

        let explicit = present(&extraction.recipient_email).filter(|email| email.contains('@'));
        let to = match (explicit, present(&extraction.recipient_name)) {
            (Some(email), _) => email.to_owned(),
            (None, Some(name)) => match self.email_for(name, turn.deadline).await? {
                Some(email) => email,
                None => {
                    return Ok(HandlerOutcome::reply(format!(
                        "I couldn't find an email address for {name} in your contacts."
                    )))
                }
            },
            (None, None) => return Ok(HandlerOutcome::reply("Who should I send the email to?")),
        };

        let (Some(subject), Some(body)) =
            (present(&extraction.subject), present(&extraction.email_body))
        else {
            return Ok(HandlerOutcome::reply(
                "I couldn't work out the email details. Could you say who it is for and what \
                 it should say?",
            ));
        };

        let draft = EmailDraft {
            to,
            subject: subject.to_owned(),
            body: body.to_owned(),
            task_id: Some(new_task_id()),
        };
        let reply = draft_reply("Here is your email draft", &draft);
        let signals = WriteSignals {
            email_body: Some(draft.body.clone()),
            task_description: Some(format!("Email {}: {}", draft.to, draft.subject)),
            task_id: draft.task_id.clone(),
            ..WriteSignals::default()
        };
        self.sessions.put(&turn.user_id, PendingAction::EmailDraft(draft));
        Ok(HandlerOutcome::reply(reply).with_signals(signals))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::time::Duration;

    use concierge_core::domain::memory::TaskStatus;
    use concierge_core::domain::record::TableName;
    use concierge_core::errors::TurnError;

    use super::EmailHandler;
    use crate::deferred::TaskResolution;
    use crate::handlers::ActionHandler;
    use crate::llm::EmailDraft;
    use crate::session::{PendingAction, SessionStore};
    use crate::testing::{
        contacts_cache, gateway, turn, user, RecordingEmailSender, ScriptedCompletion,
    };

    const JOHN_EXTRACTION: &str = r#"{"recipient_name": "John", "subject": "Friday lunch",
        "email_body": "Hi John,\n\nAre we still on for Friday?\n\nBest regards"}"#;

    fn handler(
        completion: Arc<ScriptedCompletion>,
        sender: Arc<RecordingEmailSender>,
    ) -> (EmailHandler, Arc<SessionStore>) {
        let (_, cache) = contacts_cache();
        let sessions = Arc::new(SessionStore::default());
        let handler = EmailHandler::new(
            gateway(completion),
            cache,
            TableName::contacts(),
            sessions.clone(),
            sender,
        );
        (handler, sessions)
    }

    fn pending_draft(sessions: &SessionStore) -> EmailDraft {
        match sessions.take(&user()) {
            Some(PendingAction::EmailDraft(draft)) => draft,
            other => panic!("expected a pending draft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drafts_to_a_contact_and_waits_for_confirmation() {
        let sender = Arc::new(RecordingEmailSender::default());
        let (handler, sessions) =
            handler(ScriptedCompletion::new([JOHN_EXTRACTION]), sender.clone());

        let outcome = handler.handle(&turn("email John about lunch on Friday")).await.unwrap();

        assert!(outcome.reply.contains("To: john.carter@example.com"));
        assert!(outcome.reply.contains("Reply 'Yes, send it'"));
        assert_eq!(outcome.signals.task_description.as_deref(), Some("Email john.carter@example.com: Friday lunch"));
        assert!(sender.sent().is_empty());
        let draft = pending_draft(&sessions);
        assert_eq!(draft.subject, "Friday lunch");
        assert!(draft.task_id.is_some());
        assert_eq!(outcome.signals.task_id, draft.task_id);
    }

    #[tokio::test]
    async fn unknown_recipient_is_reported_without_a_draft() {
        let extraction = r#"{"recipient_name": "Zed", "subject": "Hi", "email_body": "Hello"}"#;
        let (handler, sessions) = handler(
            ScriptedCompletion::new([extraction]),
            Arc::new(RecordingEmailSender::default()),
        );

        let outcome = handler.handle(&turn("email Zed hello")).await.unwrap();

        assert!(outcome.reply.contains("couldn't find an email address for Zed"));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn approval_sends_the_stored_draft() {
        let sender = Arc::new(RecordingEmailSender::default());
        let (handler, sessions) = handler(ScriptedCompletion::new([]), sender.clone());
        let draft = EmailDraft {
            to: "amira@example.com".to_owned(),
            subject: "Slides".to_owned(),
            body: "Attached are the slides.".to_owned(),
            task_id: Some("task-slides".to_owned()),
        };

        let outcome = handler.resolve_draft(&turn("Yes, send it"), draft).await.unwrap();

        assert!(outcome.reply.starts_with("Email sent."));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].to, "amira@example.com");
        assert!(sessions.is_empty());
        assert_eq!(
            outcome.signals.resolved_task,
            Some(TaskResolution { task_id: "task-slides".to_owned(), status: TaskStatus::Done })
        );
    }

    #[tokio::test]
    async fn failed_send_keeps_the_draft_for_another_try() {
        let (handler, sessions) = handler(
            ScriptedCompletion::new([]),
            Arc::new(RecordingEmailSender::failing()),
        );
        let draft = EmailDraft {
            to: "amira@example.com".to_owned(),
            subject: "Slides".to_owned(),
            body: "Attached.".to_owned(),
            task_id: Some("task-slides".to_owned()),
        };

        let error = handler.resolve_draft(&turn("yes"), draft.clone()).await.unwrap_err();

        assert!(matches!(error, TurnError::DependencyFailure { ref operation, .. } if operation == "email.send"));
        assert_eq!(pending_draft(&sessions), draft);
    }

    #[tokio::test]
    async fn cancel_discards_the_draft() {
        let sender = Arc::new(RecordingEmailSender::default());
        let (handler, sessions) = handler(ScriptedCompletion::new([]), sender.clone());
        let draft = EmailDraft {
            to: "amira@example.com".to_owned(),
            subject: "Slides".to_owned(),
            body: "Attached.".to_owned(),
            task_id: Some("task-slides".to_owned()),
        };

        let outcome = handler.resolve_draft(&turn("no, don't send it"), draft).await.unwrap();

        assert!(outcome.reply.contains("cancelled"));
        assert!(sender.sent().is_empty());
        assert!(sessions.is_empty());
        assert_eq!(
            outcome.signals.resolved_task,
            Some(TaskResolution {
                task_id: "task-slides".to_owned(),
                status: TaskStatus::Cancelled,
            })
        );
    }

    #[tokio::test]
    async fn revision_replaces_the_pending_draft() {
        let completion = ScriptedCompletion::new([
            r#"{"subject": "Slides for Monday", "email_body": "Hi Amira, slides attached."}"#,
        ]);
        let (handler, sessions) =
            handler(completion.clone(), Arc::new(RecordingEmailSender::default()));
        let draft = EmailDraft {
            to: "amira@example.com".to_owned(),
            subject: "Slides".to_owned(),
            body: "Attached.".to_owned(),
            task_id: Some("task-slides".to_owned()),
        };

        let outcome =
            handler.resolve_draft(&turn("make it friendlier and mention Monday"), draft).await.unwrap();

        assert!(outcome.reply.contains("revised email draft"));
        let revised = pending_draft(&sessions);
        assert_eq!(revised.to, "amira@example.com");
        assert_eq!(revised.subject, "Slides for Monday");
        assert_eq!(revised.task_id.as_deref(), Some("task-slides"));
        assert!(completion.prompts()[0].user.contains("mention Monday"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_does_not_offer_the_draft_again() {
        let sender = Arc::new(RecordingEmailSender::slow(Duration::from_secs(30)));
        let (handler, sessions) = handler(ScriptedCompletion::new([]), sender.clone());
        let draft = EmailDraft {
            to: "amira@example.com".to_owned(),
            subject: "Slides".to_owned(),
            body: "Attached.".to_owned(),
            task_id: Some("task-slides".to_owned()),
        };

        let outcome = handler.resolve_draft(&turn("yes"), draft).await.unwrap();

        assert!(outcome.reply.contains("may already have been sent"), "{}", outcome.reply);
        assert!(sessions.is_empty(), "a plain yes must not send it a second time");
        assert_eq!(outcome.signals.resolved_task, None);
    }
}
