//! Conversation state that spans two turns: an email draft waiting for
//! confirmation, or a place search waiting for an area.

use std::collections::HashMap;
use std::sync::Mutex;

use concierge_core::domain::memory::UserId;

use crate::llm::EmailDraft;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingAction {
    EmailDraft(EmailDraft),
    PlaceQuery { query: String },
}

#[derive(Default)]
pub struct SessionStore {
    pending: Mutex<HashMap<UserId, PendingAction>>,
}

impl SessionStore {
    pub fn put(&self, user_id: &UserId, action: PendingAction) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.insert(user_id.clone(), action);
    }

    pub fn take(&self, user_id: &UserId) -> Option<PendingAction> {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.remove(user_id)
    }

    pub fn len(&self) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a reply to a pending draft should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DraftReply {
    Approve,
    Cancel,
    Revise,
}

const CANCEL_PHRASES: &[&str] = &["no", "nope", "cancel", "don t send", "do not send", "discard"];
const APPROVE_PHRASES: &[&str] =
    &["yes", "yep", "send it", "please send", "go ahead", "confirm", "approve", "ok send"];

/// Cancellation wins over approval so "no, don't send it" is never read as
/// "send it".
pub fn classify_draft_reply(text: &str) -> DraftReply {
    let normalized = format!(
        " {} ",
        text.to_lowercase()
            .split(|character: char| !character.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    );
    let says = |phrase: &&str| normalized.contains(&format!(" {phrase} "));

    if CANCEL_PHRASES.iter().any(says) {
        DraftReply::Cancel
    } else if APPROVE_PHRASES.iter().any(says) {
        DraftReply::Approve
    } else {
        DraftReply::Revise
    }
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::memory::UserId;

    use super::{classify_draft_reply, DraftReply, PendingAction, SessionStore};

    #[test]
    fn draft_replies_are_classified() {
        assert_eq!(classify_draft_reply("Yes, send it"), DraftReply::Approve);
        assert_eq!(classify_draft_reply("go ahead"), DraftReply::Approve);
        assert_eq!(classify_draft_reply("No"), DraftReply::Cancel);
        assert_eq!(classify_draft_reply("no, don't send it"), DraftReply::Cancel);
        assert_eq!(classify_draft_reply("make it shorter"), DraftReply::Revise);
        assert_eq!(classify_draft_reply("mention yesterday's call"), DraftReply::Revise);
    }

    #[test]
    fn pending_action_is_taken_once() {
        let sessions = SessionStore::default();
        let user = UserId::new("whatsapp:+1");
        sessions.put(&user, PendingAction::PlaceQuery { query: "sushi".to_owned() });

        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions.take(&user),
            Some(PendingAction::PlaceQuery { query: "sushi".to_owned() })
        );
        assert!(sessions.take(&user).is_none());
    }
}
