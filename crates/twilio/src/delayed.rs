use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Replies Twilio refused to deliver because of the daily message limit.
///
/// The next webhook call from the same sender returns the held reply inline.
#[derive(Clone, Default)]
pub struct DelayedReplies {
    replies: Arc<Mutex<HashMap<String, String>>>,
}

impl DelayedReplies {
    pub fn store(&self, to: &str, reply: &str) {
        let mut replies = match self.replies.lock() {
            Ok(replies) => replies,
            Err(poisoned) => poisoned.into_inner(),
        };
        replies.insert(to.to_owned(), reply.to_owned());
    }

    pub fn take(&self, from: &str) -> Option<String> {
        let mut replies = match self.replies.lock() {
            Ok(replies) => replies,
            Err(poisoned) => poisoned.into_inner(),
        };
        replies.remove(from)
    }

    pub fn len(&self) -> usize {
        match self.replies.lock() {
            Ok(replies) => replies.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
