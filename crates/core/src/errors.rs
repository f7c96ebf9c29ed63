use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external collaborator behind one of the port traits.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl ServiceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

/// Turn-level failure taxonomy. Only mandatory calls produce these; optional
/// lookups degrade to their fallback and never reach this type.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("{operation} timed out after {budget:?}")]
    Timeout { operation: String, budget: Duration },
    #[error("{operation} failed: {cause}")]
    DependencyFailure { operation: String, cause: String },
    #[error("message could not be classified with enough confidence")]
    ClassificationAmbiguous,
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl TurnError {
    pub fn dependency(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::DependencyFailure { operation: operation.into(), cause: cause.to_string() }
    }

    pub fn into_reply(self, correlation_id: impl Into<String>) -> ReplyError {
        let correlation_id = correlation_id.into();
        let mut mapped = ReplyError::from(self);
        match &mut mapped {
            ReplyError::Retryable { correlation_id: id, .. }
            | ReplyError::Unclear { correlation_id: id, .. }
            | ReplyError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

/// A turn failure shaped for the person on the other end of the chat.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("retryable failure: {message}")]
    Retryable { message: String, correlation_id: String },
    #[error("unclear request: {message}")]
    Unclear { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl ReplyError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Retryable { .. } => {
                "Sorry, I couldn't finish that just now because a service I rely on is slow or \
                 unavailable. Please try again in a minute."
            }
            Self::Unclear { .. } => {
                "Sorry, I'm not sure what you'd like me to do. Could you rephrase that?"
            }
            Self::Internal { .. } => "Sorry, something went wrong on my side. Please try again.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Retryable { correlation_id, .. }
            | Self::Unclear { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl From<TurnError> for ReplyError {
    fn from(value: TurnError) -> Self {
        let message = value.to_string();
        match value {
            TurnError::Timeout { .. } | TurnError::DependencyFailure { .. } => {
                Self::Retryable { message, correlation_id: "unassigned".to_owned() }
            }
            TurnError::ClassificationAmbiguous => {
                Self::Unclear { message, correlation_id: "unassigned".to_owned() }
            }
            TurnError::Configuration(_) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::{ReplyError, TurnError};

    #[test]
    fn timeout_maps_to_retryable_reply_with_correlation_id() {
        let reply = TurnError::Timeout {
            operation: "llm.extract".to_owned(),
            budget: Duration::from_secs(25),
        }
        .into_reply("turn-1");

        assert!(matches!(
            reply,
            ReplyError::Retryable { ref correlation_id, .. } if correlation_id == "turn-1"
        ));
        assert!(reply.user_message().contains("try again"));
    }

    #[test]
    fn user_message_never_contains_internal_error_text() {
        let reply = TurnError::dependency("contacts.update", "sheet quota exceeded for key 12")
            .into_reply("turn-2");

        assert!(reply.to_string().contains("sheet quota exceeded"));
        assert!(!reply.user_message().contains("quota"));
        assert!(!reply.user_message().contains("contacts.update"));
    }

    #[test]
    fn ambiguous_classification_asks_to_rephrase() {
        let reply = TurnError::ClassificationAmbiguous.into_reply("turn-3");

        assert!(matches!(reply, ReplyError::Unclear { .. }));
        assert!(reply.user_message().contains("rephrase"));
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let reply = TurnError::Configuration("no email sender".to_owned()).into_reply("turn-4");

        assert!(matches!(reply, ReplyError::Internal { .. }));
        assert_eq!(reply.correlation_id(), "turn-4");
    }
}
