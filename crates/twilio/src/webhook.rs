use serde::Deserialize;
use thiserror::Error;

use concierge_core::domain::memory::UserId;

pub const AUDIO_UNSUPPORTED_REPLY: &str =
    "Sorry, I couldn't transcribe your voice message. Please type your request instead.";

/// Form fields Twilio posts to the inbound-message webhook.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct WebhookForm {
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
    #[serde(rename = "MediaContentType0", default)]
    pub media_content_type: Option<String>,
    #[serde(rename = "MediaUrl0", default)]
    pub media_url: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook payload is missing the `From` field")]
    MissingSender,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMedia {
    pub content_type: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: UserId,
    pub body: String,
    pub media: Option<InboundMedia>,
}

/// What the runtime should do with an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnInput {
    Text(String),
    UntranscribableAudio,
}

impl InboundMessage {
    pub fn from_form(form: WebhookForm) -> Result<Self, WebhookError> {
        let from = form.from.trim();
        if from.is_empty() {
            return Err(WebhookError::MissingSender);
        }

        let media_count = form
            .num_media
            .as_deref()
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let media = match (media_count, form.media_content_type) {
            (0, _) | (_, None) => None,
            (_, Some(content_type)) => Some(InboundMedia {
                content_type,
                url: form.media_url.unwrap_or_default(),
            }),
        };

        Ok(Self { from: UserId::new(from), body: form.body, media })
    }

    pub fn is_audio(&self) -> bool {
        self.media.as_ref().is_some_and(|media| media.content_type.starts_with("audio"))
    }

    /// Audio is never transcribed; an audio note with no text cannot be handled.
    pub fn turn_input(&self) -> TurnInput {
        let text = self.body.trim();
        if self.is_audio() && text.is_empty() {
            TurnInput::UntranscribableAudio
        } else {
            TurnInput::Text(text.to_owned())
        }
    }
}
