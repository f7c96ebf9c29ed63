//! Twilio WhatsApp integration
//!
//! - **Client** (`client`) - outbound messages through the Twilio REST API
//! - **Webhook** (`webhook`) - inbound form payloads normalized into turn input
//! - **Delayed replies** (`delayed`) - replies held back after a daily-limit rejection
//!
//! ```text
//! Twilio POST /webhook → InboundMessage → AgentRuntime::handle_turn
//!                                               ↓
//!                       TwilioMessenger::send ← reply
//! ```

pub mod client;
pub mod delayed;
pub mod webhook;

pub use client::{TwilioError, TwilioMessenger};
pub use delayed::DelayedReplies;
pub use webhook::{
    InboundMedia, InboundMessage, TurnInput, WebhookError, WebhookForm, AUDIO_UNSUPPORTED_REPLY,
};
