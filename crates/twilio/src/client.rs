use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use concierge_core::config::TwilioConfig;
use concierge_core::domain::memory::UserId;
use concierge_core::errors::ServiceError;
use concierge_core::ports::MessagingTransport;

use crate::delayed::DelayedReplies;

/// Twilio error code for "account exceeded the daily messages limit".
pub const DAILY_LIMIT_ERROR_CODE: u32 = 63038;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TwilioError {
    #[error("twilio request failed: {0}")]
    Http(String),
    #[error("twilio rejected the message ({status}, code {code:?}): {message}")]
    Api { status: u16, code: Option<u32>, message: String },
    #[error("twilio daily message limit reached")]
    DailyLimit,
}

impl From<TwilioError> for ServiceError {
    fn from(value: TwilioError) -> Self {
        match value {
            TwilioError::Http(message) => ServiceError::Unavailable(message),
            TwilioError::DailyLimit => ServiceError::RateLimited(value.to_string()),
            TwilioError::Api { status: 429, .. } => ServiceError::RateLimited(value.to_string()),
            TwilioError::Api { .. } => ServiceError::Rejected(value.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u32>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageCreated {
    sid: String,
}

/// Maps a non-success Twilio response onto [`TwilioError`].
pub fn classify_failure(status: u16, body: &str) -> TwilioError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|error| error.code);
    let message = parsed
        .and_then(|error| error.message)
        .unwrap_or_else(|| body.chars().take(200).collect::<String>());

    if code == Some(DAILY_LIMIT_ERROR_CODE)
        || message.to_ascii_lowercase().contains("daily messages limit")
    {
        return TwilioError::DailyLimit;
    }
    TwilioError::Api { status, code, message }
}

/// Normalizes a configured sender number into Twilio's `whatsapp:` address form.
pub fn whatsapp_address(number: &str) -> String {
    let number = number.trim();
    if number.starts_with("whatsapp:") {
        number.to_owned()
    } else {
        format!("whatsapp:{number}")
    }
}

/// [`MessagingTransport`] backed by the Twilio Messages API.
pub struct TwilioMessenger {
    client: reqwest::Client,
    account_sid: String,
    auth_token: SecretString,
    from: String,
    api_base_url: String,
    delayed: DelayedReplies,
}

impl TwilioMessenger {
    pub fn new(config: &TwilioConfig, delayed: DelayedReplies) -> Result<Self, TwilioError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| TwilioError::Http(error.to_string()))?;
        Ok(Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from: whatsapp_address(&config.whatsapp_number),
            api_base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            delayed,
        })
    }

    pub fn delayed_replies(&self) -> &DelayedReplies {
        &self.delayed
    }

    fn messages_url(&self) -> String {
        format!("{}/2010-04-01/Accounts/{}/Messages.json", self.api_base_url, self.account_sid)
    }

    async fn post_message(&self, to: &str, body: &str) -> Result<String, TwilioError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[("To", to), ("From", self.from.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|error| TwilioError::Http(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &text));
        }

        let created: MessageCreated =
            response.json().await.map_err(|error| TwilioError::Http(error.to_string()))?;
        Ok(created.sid)
    }
}

#[async_trait]
impl MessagingTransport for TwilioMessenger {
    async fn send(&self, user_id: &UserId, text: &str) -> Result<(), ServiceError> {
        match self.post_message(user_id.as_str(), text).await {
            Ok(sid) => {
                info!(
                    event_name = "transport.message_sent",
                    user_id = %user_id,
                    message_sid = %sid,
                    "whatsapp reply sent"
                );
                Ok(())
            }
            Err(TwilioError::DailyLimit) => {
                warn!(
                    event_name = "transport.daily_limit",
                    user_id = %user_id,
                    "daily limit reached; holding reply for the next webhook call"
                );
                self.delayed.store(user_id.as_str(), text);
                Err(TwilioError::DailyLimit.into())
            }
            Err(error) => {
                warn!(
                    event_name = "transport.send_failed",
                    user_id = %user_id,
                    error = %error,
                    "whatsapp reply failed"
                );
                Err(error.into())
            }
        }
    }

    async fn send_interim(&self, user_id: &UserId, text: &str) -> Result<(), ServiceError> {
        self.post_message(user_id.as_str(), text).await.map(|_| ()).map_err(|error| {
            warn!(
                event_name = "transport.interim_failed",
                user_id = %user_id,
                error = %error,
                "interim notice failed"
            );
            error.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use concierge_core::errors::ServiceError;

    use super::{classify_failure, whatsapp_address, TwilioError, DAILY_LIMIT_ERROR_CODE};

    #[test]
    fn daily_limit_is_detected_by_code_or_message() {
        let by_code = classify_failure(
            429,
            &format!(r#"{{"code": {DAILY_LIMIT_ERROR_CODE}, "message": "limit", "status": 429}}"#),
        );
        assert_eq!(by_code, TwilioError::DailyLimit);

        let by_message = classify_failure(
            400,
            r#"{"code": 21000, "message": "Account exceeded the 50 daily messages limit"}"#,
        );
        assert_eq!(by_message, TwilioError::DailyLimit);
    }

    #[test]
    fn other_failures_keep_status_and_code() {
        let error =
            classify_failure(400, r#"{"code": 21211, "message": "Invalid 'To' Phone Number"}"#);
        assert_eq!(
            error,
            TwilioError::Api {
                status: 400,
                code: Some(21211),
                message: "Invalid 'To' Phone Number".to_owned(),
            }
        );
        assert!(matches!(ServiceError::from(error), ServiceError::Rejected(_)));

        let unparsable = classify_failure(502, "bad gateway");
        assert!(matches!(unparsable, TwilioError::Api { status: 502, code: None, .. }));
    }

    #[test]
    fn sender_number_gets_whatsapp_prefix_once() {
        assert_eq!(whatsapp_address("+14155238886"), "whatsapp:+14155238886");
        assert_eq!(whatsapp_address("whatsapp:+14155238886"), "whatsapp:+14155238886");
    }
}
