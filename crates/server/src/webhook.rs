use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Form, Router};
use tokio::sync::Notify;
use tracing::{info, warn};

use concierge_agent::AgentRuntime;
use concierge_twilio::{
    DelayedReplies, InboundMessage, TurnInput, WebhookForm, AUDIO_UNSUPPORTED_REPLY,
};

/// Counts turns still running after their webhook call returned.
#[derive(Clone, Default)]
pub struct InFlightTurns {
    running: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct TurnGuard(InFlightTurns);

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl InFlightTurns {
    fn enter(&self) -> TurnGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        TurnGuard(self.clone())
    }

    pub fn count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Waits for running turns to finish; false if the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let idle = self.idle.notified();
                if self.count() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub runtime: Arc<AgentRuntime>,
    pub delayed: DelayedReplies,
    pub in_flight: InFlightTurns,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/webhook", post(receive)).with_state(state)
}

/// Acknowledges Twilio at once and runs the turn in the background. The
/// response body is only non-empty when a reply was held back earlier or the
/// message cannot be handled at all.
pub async fn receive(
    State(state): State<WebhookState>,
    Form(form): Form<WebhookForm>,
) -> (StatusCode, String) {
    let message = match InboundMessage::from_form(form) {
        Ok(message) => message,
        Err(error) => {
            warn!(event_name = "ingress.webhook.rejected", error = %error, "webhook rejected");
            return (StatusCode::BAD_REQUEST, String::new());
        }
    };

    let text = match message.turn_input() {
        TurnInput::UntranscribableAudio => {
            info!(
                event_name = "ingress.webhook.audio_unsupported",
                user_id = %message.from,
                "voice note without text"
            );
            return (StatusCode::OK, AUDIO_UNSUPPORTED_REPLY.to_owned());
        }
        TurnInput::Text(text) if text.is_empty() => return (StatusCode::OK, String::new()),
        TurnInput::Text(text) => text,
    };

    let held = state.delayed.take(message.from.as_str());
    if held.is_some() {
        info!(
            event_name = "ingress.webhook.delayed_reply_returned",
            user_id = %message.from,
            "returning reply held after the daily limit"
        );
    }

    let guard = state.in_flight.enter();
    let runtime = Arc::clone(&state.runtime);
    tokio::spawn(async move {
        let _guard = guard;
        runtime.handle_turn(&message.from, &text).await;
    });

    (StatusCode::OK, held.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use concierge_twilio::{DelayedReplies, AUDIO_UNSUPPORTED_REPLY};

    use super::{router, InFlightTurns, WebhookState};
    use crate::testing::{offline_runtime, RecordingTransport};

    const SENDER: &str = "whatsapp:+971500000001";

    fn form_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn post(state: WebhookState, body: &str) -> (StatusCode, String) {
        let response = router(state).oneshot(form_request(body)).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn state(transport: Arc<RecordingTransport>, delayed: DelayedReplies) -> WebhookState {
        WebhookState {
            runtime: Arc::new(offline_runtime(transport)),
            delayed,
            in_flight: InFlightTurns::default(),
        }
    }

    #[tokio::test]
    async fn text_message_is_acknowledged_and_answered_in_the_background() {
        let transport = Arc::new(RecordingTransport::default());
        let state = state(transport.clone(), DelayedReplies::default());
        let in_flight = state.in_flight.clone();

        let (status, body) =
            post(state, "From=whatsapp%3A%2B971500000001&Body=What+time+is+it%3F").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
        assert!(in_flight.drain(Duration::from_secs(5)).await);
        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, SENDER);
        assert!(replies[0].1.starts_with("Current time: "));
    }

    #[tokio::test]
    async fn held_reply_is_returned_inline_once() {
        let delayed = DelayedReplies::default();
        delayed.store(SENDER, "Your draft is ready.");
        let transport = Arc::new(RecordingTransport::default());
        let state = state(transport, delayed.clone());

        let (_, first) = post(state.clone(), "From=whatsapp%3A%2B971500000001&Body=hi").await;
        let (_, second) = post(state.clone(), "From=whatsapp%3A%2B971500000001&Body=hi").await;

        assert_eq!(first, "Your draft is ready.");
        assert_eq!(second, "");
        assert!(delayed.is_empty());
        assert!(state.in_flight.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn voice_note_gets_the_typing_request_without_a_turn() {
        let transport = Arc::new(RecordingTransport::default());
        let state = state(transport.clone(), DelayedReplies::default());
        let in_flight = state.in_flight.clone();

        let (status, body) = post(
            state,
            "From=whatsapp%3A%2B971500000001&Body=&NumMedia=1&MediaContentType0=audio%2Fogg",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, AUDIO_UNSUPPORTED_REPLY);
        assert_eq!(in_flight.count(), 0);
        assert!(transport.replies().is_empty());
    }

    #[tokio::test]
    async fn missing_sender_is_a_bad_request() {
        let transport = Arc::new(RecordingTransport::default());

        let (status, _) = post(state(transport, DelayedReplies::default()), "Body=hello").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
