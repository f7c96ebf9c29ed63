use std::sync::Arc;

use async_trait::async_trait;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::errors::TurnError;
use concierge_core::ports::{SearchHit, SearchService};

use super::{ActionHandler, HandlerOutcome, TurnContext};
use crate::deferred::WriteSignals;
use crate::llm::{present, LlmGateway};
use crate::session::{PendingAction, SessionStore};

pub const ASK_FOR_AREA: &str = "Sure, what area should I search in?";

fn render_place(rank: usize, hit: &SearchHit) -> String {
    let mut line = format!("{rank}. {}", hit.title);
    if let Some(rating) = hit.rating {
        line.push_str(&format!(" ({rating:.1}/5)"));
    }
    if let Some(address) = hit.address.as_deref().filter(|address| !address.is_empty()) {
        line.push_str(&format!("\n   {address}"));
    }
    line
}

/// Finds places by name or kind in an area, asking for the area when the
/// message does not name one.
pub struct PlaceSearchHandler {
    llm: LlmGateway,
    places: Arc<dyn SearchService>,
    sessions: Arc<SessionStore>,
    limit: usize,
}

impl PlaceSearchHandler {
    pub fn new(
        llm: LlmGateway,
        places: Arc<dyn SearchService>,
        sessions: Arc<SessionStore>,
        limit: usize,
    ) -> Self {
        Self { llm, places, sessions, limit }
    }

    /// Runs the search once both the query and the area are known.
    pub async fn search(
        &self,
        turn: &TurnContext,
        query: &str,
        location: &str,
    ) -> Result<HandlerOutcome, TurnError> {
        let text = format!("{query} in {location}");
        let budget = self.llm.supervisor().budgets().search;
        let hits = self
            .llm
            .supervisor()
            .run_within(
                "places.search",
                turn.deadline,
                budget,
                self.places.query(&text, self.limit),
            )
            .await
            .into_required("places.search", budget)?;

        let signals =
            WriteSignals { place_location: Some(location.to_owned()), ..WriteSignals::default() };
        if hits.is_empty() {
            return Ok(HandlerOutcome::reply(format!("I couldn't find any {query} in {location}."))
                .with_signals(signals));
        }
        let lines = hits
            .iter()
            .enumerate()
            .map(|(index, hit)| render_place(index + 1, hit))
            .collect::<Vec<_>>();
        Ok(HandlerOutcome::reply(format!("Here's what I found for {text}:\n\n{}", lines.join("\n")))
            .with_signals(signals))
    }
}

#[async_trait]
impl ActionHandler for PlaceSearchHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::PlaceSearch
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let extraction = self
            .llm
            .extract(
                IntentCategory::PlaceSearch,
                &turn.message,
                &turn.memory,
                turn.now,
                turn.deadline,
            )
            .await?;
        let query = present(&extraction.place_query).unwrap_or(turn.message.trim()).to_owned();

        match present(&extraction.place_location) {
            Some(location) => self.search(turn, &query, location).await,
            None => {
                self.sessions.put(&turn.user_id, PendingAction::PlaceQuery { query });
                Ok(HandlerOutcome::reply(ASK_FOR_AREA))
            }
        }
    }
}
