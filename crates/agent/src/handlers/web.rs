use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::errors::TurnError;
use concierge_core::ports::{SearchHit, SearchService};

use super::{ActionHandler, HandlerOutcome, TurnContext};
use crate::llm::{sanitize_for_prompt, search_summary_prompt, LlmGateway};

const QUERY_PREFIXES: &[&str] =
    &["search the web for", "search for", "google", "look up", "find out", "search"];
const FALLBACK_HITS: usize = 3;

/// Drops leading command words so the search engine sees the question.
pub fn search_query(message: &str) -> String {
    let cleaned = sanitize_for_prompt(message);
    let lowered = cleaned.to_lowercase();
    for prefix in QUERY_PREFIXES {
        let at_word_boundary = lowered
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(' '));
        if let Some(rest) = cleaned.get(prefix.len()..).filter(|_| at_word_boundary) {
            return rest.trim().to_owned();
        }
    }
    cleaned
}

fn sources(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .filter_map(|(index, hit)| hit.url.as_ref().map(|url| format!("[{}] {url}", index + 1)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn list_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .take(FALLBACK_HITS)
        .map(|hit| match &hit.url {
            Some(url) => format!("- {}: {}\n  {url}", hit.title, hit.snippet),
            None => format!("- {}: {}", hit.title, hit.snippet),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Answers questions from web results. The search itself is mandatory; the
/// summary is best effort.
pub struct WebSearchHandler {
    llm: LlmGateway,
    web: Arc<dyn SearchService>,
    limit: usize,
}

impl WebSearchHandler {
    pub fn new(llm: LlmGateway, web: Arc<dyn SearchService>, limit: usize) -> Self {
        Self { llm, web, limit }
    }
}

#[async_trait]
impl ActionHandler for WebSearchHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::WebSearch
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let query = search_query(&turn.message);
        let budgets = *self.llm.supervisor().budgets();
        let hits = self
            .llm
            .supervisor()
            .run_within(
                "web.search",
                turn.deadline,
                budgets.search,
                self.web.query(&query, self.limit),
            )
            .await
            .into_required("web.search", budgets.search)?;
        if hits.is_empty() {
            return Ok(HandlerOutcome::reply(format!("I couldn't find anything for \"{query}\".")));
        }

        let summary = self
            .llm
            .complete(
                "llm.summarize",
                &search_summary_prompt(&query, &hits),
                self.llm.reply_limits(),
                turn.deadline,
                budgets.extraction,
            )
            .await
            .ok()
            .map(|summary| summary.trim().to_owned())
            .filter(|summary| !summary.is_empty());

        let reply = match summary {
            Some(summary) => {
                let cited = sources(&hits);
                if cited.is_empty() { summary } else { format!("{summary}\n\nSources:\n{cited}") }
            }
            None => {
                warn!(
                    event_name = "web.summary_degraded",
                    correlation_id = %turn.correlation_id,
                    "summary unavailable; listing top results"
                );
                format!("Here are the top results for \"{query}\":\n{}", list_hits(&hits))
            }
        };
        Ok(HandlerOutcome::reply(reply))
    }
}
