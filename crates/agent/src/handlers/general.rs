use async_trait::async_trait;

use concierge_core::domain::intent::IntentCategory;
use concierge_core::errors::TurnError;

use super::{ActionHandler, HandlerOutcome, TurnContext};
use crate::llm::{general_prompt, LlmGateway};

/// Free-form answer for anything no specialised handler claims.
pub struct GeneralHandler {
    llm: LlmGateway,
}

impl GeneralHandler {
    pub fn new(llm: LlmGateway) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ActionHandler for GeneralHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::General
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let budget = self.llm.supervisor().budgets().extraction;
        let reply = self
            .llm
            .complete(
                "llm.general",
                &general_prompt(&turn.message, &turn.memory),
                self.llm.reply_limits(),
                turn.deadline,
                budget,
            )
            .await
            .into_required("llm.general", budget)?;
        Ok(HandlerOutcome::reply(reply.trim()))
    }
}
