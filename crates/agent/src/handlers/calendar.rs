use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};

use concierge_core::domain::intent::IntentCategory;
use concierge_core::errors::TurnError;
use concierge_core::ports::{CalendarEvent, CalendarService};
use concierge_core::schedule::UpcomingWindowPolicy;

use super::{ActionHandler, HandlerOutcome, TurnContext};
use crate::deferred::WriteSignals;
use crate::llm::{present, Extraction, LlmGateway};

const MAX_LISTED_EVENTS: usize = 10;

fn local_label(instant: &DateTime<FixedOffset>, offset: FixedOffset) -> String {
    instant.with_timezone(&offset).format("%a %d %b %H:%M").to_string()
}

fn parse_instant(value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    value.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
}

/// Lists upcoming events and books new ones.
pub struct CalendarHandler {
    llm: LlmGateway,
    calendar: Arc<dyn CalendarService>,
    upcoming: Arc<dyn UpcomingWindowPolicy>,
}

impl CalendarHandler {
    pub fn new(
        llm: LlmGateway,
        calendar: Arc<dyn CalendarService>,
        upcoming: Arc<dyn UpcomingWindowPolicy>,
    ) -> Self {
        Self { llm, calendar, upcoming }
    }

    async fn list(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let window = self.upcoming.window(turn.now);
        let budget = self.llm.supervisor().budgets().external_write;
        let events = self
            .llm
            .supervisor()
            .run_within(
                "calendar.list",
                turn.deadline,
                budget,
                self.calendar.list_events(&window, MAX_LISTED_EVENTS),
            )
            .await
            .into_required("calendar.list", budget)?;

        let offset = turn.now.timezone();
        if events.is_empty() {
            return Ok(HandlerOutcome::reply(format!(
                "Nothing on your calendar until {}.",
                local_label(&window.end, offset)
            )));
        }
        let lines = events
            .iter()
            .map(|event| format!("- {}: {}", local_label(&event.start, offset), event.summary))
            .collect::<Vec<_>>();
        Ok(HandlerOutcome::reply(format!("Your upcoming events:\n{}", lines.join("\n"))))
    }

    async fn create(
        &self,
        turn: &TurnContext,
        extraction: &Extraction,
    ) -> Result<HandlerOutcome, TurnError> {
        let Some(summary) = present(&extraction.calendar_summary) else {
            return Ok(HandlerOutcome::reply("What should I call the event?"));
        };
        let Some(start) = parse_instant(present(&extraction.calendar_start)) else {
            return Ok(HandlerOutcome::reply(format!("When should \"{summary}\" start?")));
        };
        let end = parse_instant(present(&extraction.calendar_end))
            .unwrap_or_else(|| start + Duration::hours(1));
        if end <= start {
            return Ok(HandlerOutcome::reply("The event has to end after it starts."));
        }

        let event = CalendarEvent {
            summary: summary.to_owned(),
            start,
            end,
            description: present(&extraction.calendar_description).map(str::to_owned),
            link: None,
        };
        let budget = self.llm.supervisor().budgets().external_write;
        let created = self
            .llm
            .supervisor()
            .run_within("calendar.create", turn.deadline, budget, self.calendar.create_event(&event))
            .await
            .into_required("calendar.create", budget)?;

        let when = local_label(&created.start, turn.now.timezone());
        let mut reply = format!("Added \"{}\" on {when}.", created.summary);
        if let Some(link) = &created.link {
            reply.push_str(&format!("\n{link}"));
        }
        Ok(HandlerOutcome::reply(reply).with_signals(WriteSignals {
            task_description: Some(format!("{} ({when})", created.summary)),
            ..WriteSignals::default()
        }))
    }
}

#[async_trait]
impl ActionHandler for CalendarHandler {
    fn category(&self) -> IntentCategory {
        IntentCategory::Calendar
    }

    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError> {
        let extraction = self
            .llm
            .extract(IntentCategory::Calendar, &turn.message, &turn.memory, turn.now, turn.deadline)
            .await?;
        match present(&extraction.calendar_action).map(str::to_lowercase).as_deref() {
            Some("create" | "add" | "schedule" | "book") => self.create(turn, &extraction).await,
            _ => self.list(turn).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use concierge_core::ports::CalendarEvent;
    use concierge_core::schedule::{RemainderOfWeek, RollingDays};

    use super::CalendarHandler;
    use crate::handlers::ActionHandler;
    use crate::testing::{gateway, gulf_offset, turn, wednesday_morning, ScriptedCalendar, ScriptedCompletion};

    fn event(summary: &str, day: u32, hour: u32) -> CalendarEvent {
        let start = gulf_offset().with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap();
        CalendarEvent {
            summary: summary.to_owned(),
            start,
            end: start + Duration::hours(1),
            description: None,
            link: None,
        }
    }

    #[tokio::test]
    async fn listing_uses_the_configured_upcoming_window() {
        let calendar = Arc::new(ScriptedCalendar::with_events(vec![
            event("Team sync", 13, 10),
            event("Dentist", 17, 9),
        ]));
        let handler = CalendarHandler::new(
            gateway(ScriptedCompletion::new([r#"{"calendar_action": "list"}"#])),
            calendar.clone(),
            Arc::new(RemainderOfWeek::default()),
        );

        let outcome = handler.handle(&turn("what's on my calendar?")).await.unwrap();

        assert_eq!(outcome.reply, "Your upcoming events:\n- Thu 13 Mar 10:00: Team sync");
        let window = &calendar.windows()[0];
        assert_eq!(window.start, wednesday_morning());
        assert_eq!(window.end, gulf_offset().with_ymd_and_hms(2025, 3, 17, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn empty_window_says_so() {
        let handler = CalendarHandler::new(
            gateway(ScriptedCompletion::new([r#"{"calendar_action": "list"}"#])),
            Arc::new(ScriptedCalendar::default()),
            Arc::new(RollingDays { days: 7 }),
        );

        let outcome = handler.handle(&turn("anything this week?")).await.unwrap();

        assert_eq!(outcome.reply, "Nothing on your calendar until Wed 19 Mar 09:30.");
    }

    #[tokio::test]
    async fn create_defaults_to_one_hour_and_records_a_task() {
        let calendar = Arc::new(ScriptedCalendar::default());
        let handler = CalendarHandler::new(
            gateway(ScriptedCompletion::new([
                r#"{"calendar_action": "create", "calendar_summary": "Lunch with Amira",
                    "calendar_start": "2025-03-14T13:00:00+04:00"}"#,
            ])),
            calendar.clone(),
            Arc::new(RollingDays::default()),
        );

        let outcome = handler.handle(&turn("book lunch with Amira Friday 1pm")).await.unwrap();

        assert!(outcome.reply.starts_with("Added \"Lunch with Amira\" on Fri 14 Mar 13:00."));
        let created = &calendar.created()[0];
        assert_eq!(created.end - created.start, Duration::hours(1));
        assert_eq!(outcome.signals.task_description.as_deref(), Some("Lunch with Amira (Fri 14 Mar 13:00)"));
    }

    #[tokio::test]
    async fn create_without_a_start_asks_for_one() {
        let calendar = Arc::new(ScriptedCalendar::default());
        let handler = CalendarHandler::new(
            gateway(ScriptedCompletion::new([
                r#"{"calendar_action": "create", "calendar_summary": "Gym"}"#,
            ])),
            calendar.clone(),
            Arc::new(RollingDays::default()),
        );

        let outcome = handler.handle(&turn("add gym to my calendar")).await.unwrap();

        assert_eq!(outcome.reply, "When should \"Gym\" start?");
        assert!(calendar.created().is_empty());
    }
}
