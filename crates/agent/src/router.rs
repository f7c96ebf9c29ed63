//! Cheap intent classification.
//!
//! Date/time questions and greetings are answered on the spot. Everything
//! else is scored against per-category keyword tables; the result is routed
//! to a category only when the score clears the confidence threshold and is
//! not tied between two high-cost categories.

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use concierge_core::domain::intent::{Classification, IntentCategory};
use concierge_core::schedule::local_now;

const DATE_TIME_PHRASES: &[&str] = &[
    "what is the date",
    "what s the date",
    "what date is it",
    "what is today s date",
    "what s today s date",
    "date today",
    "what time is it",
    "what s the time",
    "current time",
    "time now",
];

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hi there",
    "hello there",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks",
    "thank you",
];

const HEDGES: &[&str] = &["maybe", "not sure", "might", "perhaps", "possibly"];
const HEDGE_PENALTY: u8 = 40;

pub const GREETING_REPLY: &str = "Hi! I can draft emails, look up and update contacts, check \
     your calendar, find places and search the web. What do you need?";

const EMAIL_KEYWORDS: &[(&str, i16)] = &[
    ("email", 70),
    ("emails", 70),
    ("e mail", 70),
    ("mail", 40),
    ("draft", 30),
    ("write to", 40),
    ("reply to", 30),
    ("s email", -40),
    ("email address", -40),
];

const CONTACT_KEYWORDS: &[(&str, i16)] = &[
    ("contact", 60),
    ("contacts", 60),
    ("s email", 60),
    ("email address", 60),
    ("phone", 50),
    ("phone number", 20),
    ("number", 20),
    ("update", 35),
    ("change", 30),
    ("delete", 35),
    ("remove", 30),
    ("add", 20),
    ("save", 20),
];

const CALENDAR_KEYWORDS: &[(&str, i16)] = &[
    ("calendar", 70),
    ("meeting", 50),
    ("meetings", 50),
    ("schedule", 50),
    ("appointment", 60),
    ("event", 40),
    ("events", 40),
    ("upcoming", 30),
    ("this week", 20),
    ("tomorrow", 15),
    ("remind", 30),
];

const PLACE_KEYWORDS: &[(&str, i16)] = &[
    ("restaurant", 60),
    ("restaurants", 60),
    ("cafe", 60),
    ("cafes", 60),
    ("coffee", 40),
    ("hotel", 50),
    ("hotels", 50),
    ("gym", 50),
    ("near", 40),
    ("nearby", 50),
    ("near me", 20),
    ("places", 40),
    ("spots", 40),
    ("where can i", 30),
    ("find", 20),
];

const WEB_KEYWORDS: &[(&str, i16)] = &[
    ("search", 40),
    ("google", 60),
    ("look up", 40),
    ("who is", 50),
    ("what is", 30),
    ("news", 50),
    ("latest", 30),
    ("weather", 50),
];

/// Pattern-based router; makes no external calls.
#[derive(Clone, Debug)]
pub struct IntentRouter {
    confidence_threshold: u8,
    offset: FixedOffset,
}

impl IntentRouter {
    pub fn new(confidence_threshold: u8, offset: FixedOffset) -> Self {
        Self { confidence_threshold, offset }
    }

    pub fn confidence_threshold(&self) -> u8 {
        self.confidence_threshold
    }

    pub fn classify(&self, message: &str) -> Classification {
        self.classify_at(message, local_now(self.offset))
    }

    pub fn classify_at(&self, message: &str, now: DateTime<FixedOffset>) -> Classification {
        let normalized = normalize_text(message);
        if let Some(reply) = fast_reply(&normalized, now) {
            return Classification::FastReply(reply);
        }

        let mut scores = IntentCategory::ROUTABLE
            .iter()
            .map(|category| (*category, keyword_score(&normalized, keywords_for(*category))))
            .collect::<Vec<_>>();
        scores.sort_by(|left, right| right.1.cmp(&left.1));

        let (best, best_score) = scores[0];
        let (runner_up, runner_up_score) = scores[1];
        let hedged = HEDGES.iter().any(|hedge| contains_phrase(&normalized, hedge));
        let confidence =
            if hedged { best_score.saturating_sub(HEDGE_PENALTY) } else { best_score };

        let tied_high_cost = best_score > 0
            && best_score == runner_up_score
            && best.is_high_cost()
            && runner_up.is_high_cost();

        let category = if tied_high_cost || confidence < self.confidence_threshold {
            IntentCategory::General
        } else {
            best
        };

        debug!(
            event_name = "router.scored",
            best = best.as_str(),
            best_score,
            runner_up = runner_up.as_str(),
            runner_up_score,
            hedged,
            tied_high_cost,
            "intent scored"
        );
        Classification::Routed { category, confidence }
    }
}

fn keywords_for(category: IntentCategory) -> &'static [(&'static str, i16)] {
    match category {
        IntentCategory::Email => EMAIL_KEYWORDS,
        IntentCategory::Contact => CONTACT_KEYWORDS,
        IntentCategory::Calendar => CALENDAR_KEYWORDS,
        IntentCategory::PlaceSearch => PLACE_KEYWORDS,
        IntentCategory::WebSearch => WEB_KEYWORDS,
        IntentCategory::General => &[],
    }
}

fn fast_reply(normalized: &str, now: DateTime<FixedOffset>) -> Option<String> {
    if DATE_TIME_PHRASES.iter().any(|phrase| contains_phrase(normalized, phrase)) {
        let time = now.format("%I:%M %p");
        let date = now.format("%A, %B %d, %Y");
        let offset = now.format("%:z");
        return Some(if contains_phrase(normalized, "time") {
            format!("Current time: {time} (UTC{offset})\nDate: {date}")
        } else {
            format!("Today's date: {date}\nCurrent time: {time} (UTC{offset})")
        });
    }

    let bare = normalized.trim();
    if GREETINGS.contains(&bare) {
        return Some(GREETING_REPLY.to_owned());
    }
    None
}

fn keyword_score(normalized: &str, keywords: &[(&str, i16)]) -> u8 {
    let total: i16 = keywords
        .iter()
        .filter(|(keyword, _)| contains_phrase(normalized, keyword))
        .map(|(_, weight)| *weight)
        .sum();
    total.clamp(0, 100) as u8
}

/// Lowercase words separated by single spaces; punctuation and apostrophes
/// become word breaks so "John's" reads as "john s".
fn normalize_text(text: &str) -> String {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() {
            sanitized.extend(character.to_lowercase());
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let padded = format!(" {normalized} ");
    padded.contains(&format!(" {phrase} "))
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use concierge_core::domain::intent::{Classification, IntentCategory};

    use super::{IntentRouter, GREETING_REPLY};

    fn router() -> IntentRouter {
        IntentRouter::new(60, FixedOffset::east_opt(4 * 3600).expect("offset"))
    }

    fn routed(message: &str) -> (IntentCategory, u8) {
        let now = FixedOffset::east_opt(4 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, 10, 16, 15, 5, 0)
            .single()
            .expect("time");
        match router().classify_at(message, now) {
            Classification::Routed { category, confidence } => (category, confidence),
            Classification::FastReply(reply) => panic!("unexpected fast reply: {reply}"),
        }
    }

    #[test]
    fn time_question_is_answered_locally() {
        let now = FixedOffset::east_opt(4 * 3600)
            .expect("offset")
            .with_ymd_and_hms(2026, 10, 16, 15, 5, 0)
            .single()
            .expect("time");

        let classification = router().classify_at("What time is it?", now);
        let Classification::FastReply(reply) = classification else {
            panic!("expected fast reply");
        };
        assert!(reply.starts_with("Current time: 03:05 PM (UTC+04:00)"));
        assert!(reply.contains("Friday, October 16, 2026"));

        let Classification::FastReply(date_reply) = router().classify_at("what's the date", now)
        else {
            panic!("expected fast reply");
        };
        assert!(date_reply.starts_with("Today's date: Friday, October 16, 2026"));
    }

    #[test]
    fn greeting_gets_capability_summary() {
        assert_eq!(
            router().classify("Hello!"),
            Classification::FastReply(GREETING_REPLY.to_owned())
        );
        assert!(matches!(router().classify("hello, email John"), Classification::Routed { .. }));
    }

    #[test]
    fn clear_requests_route_to_their_category() {
        assert_eq!(routed("Email John about the quarterly report").0, IntentCategory::Email);
        assert_eq!(routed("Update John's email to john@new.com").0, IntentCategory::Contact);
        assert_eq!(routed("What's on my calendar this week?").0, IntentCategory::Calendar);
        assert_eq!(routed("Find sushi restaurants near Dubai Marina").0, IntentCategory::PlaceSearch);
        assert_eq!(routed("Google the latest news on F1").0, IntentCategory::WebSearch);
    }

    #[test]
    fn hedged_request_falls_back_to_general() {
        let (category, confidence) = routed("maybe email John");
        assert_eq!(category, IntentCategory::General);
        assert!(confidence < 60);

        let (category, _) = routed("not sure if I should email John");
        assert_eq!(category, IntentCategory::General);
    }

    #[test]
    fn tie_between_high_cost_categories_goes_general() {
        let (category, confidence) = routed("calendar email");
        assert_eq!(category, IntentCategory::General);
        assert_eq!(confidence, 70);
    }

    #[test]
    fn unmatched_text_is_general_with_zero_confidence() {
        assert_eq!(routed("tell me a joke"), (IntentCategory::General, 0));
    }
}
