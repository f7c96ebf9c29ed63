use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of downstream actions a message can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Email,
    Contact,
    Calendar,
    PlaceSearch,
    WebSearch,
    General,
}

impl IntentCategory {
    pub const ROUTABLE: [IntentCategory; 5] =
        [Self::Email, Self::Contact, Self::Calendar, Self::PlaceSearch, Self::WebSearch];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Contact => "contact",
            Self::Calendar => "calendar",
            Self::PlaceSearch => "place_search",
            Self::WebSearch => "web_search",
            Self::General => "general",
        }
    }

    /// Categories whose handlers pay for LLM extraction and external writes.
    pub fn is_high_cost(self) -> bool {
        matches!(self, Self::Email | Self::Contact | Self::Calendar)
    }

    /// Task type recorded for follow-up tracking, if the category produces one.
    pub fn task_type(self) -> &'static str {
        match self {
            Self::Email => "email_task",
            Self::Calendar => "calendar_task",
            Self::Contact => "contact_task",
            Self::PlaceSearch => "location_task",
            Self::WebSearch | Self::General => "general_task",
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "contact" => Ok(Self::Contact),
            "calendar" => Ok(Self::Calendar),
            "place_search" => Ok(Self::PlaceSearch),
            "web_search" => Ok(Self::WebSearch),
            "general" => Ok(Self::General),
            other => Err(format!("unknown intent category `{other}`")),
        }
    }
}

/// Router outcome. Both variants are terminal for the classification stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    FastReply(String),
    Routed { category: IntentCategory, confidence: u8 },
}

impl Classification {
    pub fn category(&self) -> Option<IntentCategory> {
        match self {
            Self::FastReply(_) => None,
            Self::Routed { category, .. } => Some(*category),
        }
    }
}
