use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical table in the external record store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(pub String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn contacts() -> Self {
        Self("contacts".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a tabular store, keyed by a unique name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn key_matches(&self, name: &str) -> bool {
        self.key.trim().eq_ignore_ascii_case(name.trim())
    }

    /// Every whitespace-separated part of `name` occurs somewhere in the key.
    pub fn key_contains_all_parts(&self, name: &str) -> bool {
        let key = self.key.to_lowercase();
        let mut parts = name.split_whitespace().peekable();
        if parts.peek().is_none() {
            return false;
        }
        parts.all(|part| key.contains(&part.to_lowercase()))
    }
}

/// Exact (case-insensitive) key match first, then the first record whose key
/// contains every part of `name`.
pub fn find_by_name<'a>(records: &'a [Record], name: &str) -> Option<&'a Record> {
    records
        .iter()
        .find(|record| record.key_matches(name))
        .or_else(|| records.iter().find(|record| record.key_contains_all_parts(name)))
}
