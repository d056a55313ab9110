use serde_json::Value;

use crate::snapshot::RequestSnapshot;

/// Local, zero-latency suspicion gate deciding whether a request is worth escalating.
///
/// Tokens are stored lower-cased and matched with an ASCII case-insensitive window scan, so a
/// classification allocates nothing and costs O(payload length x token count).
#[derive(Debug, Clone)]
pub struct Prefilter {
    tokens: Vec<String>,
}

impl Prefilter {
    /// Builds a filter from the configured token set. Blank tokens are dropped.
    #[must_use]
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tokens.sort();
        tokens.dedup();
        Self { tokens }
    }

    /// Normalized token set.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// True when the request is suspect.
    #[must_use]
    pub fn classify(&self, snapshot: &RequestSnapshot) -> bool {
        self.first_match(snapshot).is_some()
    }

    /// First token found in the URL, the payload, any string value of the structured payload, or
    /// any decoded query parameter.
    #[must_use]
    pub fn first_match(&self, snapshot: &RequestSnapshot) -> Option<&str> {
        self.match_text(snapshot.url())
            .or_else(|| self.match_text(snapshot.payload()))
            .or_else(|| snapshot.structured().and_then(|v| self.match_value(v)))
            .or_else(|| snapshot.query().and_then(|v| self.match_value(v)))
    }

    fn match_value(&self, value: &Value) -> Option<&str> {
        match value {
            Value::String(text) => self.match_text(text),
            Value::Array(items) => items.iter().find_map(|item| self.match_value(item)),
            Value::Object(map) => map.values().find_map(|item| self.match_value(item)),
            Value::Null | Value::Bool(_) | Value::Number(_) => None,
        }
    }

    fn match_text(&self, text: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|token| contains_ignore_ascii_case(text, token))
            .map(String::as_str)
    }
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    let needle = needle.as_bytes();
    haystack.len() >= needle.len()
        && haystack
            .as_bytes()
            .windows(needle.len())
            .any(|window| window.eq_ignore_ascii_case(needle))
}
