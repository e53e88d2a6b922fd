//! Strings that are either plain or keyed by language tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Language tags tried when the requested language is missing.
const FALLBACK_LANGUAGES: [&str; 2] = ["en-US", "en"];

/// A display string as found in discovery and server documents.
///
/// ```json
/// "Example University"
/// {"en-US": "Example University", "nl-NL": "Voorbeeld Universiteit"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedString {
    Plain(String),
    Translated(BTreeMap<String, String>),
}

impl LocalizedString {
    /// Pick the best translation for `lang`.
    ///
    /// Tries the exact tag, then any tag sharing the primary language
    /// (`nl` matches `nl-NL` and the reverse), then `en-US`, `en`, and
    /// finally the first entry.
    pub fn resolve(&self, lang: &str) -> &str {
        let map = match self {
            LocalizedString::Plain(s) => return s,
            LocalizedString::Translated(map) => map,
        };

        if let Some(s) = map.get(lang) {
            return s;
        }
        let primary = primary_language(lang);
        if let Some((_, s)) = map
            .iter()
            .find(|(tag, _)| primary_language(tag).eq_ignore_ascii_case(primary))
        {
            return s;
        }
        FALLBACK_LANGUAGES
            .iter()
            .find_map(|tag| map.get(*tag))
            .or_else(|| map.values().next())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// All translations.
    pub fn values(&self) -> Vec<&str> {
        match self {
            LocalizedString::Plain(s) => vec![s.as_str()],
            LocalizedString::Translated(map) => map.values().map(String::as_str).collect(),
        }
    }

    /// Case-insensitive substring match over every translation.
    ///
    /// `needle` must already be lowercase.
    pub fn contains_lowercase(&self, needle: &str) -> bool {
        self.values()
            .iter()
            .any(|v| v.to_lowercase().contains(needle))
    }
}

impl From<&str> for LocalizedString {
    fn from(s: &str) -> Self {
        LocalizedString::Plain(s.to_string())
    }
}

impl From<String> for LocalizedString {
    fn from(s: String) -> Self {
        LocalizedString::Plain(s)
    }
}

fn primary_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translated(pairs: &[(&str, &str)]) -> LocalizedString {
        LocalizedString::Translated(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_plain_ignores_language() {
        let s = LocalizedString::from("Example");
        assert_eq!(s.resolve("nl"), "Example");
    }

    #[test]
    fn test_resolve_prefers_exact_then_primary() {
        let s = translated(&[("en-US", "University"), ("nl-NL", "Universiteit")]);
        assert_eq!(s.resolve("nl-NL"), "Universiteit");
        assert_eq!(s.resolve("nl"), "Universiteit");
        assert_eq!(s.resolve("de"), "University");
    }

    #[test]
    fn test_resolve_falls_back_to_first() {
        let s = translated(&[("fr", "Université"), ("de", "Universität")]);
        assert_eq!(s.resolve("nl"), "Universität");
    }

    #[test]
    fn test_deserialize_both_shapes() {
        let plain: LocalizedString = serde_json::from_str(r#""Plain""#).unwrap();
        assert_eq!(plain, LocalizedString::from("Plain"));

        let map: LocalizedString = serde_json::from_str(r#"{"en": "One", "nl": "Een"}"#).unwrap();
        assert_eq!(map.resolve("nl"), "Een");
    }

    #[test]
    fn test_contains_lowercase_checks_all_translations() {
        let s = translated(&[("en", "Amsterdam University"), ("nl", "Universiteit van Amsterdam")]);
        assert!(s.contains_lowercase("universiteit"));
        assert!(!s.contains_lowercase("rotterdam"));
    }
}
