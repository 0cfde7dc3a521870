//! Static fallback hierarchy between providers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fallback lists per provider, with a baseline list for providers that
/// have no entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTable {
    entries: BTreeMap<String, Vec<String>>,
    baseline: Vec<String>,
}

fn list(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

impl Default for FallbackTable {
    fn default() -> Self {
        let entries = BTreeMap::from([
            (
                "openai".to_string(),
                list(&["anthropic", "gemini", "deepseek", "openrouter"]),
            ),
            (
                "anthropic".to_string(),
                list(&["openai", "gemini", "openrouter"]),
            ),
            (
                "gemini".to_string(),
                list(&["openai", "anthropic", "openrouter"]),
            ),
            (
                "deepseek".to_string(),
                list(&["openai", "anthropic", "gemini"]),
            ),
            (
                "openrouter".to_string(),
                list(&["openai", "anthropic", "gemini"]),
            ),
        ]);
        Self {
            entries,
            baseline: list(&["openai", "anthropic", "gemini"]),
        }
    }
}

impl FallbackTable {
    /// A table with no entries and the given baseline.
    pub fn empty(baseline: Vec<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            baseline,
        }
    }

    /// Replaces the fallback list of one provider.
    pub fn set(&mut self, provider: impl Into<String>, fallbacks: Vec<String>) -> &mut Self {
        self.entries.insert(provider.into(), fallbacks);
        self
    }

    /// The raw configured list for `provider`, or the baseline.
    pub fn fallbacks_for(&self, provider: &str) -> &[String] {
        self.entries
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or(&self.baseline)
    }

    /// Ordered alternates for `failed`, without `failed` itself and without
    /// duplicates.
    pub fn candidates(&self, failed: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for provider in self.fallbacks_for(failed) {
            if provider != failed && !out.contains(provider) {
                out.push(provider.clone());
            }
        }
        out
    }

    /// Every provider id the table mentions.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|(k, v)| std::iter::once(k).chain(v.iter()))
            .chain(self.baseline.iter())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hierarchy() {
        let table = FallbackTable::default();
        assert_eq!(
            table.candidates("openai"),
            vec!["anthropic", "gemini", "deepseek", "openrouter"]
        );
        assert_eq!(table.candidates("deepseek"), vec!["openai", "anthropic", "gemini"]);
    }

    #[test]
    fn test_unknown_provider_uses_baseline() {
        let table = FallbackTable::default();
        assert_eq!(table.candidates("mistral"), vec!["openai", "anthropic", "gemini"]);
    }

    #[test]
    fn test_baseline_excludes_failed_provider() {
        let table = FallbackTable::empty(list(&["openai", "anthropic", "gemini"]));
        assert_eq!(table.candidates("openai"), vec!["anthropic", "gemini"]);
    }

    #[test]
    fn test_override_dedups() {
        let mut table = FallbackTable::default();
        table.set("openai", list(&["gemini", "openai", "gemini", "deepseek"]));
        assert_eq!(table.candidates("openai"), vec!["gemini", "deepseek"]);
    }
}
