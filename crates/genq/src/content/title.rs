//! Title derivation for generated text.
//!
//! First heading (Markdown or HTML), else the first sentence when it has a
//! sensible length, else the topic in title case.

use std::sync::LazyLock;

use regex::Regex;

const MIN_SENTENCE_CHARS: usize = 10;
const MAX_SENTENCE_CHARS: usize = 120;

static RE_MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t#]*$").unwrap());
static RE_HTML_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[1-6][^>]*>(.*?)</h[1-6]\s*>").unwrap());
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?](\s|$)").unwrap());

/// Derives a title for `text`, falling back to `topic`.
pub fn derive_title(text: &str, topic: &str) -> String {
    first_heading(text)
        .or_else(|| first_sentence(text))
        .unwrap_or_else(|| humanize(topic))
}

fn first_heading(text: &str) -> Option<String> {
    let markdown = RE_MARKDOWN_HEADING
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| (m.start(), clean(m.as_str())))
        .find(|(_, t)| !t.is_empty());
    let html = RE_HTML_HEADING
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| (m.start(), clean(m.as_str())))
        .find(|(_, t)| !t.is_empty());

    match (markdown, html) {
        (Some(md), Some(h)) => Some(if md.0 <= h.0 { md.1 } else { h.1 }),
        (Some(md), None) => Some(md.1),
        (None, Some(h)) => Some(h.1),
        (None, None) => None,
    }
}

fn first_sentence(text: &str) -> Option<String> {
    let plain = clean(text);
    let end = RE_SENTENCE_END
        .find(&plain)
        .map(|m| m.start() + 1)
        .unwrap_or(plain.len());
    let sentence = plain[..end].trim();
    let chars = sentence.chars().count();
    (MIN_SENTENCE_CHARS..=MAX_SENTENCE_CHARS)
        .contains(&chars)
        .then(|| sentence.to_string())
}

/// Strips tags and collapses whitespace.
fn clean(fragment: &str) -> String {
    RE_TAG
        .replace_all(fragment, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `"rust-async_basics"` → `"Rust Async Basics"`.
pub fn humanize(topic: &str) -> String {
    topic
        .split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_heading() {
        let text = "Intro line without end\n\n## Getting Started With Tokio ##\n\nBody.";
        assert_eq!(derive_title(text, "tokio"), "Getting Started With Tokio");
    }

    #[test]
    fn test_html_heading_strips_inner_tags() {
        let text = "<p>lead</p><h2 class=\"t\">Ownership <em>in</em> Rust</h2><p>...</p>";
        assert_eq!(derive_title(text, "ownership"), "Ownership in Rust");
    }

    #[test]
    fn test_earliest_heading_wins() {
        let text = "<h1>First</h1>\n# Second";
        assert_eq!(derive_title(text, "x"), "First");
    }

    #[test]
    fn test_first_sentence_within_bounds() {
        let text = "Borrowing lets you use data without owning it. More text follows here.";
        assert_eq!(
            derive_title(text, "borrowing"),
            "Borrowing lets you use data without owning it."
        );
    }

    #[test]
    fn test_short_sentence_falls_back_to_topic() {
        assert_eq!(derive_title("Hi. Then more.", "async-rust_tips"), "Async Rust Tips");
    }

    #[test]
    fn test_long_sentence_falls_back_to_topic() {
        let text = "word ".repeat(40);
        assert_eq!(derive_title(&text, "long form"), "Long Form");
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("  error_handling-in  rust "), "Error Handling In Rust");
        assert_eq!(humanize(""), "");
    }
}
