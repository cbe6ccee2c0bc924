//! Page metadata derived from published markup.
//!
//! Written next to the pages as a JSON document so templates and crawlers can pick
//! up a title, a short description and the dominant keywords of the latest update.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

const DESCRIPTION_CHARS: usize = 160;
const KEYWORD_COUNT: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub title: String,
    pub description: String,
    /// Comma-separated, most frequent first.
    pub keywords: String,
}

fn tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-z]{4,}\b").expect("static regex"))
}

/// Markup with every tag replaced by a space and whitespace collapsed.
pub fn visible_text(markup: &str) -> String {
    let untagged = tag().replace_all(markup, " ");
    whitespace().replace_all(&untagged, " ").trim().to_string()
}

pub fn derive(markup: &str, site_name: &str) -> PageMeta {
    let text = visible_text(markup);

    let description = if text.is_empty() {
        format!("Autonomous site {}", site_name)
    } else {
        text.chars().take(DESCRIPTION_CHARS).collect()
    };

    PageMeta {
        title: format!("{} - An Autonomous AI Site", site_name),
        description,
        keywords: keywords(&text).join(","),
    }
}

/// Words of four or more letters by descending frequency; ties keep first appearance.
fn keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut counts: Vec<(&str, usize)> = Vec::new();
    let mut slot: HashMap<&str, usize> = HashMap::new();

    for m in word().find_iter(&lower) {
        let w = m.as_str();
        match slot.get(w) {
            Some(&i) => counts[i].1 += 1,
            None => {
                slot.insert(w, counts.len());
                counts.push((w, 1));
            }
        }
    }

    // Stable sort keeps first-appearance order among equal counts.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(KEYWORD_COUNT)
        .map(|(w, _)| w.to_string())
        .collect()
}
