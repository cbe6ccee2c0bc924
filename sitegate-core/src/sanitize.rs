//! Markup Sanitization
//!
//! Externally sourced active elements are forbidden outright. Inline scripts are
//! tolerated on input and removed before anything is written.

use regex::Regex;
use std::sync::OnceLock;

fn external_script() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<script\b[^>]*\bsrc\s*=").expect("static regex"))
}

fn external_iframe() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<iframe\b[^>]*\bsrc(?:doc)?\s*=").expect("static regex"))
}

fn script_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("static regex"))
}

fn unclosed_script() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b.*\z").expect("static regex"))
}

/// Reason the markup must be rejected, if any.
pub fn find_forbidden(markup: &str) -> Option<&'static str> {
    if external_script().is_match(markup) {
        Some("external <script src=> is not allowed")
    } else if external_iframe().is_match(markup) {
        Some("<iframe src=> or <iframe srcdoc=> is not allowed")
    } else {
        None
    }
}

/// Remove every `<script>` block. An unclosed `<script` swallows the rest of the document.
///
/// Runs to a fixpoint so that removal cannot reassemble a new script tag.
pub fn strip_inline_scripts(markup: &str) -> String {
    let mut current = markup.to_string();
    loop {
        let next = script_block().replace_all(&current, "");
        let next = unclosed_script().replace(&next, "").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{locate, Region};

    #[test]
    fn test_external_script_forbidden() {
        assert!(find_forbidden(r#"<SCRIPT type="x" SRC="https://evil/x.js"></SCRIPT>"#).is_some());
        assert!(find_forbidden(r#"<iframe width=1 src='//x'></iframe>"#).is_some());
        assert!(find_forbidden("<script>let a = 1;</script>").is_none());
    }

    #[test]
    fn test_iframe_srcdoc_forbidden() {
        assert!(find_forbidden(r#"<iframe srcdoc="<script>alert(1)</script>"></iframe>"#).is_some());
        assert!(find_forbidden(r#"<IFRAME SRCDOC = '<p>x</p>'>"#).is_some());
        assert!(find_forbidden("<p>iframe srcdoc= in prose</p>").is_none());
    }

    #[test]
    fn test_inline_script_stripped() {
        let html = "<p>a</p><script>\nalert(1)\n</script><p>b</p>";
        assert_eq!(strip_inline_scripts(html), "<p>a</p><p>b</p>");
    }

    #[test]
    fn test_strip_is_idempotent() {
        let samples = [
            "<p>plain</p>",
            "<script>x</script><footer>f</footer>",
            "<scr<script></script>ipt>alert(1)</script>done",
            "<p>ok</p><script>never closed",
        ];
        for sample in samples {
            let once = strip_inline_scripts(sample);
            assert_eq!(strip_inline_scripts(&once), once, "sample {sample:?}");
            assert!(!once.to_lowercase().contains("<script"));
        }
    }

    #[test]
    fn test_unclosed_script_removes_tail() {
        assert_eq!(strip_inline_scripts("<p>ok</p><script>never"), "<p>ok</p>");
    }

    #[test]
    fn test_fragment_stripped_before_splice() {
        let region = Region::new("<!-- AI-START -->", "<!-- AI-END -->");
        let page = "<body><script>keep()</script><!-- AI-START -->old<!-- AI-END --></body>";
        let fragment = "<p>a</p><script>x()</script><p>b</p><script>tail";

        let stripped = strip_inline_scripts(fragment);
        let composed = locate(page, &region).unwrap().splice(&stripped);

        assert_eq!(
            composed,
            "<body><script>keep()</script><!-- AI-START --><p>a</p><p>b</p><!-- AI-END --></body>"
        );
        // Only the fragment is sanitized; the document around the region is left alone.
        assert_eq!(strip_inline_scripts(&stripped), stripped);
        assert!(locate(&composed, &region).is_ok());
    }
}
