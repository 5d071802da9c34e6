//! Console line clean-up and filtering.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static TIME_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[\d+:\d+(:\d+)?\]\s*").expect("static regex is valid"));
// [Server thread/INFO]: and friends
static TAG_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[.*?\]:\s*").expect("static regex is valid"));

/// Removes a leading `[hh:mm:ss]` stamp and then one `[tag]:` prefix.
pub fn strip_console_prefix(line: &str) -> &str {
    let line = match TIME_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    };
    match TAG_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// Console lines that are stored but kept out of the service log.
#[derive(Debug, Default, Clone)]
pub struct ConsoleFilter {
    sentences: HashSet<String>,
    patterns: Vec<Regex>,
}

impl ConsoleFilter {
    pub fn new(
        sentences: impl IntoIterator<Item = String>,
        patterns: impl IntoIterator<Item = Regex>,
    ) -> Self {
        Self {
            sentences: sentences.into_iter().collect(),
            patterns: patterns.into_iter().collect(),
        }
    }

    pub fn is_ignored(&self, line: &str) -> bool {
        self.sentences.contains(line) || self.patterns.iter().any(|p| p.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_time_and_tag() {
        assert_eq!(
            strip_console_prefix("[12:34:56] [Server thread/INFO]: Done (3.2s)! For help"),
            "Done (3.2s)! For help"
        );
        assert_eq!(strip_console_prefix("  [12:34] hello"), "hello");
        assert_eq!(strip_console_prefix("[Server thread/WARN]: careful"), "careful");
    }

    #[test]
    fn test_plain_line_untouched() {
        assert_eq!(strip_console_prefix("Loading libraries"), "Loading libraries");
    }

    #[test]
    fn test_filter_matches_sentences_and_patterns() {
        let filter = ConsoleFilter::new(
            ["Saving chunks".to_string()],
            [Regex::new(r"^\w+ lost connection").unwrap()],
        );
        assert!(filter.is_ignored("Saving chunks"));
        assert!(filter.is_ignored("steve lost connection: Disconnected"));
        assert!(!filter.is_ignored("Saving chunks for level"));
    }
}
