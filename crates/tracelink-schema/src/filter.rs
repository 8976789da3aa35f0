//! Compiled message-pattern sets for include/exclude filtering.

use regex::Regex;
use tracing::warn;

/// A list of compiled filter patterns.
///
/// Patterns that fail to compile are dropped with a warning and never
/// match, so a bad pattern can only widen delivery, never block it.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(error) => {
                    warn!(pattern = %p, %error, "Ignoring invalid filter pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }
}
