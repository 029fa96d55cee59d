//! Free-text probability extraction.
//!
//! Epistemic foundation:
//! - K_i: A valid probability lies in [0, 100]; anything else is discarded
//! - B_i: Sources use inconsistent output conventions → ordered fallback chain
//! - B_i: Later statements supersede earlier ones (calculation and phrasing rules take the last match)
//! - I^B: No rule matches → None (extraction failure, not an error)

mod rules;

pub use rules::*;

use tracing::debug;

/// One independent way of finding a probability in a reply.
pub trait ExtractionRule: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// A value in [0, 100], or `None` to defer to the next rule.
    fn try_extract(&self, text: &str, source_hint: &str) -> Option<f64>;
}

/// Ordered chain of extraction rules; the first rule yielding a value wins.
///
/// Patterns are compiled once at construction, so build one extractor and
/// share it (it is `Send + Sync`).
pub struct ProbabilityExtractor {
    rules: Vec<Box<dyn ExtractionRule>>,
}

impl Default for ProbabilityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbabilityExtractor {
    /// Extractor with the standard rule chain.
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(LabelledFieldRule::marker()),
            Box::new(LabelledFieldRule::extended_marker()),
            Box::new(CalculationRule::default()),
            Box::new(SourceFamilyRule::deepseek()),
            Box::new(SourceFamilyRule::qwen()),
            Box::new(KeywordSectionRule::default()),
            Box::new(GenericPhrasingRule::default()),
            Box::new(TailNumberRule::default()),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn ExtractionRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Probability in [0, 100] found in `text`, if any.
    pub fn extract(&self, text: &str, source_hint: &str) -> Option<f64> {
        self.extract_with_rule(text, source_hint).map(|(value, _)| value)
    }

    /// Like [`extract`](Self::extract), also naming the rule that matched.
    pub fn extract_with_rule(&self, text: &str, source_hint: &str) -> Option<(f64, &'static str)> {
        if text.trim().is_empty() {
            return None;
        }
        let found = self.rules.iter().find_map(|rule| {
            rule.try_extract(text, source_hint)
                .and_then(rules::in_bounds)
                .map(|value| (value, rule.name()))
        });
        match found {
            Some((value, rule)) => debug!(source = source_hint, rule, value, "Extracted probability"),
            None => debug!(source = source_hint, "No probability found"),
        }
        found
    }
}
