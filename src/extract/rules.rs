//! Individual extraction rules, in chain order.

use super::ExtractionRule;
use regex::Regex;
use tracing::warn;

/// Tail window scanned by the last-resort rule, in bytes (rounded to a char boundary).
const TAIL_WINDOW: usize = 500;
/// Lines after a keyword line that may carry its value.
const KEYWORD_LOOKAHEAD: usize = 2;

/// Compile patterns, skipping (and logging) any that fail to compile.
fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, error = %e, "Skipping invalid extraction pattern");
                None
            }
        })
        .collect()
}

/// Accept only finite values in [0, 100].
pub(crate) fn in_bounds(value: f64) -> Option<f64> {
    (value.is_finite() && (0.0..=100.0).contains(&value)).then_some(value)
}

/// Parse a captured number, scaling a bare decimal fraction (0.42 → 42).
///
/// Values that carry a percent sign are never scaled.
fn parse_labelled(raw: &str, has_percent: bool) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if !has_percent && raw.contains('.') && value > 0.0 && value < 1.0 {
        return Some(value * 100.0);
    }
    Some(value)
}

/// Value of the last capture (group 1) across all matches that is in bounds.
fn last_valid(re: &Regex, text: &str) -> Option<(usize, f64)> {
    re.captures_iter(text)
        .filter_map(|caps| {
            let m = caps.get(1)?;
            let value = in_bounds(m.as_str().parse().ok()?)?;
            Some((m.end(), value))
        })
        .last()
}

// ═══════════════════════════════════════════════════════════════════════════
// Labelled final-answer fields
// ═══════════════════════════════════════════════════════════════════════════

/// A canonical marker token followed by a number, e.g. `**PROGNOSE:** 42%`.
pub struct LabelledFieldRule {
    name: &'static str,
    pattern: Option<Regex>,
}

impl LabelledFieldRule {
    fn for_marker(name: &'static str, marker: &str) -> Self {
        // The separator is required; emphasis markup (* or _) and whitespace may surround it.
        let pattern = format!(r"(?i)\b{marker}\b[\s*_]*[:=][\s*_]*(\d+(?:\.\d+)?)[ \t]*(%)?");
        Self {
            name,
            pattern: compile(&[&pattern]).into_iter().next(),
        }
    }

    /// Primary final-answer marker.
    pub fn marker() -> Self {
        Self::for_marker("marker", "PROGNOSE")
    }

    /// Final-answer marker of the extended multi-phase output format.
    pub fn extended_marker() -> Self {
        Self::for_marker("extended_marker", "HAUPTPROGNOSE")
    }
}

impl ExtractionRule for LabelledFieldRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn try_extract(&self, text: &str, _source_hint: &str) -> Option<f64> {
        self.pattern.as_ref()?.captures_iter(text).find_map(|caps| {
            let raw = caps.get(1)?.as_str();
            in_bounds(parse_labelled(raw, caps.get(2).is_some())?)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Closed-form calculation results
// ═══════════════════════════════════════════════════════════════════════════

/// `Final_Probability = ...` style results. The last occurrence wins.
pub struct CalculationRule {
    patterns: Vec<Regex>,
}

impl Default for CalculationRule {
    fn default() -> Self {
        Self {
            patterns: compile(&[
                r"(?im)\bfinal_probability\s*=\s*(\d+(?:\.\d+)?)",
                r"(?im)\bfinal_probability\s*=.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?im)\bprobability\s*=\s*(\d+(?:\.\d+)?)\s*%?",
                r"(?im)=\s*(\d+(?:\.\d+)?)[ \t]*%?[ \t]*$",
            ]),
        }
    }
}

impl ExtractionRule for CalculationRule {
    fn name(&self) -> &'static str {
        "calculation"
    }

    fn try_extract(&self, text: &str, _source_hint: &str) -> Option<f64> {
        self.patterns
            .iter()
            .find_map(|re| last_valid(re, text))
            .map(|(_, value)| value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Source-family phrasings
// ═══════════════════════════════════════════════════════════════════════════

/// Phrasings used by one family of sources, applied only when the source
/// identifier contains `family`.
pub struct SourceFamilyRule {
    family: &'static str,
    patterns: Vec<Regex>,
}

impl SourceFamilyRule {
    pub fn new(family: &'static str, patterns: &[&str]) -> Self {
        Self {
            family,
            patterns: compile(patterns),
        }
    }

    pub fn deepseek() -> Self {
        Self::new(
            "deepseek",
            &[
                r"(?i)therefore,?\s+the\s+probability\s+is\s+(\d+(?:\.\d+)?)\s*%",
                r"(?i)I\s+estimate\s+(?:the\s+probability\s+)?(?:to\s+be\s+)?(\d+(?:\.\d+)?)\s*%",
                r"(?i)my\s+assessment:\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)estimated\s+probability:\s*(\d+(?:\.\d+)?)\s*%",
            ],
        )
    }

    pub fn qwen() -> Self {
        Self::new(
            "qwen",
            &[
                r"(?i)my\s+final\s+estimate:\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)I\s+conclude\s+(?:with\s+)?(?:a\s+)?(\d+(?:\.\d+)?)\s*%",
                r"(?i)overall\s+probability:\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bassessment:\s*(\d+(?:\.\d+)?)\s*%",
            ],
        )
    }
}

impl ExtractionRule for SourceFamilyRule {
    fn name(&self) -> &'static str {
        self.family
    }

    fn try_extract(&self, text: &str, source_hint: &str) -> Option<f64> {
        if !source_hint.to_lowercase().contains(self.family) {
            return None;
        }
        self.patterns
            .iter()
            .find_map(|re| last_valid(re, text))
            .map(|(_, value)| value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Keyword-labelled sections
// ═══════════════════════════════════════════════════════════════════════════

/// A line labelled `Forecast:`, `Wahrscheinlichkeit:` etc. whose value sits
/// after the colon or on one of the next two lines. Ranges yield their midpoint.
pub struct KeywordSectionRule {
    label: Option<Regex>,
    range: Option<Regex>,
    percent: Option<Regex>,
    number: Option<Regex>,
}

impl Default for KeywordSectionRule {
    fn default() -> Self {
        let mut compiled = compile(&[
            r"(?i)\b(?:prognose|forecast|prediction|probability|wahrscheinlichkeit|estimate|assessment|conclusion|answer|antwort|ergebnis|result|einschätzung|schätzung)\s*:",
            r"(\d+(?:\.\d+)?)\s*%?\s*(?:-|–|to|bis)\s*(\d+(?:\.\d+)?)\s*%",
            r"(\d+(?:\.\d+)?)\s*%",
            r"\b(\d+(?:\.\d+)?)\b",
        ])
        .into_iter();
        Self {
            label: compiled.next(),
            range: compiled.next(),
            percent: compiled.next(),
            number: compiled.next(),
        }
    }
}

impl KeywordSectionRule {
    fn value_in(&self, segment: &str) -> Option<f64> {
        if let Some(caps) = self.range.as_ref().and_then(|re| re.captures(segment)) {
            let low = in_bounds(caps.get(1)?.as_str().parse().ok()?);
            let high = in_bounds(caps.get(2)?.as_str().parse().ok()?);
            if let (Some(low), Some(high)) = (low, high) {
                return Some((low + high) / 2.0);
            }
        }
        if let Some(caps) = self.percent.as_ref().and_then(|re| re.captures(segment)) {
            return in_bounds(caps.get(1)?.as_str().parse().ok()?);
        }
        let raw = self.number.as_ref()?.captures(segment)?.get(1)?.as_str();
        in_bounds(parse_labelled(raw, false)?)
    }
}

impl ExtractionRule for KeywordSectionRule {
    fn name(&self) -> &'static str {
        "keyword_section"
    }

    fn try_extract(&self, text: &str, _source_hint: &str) -> Option<f64> {
        let label = self.label.as_ref()?;
        let lines: Vec<&str> = text.lines().collect();

        lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                let m = label.find(line)?;
                let same_line = &line[m.end()..];
                std::iter::once(same_line)
                    .chain(lines.iter().skip(i + 1).take(KEYWORD_LOOKAHEAD).copied())
                    .find(|segment| segment.chars().any(|c| c.is_ascii_digit()))
                    .and_then(|segment| self.value_in(segment))
            })
            .last()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Generic phrasings
// ═══════════════════════════════════════════════════════════════════════════

/// Common probability phrasings anywhere in the text; the latest one wins.
///
/// Bare percentages are only considered when no phrasing matched.
pub struct GenericPhrasingRule {
    phrased: Vec<Regex>,
    bare: Vec<Regex>,
}

impl Default for GenericPhrasingRule {
    fn default() -> Self {
        Self {
            phrased: compile(&[
                r#"(?i)\{\s*"probability"\s*:\s*(\d+(?:\.\d+)?)\s*\}"#,
                r#"(?i)"probability"\s*:\s*"?(\d+(?:\.\d+)?)"?\s*%?"#,
                r"(?i)\bprobability\s*(?:of|is|:)?\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)\b(\d+(?:\.\d+)?)\s*%\s*probability",
                r"(?i)\bfinal\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\banswer\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)=\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)\btherefore\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bconclusion\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bestimate\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bassess.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\blikely\b.*?\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\b(?:around|approximately|roughly|about)\s*(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bmy\s+(?:final\s+)?(?:forecast|prediction|estimate)\s+is\s+(\d+(?:\.\d+)?)\s*%",
                r"(?i)\bI\s+(?:would\s+)?(?:forecast|predict|estimate)\s+(\d+(?:\.\d+)?)\s*%",
                r"(?i)\((?:\s*\d+(?:\.\d+)?\s*×.*?)\)\s*/\s*100\s*=\s*(\d+(?:\.\d+)?)",
                r"(?i)\b(?:antwort|ergebnis):\s*(\d+(?:\.\d+)?)\s*%",
            ]),
            bare: compile(&[
                r"\b(\d+(?:\.\d+)?)\s*%",
                r"(?i)\b(\d+(?:\.\d+)?)\s*percent\b",
            ]),
        }
    }
}

impl GenericPhrasingRule {
    fn latest(patterns: &[Regex], text: &str) -> Option<f64> {
        patterns
            .iter()
            .filter_map(|re| last_valid(re, text))
            .max_by_key(|(end, _)| *end)
            .map(|(_, value)| value)
    }
}

impl ExtractionRule for GenericPhrasingRule {
    fn name(&self) -> &'static str {
        "generic_phrasing"
    }

    fn try_extract(&self, text: &str, _source_hint: &str) -> Option<f64> {
        Self::latest(&self.phrased, text).or_else(|| Self::latest(&self.bare, text))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Last resort
// ═══════════════════════════════════════════════════════════════════════════

/// Any bare number in [0, 100] near the end of the text, scanning backward.
pub struct TailNumberRule {
    number: Option<Regex>,
}

impl Default for TailNumberRule {
    fn default() -> Self {
        Self {
            number: compile(&[r"\b(\d+(?:\.\d+)?)\b"]).into_iter().next(),
        }
    }
}

impl ExtractionRule for TailNumberRule {
    fn name(&self) -> &'static str {
        "tail_number"
    }

    fn try_extract(&self, text: &str, _source_hint: &str) -> Option<f64> {
        let mut start = text.len().saturating_sub(TAIL_WINDOW);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        let tail = &text[start..];

        let numbers: Vec<&str> = self
            .number
            .as_ref()?
            .captures_iter(tail)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        numbers
            .into_iter()
            .rev()
            .find_map(|raw| in_bounds(raw.parse().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_tolerates_markup() {
        let rule = LabelledFieldRule::marker();
        for text in [
            "PROGNOSE: 42%",
            "**PROGNOSE:** 42%",
            "**PROGNOSE: 42%**",
            "PROGNOSE: **42%**",
            "prognose = 42",
            "## PROGNOSE:\n42 %",
        ] {
            assert_eq!(rule.try_extract(text, ""), Some(42.0), "{text}");
        }
        assert_eq!(rule.try_extract("HAUPTPROGNOSE: 42%", ""), None);
    }

    #[test]
    fn test_marker_requires_separator() {
        let rule = LabelledFieldRule::marker();
        let text = "Für diese Prognose 3 Szenarien betrachtet, die Prognose 10 Jahre voraus.\n\nPROGNOSE: 42%";
        assert_eq!(rule.try_extract(text, ""), Some(42.0));
        assert_eq!(rule.try_extract("Die Prognose 2030 bleibt offen.", ""), None);
    }

    #[test]
    fn test_marker_scales_bare_fraction_only() {
        let rule = LabelledFieldRule::marker();
        assert_eq!(rule.try_extract("PROGNOSE: 0.35", ""), Some(35.0));
        assert_eq!(rule.try_extract("PROGNOSE: 0.35%", ""), Some(0.35));
        assert_eq!(rule.try_extract("PROGNOSE: 1", ""), Some(1.0));
    }

    #[test]
    fn test_marker_skips_out_of_range() {
        let rule = LabelledFieldRule::marker();
        assert_eq!(rule.try_extract("PROGNOSE: 150%", ""), None);
        assert_eq!(
            rule.try_extract("PROGNOSE: 150%\nCorrected PROGNOSE: 45%", ""),
            Some(45.0)
        );
    }

    #[test]
    fn test_extended_marker() {
        let rule = LabelledFieldRule::extended_marker();
        assert_eq!(rule.try_extract("**HAUPTPROGNOSE: 27.5%**", ""), Some(27.5));
        assert_eq!(rule.try_extract("PROGNOSE: 27%", ""), None);
    }

    #[test]
    fn test_calculation_takes_last() {
        let rule = CalculationRule::default();
        assert_eq!(rule.try_extract("Final_Probability = 37", ""), Some(37.0));
        let text = "Final_Probability = 40\nAfter adjusting for base rates:\nFinal_Probability = 33";
        assert_eq!(rule.try_extract(text, ""), Some(33.0));
        assert_eq!(rule.try_extract("base = 20 + 5 = 25%", ""), Some(25.0));
        assert_eq!(rule.try_extract("x = 250", ""), None);
    }

    #[test]
    fn test_source_family_requires_hint() {
        let rule = SourceFamilyRule::deepseek();
        let text = "Therefore, the probability is 18%.";
        assert_eq!(rule.try_extract(text, "deepseek/deepseek-r1"), Some(18.0));
        assert_eq!(rule.try_extract(text, "openai/gpt-4o"), None);

        let qwen = SourceFamilyRule::qwen();
        assert_eq!(
            qwen.try_extract("My final estimate: 61%", "Qwen/qwen-2.5-72b"),
            Some(61.0)
        );
    }

    #[test]
    fn test_keyword_section() {
        let rule = KeywordSectionRule::default();
        assert_eq!(rule.try_extract("Forecast: 40-60%", ""), Some(50.0));
        assert_eq!(rule.try_extract("Wahrscheinlichkeit:\n\n  35 %", ""), Some(35.0));
        assert_eq!(rule.try_extract("Estimate: 0.42", ""), Some(42.0));
        assert_eq!(
            rule.try_extract("Estimate: 20%\nmore thoughts\nConclusion: 30%", ""),
            Some(30.0)
        );
        assert_eq!(rule.try_extract("Answer: 150%", ""), None);
    }

    #[test]
    fn test_generic_phrasing_prefers_latest() {
        let rule = GenericPhrasingRule::default();
        let text = "Initially I estimate 20%. After review, the answer is roughly 35%.";
        assert_eq!(rule.try_extract(text, ""), Some(35.0));
        assert_eq!(rule.try_extract(r#"{"probability": 64}"#, ""), Some(64.0));
        assert_eq!(rule.try_extract("Growth of 3% then 12 percent", ""), Some(12.0));
        assert_eq!(rule.try_extract("likely 150% of last year", ""), None);
    }

    #[test]
    fn test_tail_number() {
        let rule = TailNumberRule::default();
        assert_eq!(rule.try_extract("In 2026 the chance is 17", ""), Some(17.0));
        assert_eq!(rule.try_extract("values 2024 and 150", ""), None);

        // Multi-byte text straddling the window edge
        let text = format!("{}ä 9", "ü".repeat(400));
        assert_eq!(rule.try_extract(&text, ""), Some(9.0));
    }
}
