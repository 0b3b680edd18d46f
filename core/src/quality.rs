use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

/// Heuristic quality scores for one response, all in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseQuality {
    pub length: f64,
    pub completeness: f64,
    pub specificity: f64,
    pub coherence: f64,
    /// Only present when the response contains code markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_quality: Option<f64>,
    pub overall: f64,
}

const HEDGING_PHRASES: &[&str] = &[
    "might be",
    "could be",
    "possibly",
    "perhaps",
    "usually",
    "generally",
    "typically",
    "probably",
    "it depends",
    "maybe",
];

const SPECIFICITY_MARKERS: &[&str] = &[
    "specifically",
    "for example",
    "for instance",
    "in particular",
    "exactly",
    "precisely",
    "such as",
    "e.g.",
];

const FLOW_MARKERS: &[&str] = &[
    "first", "second", "then", "next", "finally", "after that", "step",
];

static CODE_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```|\b(function|class|def|fn|impl|const|let|var)\b")
        .expect("compiled code marker regex")
});

static STRUCTURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*([-*]|\d+\.)\s+").expect("compiled structure regex"));

static DEFINITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(function|class|def|fn)\b").expect("compiled definition regex")
});

static COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(//|#\s|/\*)").expect("compiled comment regex"));

static ERROR_HANDLING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(try|catch|except|raise|throw|Result|unwrap_or)\b")
        .expect("compiled error handling regex")
});

static TEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(test|assert\w*|expect)\b").expect("compiled test regex"));

/// Score one response against the query that produced it.
pub fn evaluate(response: &str, query: &str) -> ResponseQuality {
    let length = length_score(response.chars().count());
    let completeness = completeness_score(response, query);
    let specificity = specificity_score(response);
    let coherence = coherence_score(response);
    let code_quality = code_quality_score(response);

    let weighted = 0.15 * length + 0.35 * completeness + 0.25 * specificity + 0.25 * coherence;
    let overall = match code_quality {
        Some(code) => (weighted + 0.10 * code) / 1.10,
        None => weighted,
    };

    ResponseQuality {
        length,
        completeness,
        specificity,
        coherence,
        code_quality,
        overall: overall.clamp(0.0, 1.0),
    }
}

/// Piecewise length curve peaking between 100 and 2000 characters.
fn length_score(chars: usize) -> f64 {
    match chars {
        0..=9 => 0.1,
        10..=99 => 0.2 + 0.6 * ((chars - 10) as f64 / 90.0),
        100..=2000 => 1.0,
        2001..=5000 => 0.8,
        5001..=10_000 => 0.6,
        _ => 0.4,
    }
}

/// Fraction of substantive query words (length > 3) echoed by the response.
fn completeness_score(response: &str, query: &str) -> f64 {
    let response = response.to_lowercase();
    let words: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect();
    if words.is_empty() {
        return 1.0;
    }
    let covered = words.iter().filter(|w| response.contains(w.as_str())).count();
    covered as f64 / words.len() as f64
}

/// Baseline 0.5, nudged down by hedging and up by concrete markers.
fn specificity_score(response: &str) -> f64 {
    let lower = response.to_lowercase();
    let hedges = HEDGING_PHRASES
        .iter()
        .filter(|phrase| lower.contains(*phrase))
        .count() as f64;
    let markers = SPECIFICITY_MARKERS
        .iter()
        .filter(|phrase| lower.contains(*phrase))
        .count() as f64;
    (0.5 - 0.1 * hedges + 0.1 * markers).clamp(0.0, 1.0)
}

/// Baseline 0.6, plus ordered-flow markers and visible structure.
fn coherence_score(response: &str) -> f64 {
    let lower = response.to_lowercase();
    let mut score: f64 = 0.6;
    if FLOW_MARKERS.iter().any(|marker| lower.contains(marker)) {
        score += 0.2;
    }
    if response.contains("\n\n") || STRUCTURE_RE.is_match(response) {
        score += 0.2;
    }
    score.min(1.0)
}

/// Only applies when code markers are present: starts at 0.5, rewarded for
/// definitions, comments, error handling, and tests.
fn code_quality_score(response: &str) -> Option<f64> {
    if !CODE_MARKER_RE.is_match(response) {
        return None;
    }
    let mut score: f64 = 0.5;
    if DEFINITION_RE.is_match(response) {
        score += 0.2;
    }
    if COMMENT_RE.is_match(response) {
        score += 0.1;
    }
    if ERROR_HANDLING_RE.is_match(response) {
        score += 0.1;
    }
    if TEST_RE.is_match(response) {
        score += 0.1;
    }
    Some(score.min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn length_peaks_in_the_middle() {
        assert!(length_score(5) < length_score(50));
        assert_eq!(length_score(500), 1.0);
        assert!(length_score(500) > length_score(3000));
        assert!(length_score(3000) > length_score(20_000));
    }

    #[test]
    fn completeness_tracks_query_coverage() {
        let full = completeness_score(
            "to write the factorial function, multiply numbers recursively",
            "write a factorial function",
        );
        assert_eq!(full, 1.0);

        let partial = completeness_score("here you go", "write a factorial function");
        assert_eq!(partial, 0.0);
    }

    #[test]
    fn hedging_lowers_specificity() {
        let hedged = specificity_score("it might be possible, it depends on the setup");
        let concrete = specificity_score("specifically, use a BTreeMap, for example like this");
        assert!(hedged < 0.5);
        assert!(concrete > 0.5);
    }

    #[test]
    fn structure_raises_coherence() {
        let flat = coherence_score("just one run-on blob of text");
        let structured = coherence_score("First, do this.\n\n- item one\n- item two\n\nFinally done.");
        assert_eq!(flat, 0.6);
        assert_eq!(structured, 1.0);
    }

    #[test]
    fn code_quality_only_applies_to_code() {
        assert!(code_quality_score("plain prose answer with no markers").is_none());
        let scored = code_quality_score(
            "```js\n// helper\nfunction add(a, b) { try { return a + b; } catch (e) {} }\n```",
        )
        .unwrap();
        assert!(scored >= 0.9);
    }

    #[test]
    fn overall_is_renormalized_without_code() {
        let prose = evaluate(
            "Specifically, the answer is forty two. First reason one. Then reason two.",
            "what is the answer",
        );
        assert!(prose.code_quality.is_none());
        assert!((0.0..=1.0).contains(&prose.overall));

        let code = evaluate(
            "```rust\nfn answer() -> u32 { 42 } // the answer\n```",
            "write the answer function",
        );
        assert!(code.code_quality.is_some());
        assert!((0.0..=1.0).contains(&code.overall));
    }
}
