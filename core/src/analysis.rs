use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;

/// The request categories routing distinguishes. Detection order matters:
/// the first matching family wins, so "write tests for the parser" is
/// testing, not code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryIntent {
    CodeGeneration,
    Debugging,
    Testing,
    Documentation,
    Analysis,
    General,
}

impl QueryIntent {
    pub fn describe(self) -> &'static str {
        match self {
            QueryIntent::CodeGeneration => "code-generation",
            QueryIntent::Debugging => "debugging",
            QueryIntent::Testing => "testing",
            QueryIntent::Documentation => "documentation",
            QueryIntent::Analysis => "analysis",
            QueryIntent::General => "general",
        }
    }

    /// Tools an agent is expected to carry to serve an intent.
    pub fn required_tools(self) -> &'static [&'static str] {
        match self {
            QueryIntent::CodeGeneration => &["edit", "write", "create"],
            QueryIntent::Debugging => &["read", "grep", "shell", "debug"],
            QueryIntent::Testing => &["shell", "read", "test"],
            QueryIntent::Documentation => &["read", "write", "edit"],
            QueryIntent::Analysis => &["read", "grep", "search"],
            QueryIntent::General => &[],
        }
    }

    /// Lexicon whose presence in agent text signals fitness for the intent.
    pub fn lexicon(self) -> &'static [&'static str] {
        match self {
            QueryIntent::CodeGeneration => {
                &["generate", "create", "write", "implement", "build", "code", "scaffold"]
            }
            QueryIntent::Debugging => {
                &["debug", "fix", "bug", "error", "diagnose", "troubleshoot", "crash"]
            }
            QueryIntent::Testing => {
                &["test", "testing", "coverage", "assert", "spec", "verify"]
            }
            QueryIntent::Documentation => {
                &["document", "documentation", "docs", "readme", "explain", "comment"]
            }
            QueryIntent::Analysis => {
                &["analyze", "analysis", "review", "inspect", "evaluate", "audit"]
            }
            QueryIntent::General => &["general", "assistant", "help"],
        }
    }
}

/// Derived per request; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub keywords: Vec<String>,
    pub intent: QueryIntent,
    pub complexity: u8,
    pub technologies: Vec<String>,
    /// Agent named by the `use <agent>: "<query>"` syntax, when present.
    pub explicit_agent: Option<String>,
    /// The quoted text of an explicit invocation.
    pub explicit_query: Option<String>,
}

impl QueryAnalysis {
    /// The query the selected agent should actually answer.
    pub fn effective_query<'a>(&'a self, original: &'a str) -> &'a str {
        self.explicit_query.as_deref().unwrap_or(original)
    }
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "for", "with", "from", "this", "that", "what",
    "when", "where", "which", "how", "why", "can", "could", "would", "should", "will", "are",
    "is", "was", "were", "have", "has", "had", "not", "you", "your",
];

static EXPLICIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*use\s+([A-Za-z0-9_-]+)\s*:\s*"([^"]*)""#).expect("compiled explicit regex")
});

static CONNECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(and|then|also|additionally|furthermore|moreover|plus|afterwards)\b")
        .expect("compiled connective regex")
});

/// Intent families in priority order; the first hit wins.
static INTENT_FAMILIES: Lazy<Vec<(QueryIntent, Regex)>> = Lazy::new(|| {
    vec![
        (
            QueryIntent::Testing,
            Regex::new(r"\b(tests?|testing|unit[- ]tests?|test case|coverage|assert\w*|spec)\b")
                .expect("compiled testing regex"),
        ),
        (
            QueryIntent::Debugging,
            Regex::new(
                r"\b(debug\w*|fix\w*|bugs?|errors?|crash\w*|broken|fails?|failing|exception|stack ?trace)\b",
            )
            .expect("compiled debugging regex"),
        ),
        (
            QueryIntent::Documentation,
            Regex::new(r"\b(documentation|documents?|docs|readme|docstrings?|comments?|changelog)\b")
                .expect("compiled documentation regex"),
        ),
        (
            QueryIntent::CodeGeneration,
            Regex::new(
                r"\b(generate|create|write|implement|build|scaffold|code|functions?|class(es)?|components?|module)\b",
            )
            .expect("compiled code-generation regex"),
        ),
        (
            QueryIntent::Analysis,
            Regex::new(r"\b(analy[sz]e|analysis|review|understand|investigate|evaluate|explain|audit)\b")
                .expect("compiled analysis regex"),
        ),
    ]
});

/// Fixed technology vocabulary: web frameworks, runtimes, languages, cloud,
/// and datastores. Detection is case-insensitive whole-word matching.
static TECHNOLOGY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    const TECHS: &[(&str, &str)] = &[
        ("react", r"\breact(\.js)?\b"),
        ("vue", r"\bvue(\.js)?\b"),
        ("angular", r"\bangular\b"),
        ("svelte", r"\bsvelte\b"),
        ("nextjs", r"\bnext(\.js|js)\b"),
        ("express", r"\bexpress(\.js)?\b"),
        ("django", r"\bdjango\b"),
        ("flask", r"\bflask\b"),
        ("rails", r"\brails\b"),
        ("spring", r"\bspring\b"),
        ("node", r"\bnode(\.js|js)?\b"),
        ("deno", r"\bdeno\b"),
        ("javascript", r"\b(javascript|js)\b"),
        ("typescript", r"\b(typescript|ts)\b"),
        ("python", r"\bpython\b"),
        ("rust", r"\brust\b"),
        ("go", r"\b(golang|go)\b"),
        ("java", r"\bjava\b"),
        ("csharp", r"c#|\b(csharp|dotnet)\b"),
        ("ruby", r"\bruby\b"),
        ("php", r"\bphp\b"),
        ("swift", r"\bswift\b"),
        ("kotlin", r"\bkotlin\b"),
        ("aws", r"\b(aws|amazon web services)\b"),
        ("azure", r"\bazure\b"),
        ("gcp", r"\b(gcp|google cloud)\b"),
        ("docker", r"\bdocker\b"),
        ("kubernetes", r"\b(kubernetes|k8s)\b"),
        ("terraform", r"\bterraform\b"),
        ("postgres", r"\bpostgres(ql)?\b"),
        ("mysql", r"\bmysql\b"),
        ("mongodb", r"\bmongo(db)?\b"),
        ("redis", r"\bredis\b"),
        ("sqlite", r"\bsqlite\b"),
        ("graphql", r"\bgraphql\b"),
        ("kafka", r"\bkafka\b"),
    ];
    TECHS
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).expect("compiled technology regex")))
        .collect()
});

/// Markers of architecturally complex requests, used by automatic mode
/// selection.
static COMPLEX_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(architect\w*|microservices?|distributed|scalab\w*|optimi[sz]\w*|refactor\w*|concurren\w*|async\w*|security|performance|integration|migration|design)\b",
    )
    .expect("compiled complex marker regex")
});

pub fn analyze(query: &str) -> QueryAnalysis {
    let lower = query.to_lowercase();

    let (explicit_agent, explicit_query) = match EXPLICIT_RE.captures(query) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str().to_string()),
            caps.get(2).map(|m| m.as_str().to_string()),
        ),
        None => (None, None),
    };

    // Intent, keywords, and complexity come from the effective text so an
    // explicit invocation is analyzed by what it asks, not its envelope.
    let analyzed = explicit_query.as_deref().unwrap_or(&lower).to_lowercase();

    QueryAnalysis {
        keywords: extract_keywords(&analyzed),
        intent: detect_intent(&analyzed),
        complexity: complexity_score(&analyzed),
        technologies: detect_technologies(&analyzed),
        explicit_agent,
        explicit_query,
    }
}

/// Lowercased tokens, minus stopwords and short words, first ten kept in
/// order of appearance.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .filter(|t| t.len() > 2)
    {
        let token = token.to_lowercase();
        if STOPWORDS.contains(&token.as_str()) || keywords.contains(&token) {
            continue;
        }
        keywords.push(token);
        if keywords.len() == 10 {
            break;
        }
    }
    keywords
}

pub fn detect_intent(text: &str) -> QueryIntent {
    let text = text.to_lowercase();
    for (intent, regex) in INTENT_FAMILIES.iter() {
        if regex.is_match(&text) {
            return *intent;
        }
    }
    QueryIntent::General
}

/// Complexity in [1, 10]: a base point plus contributions from keyword
/// count, raw length, and connective conjunctions. Very long queries
/// saturate at 10.
pub fn complexity_score(text: &str) -> u8 {
    if text.len() > 10_000 {
        return 10;
    }

    let keyword_count = extract_keywords(text).len();
    let keyword_factor = match keyword_count {
        0..=2 => 0,
        3..=4 => 1,
        5..=7 => 2,
        _ => 3,
    };
    let length_factor = match text.len() {
        0..=50 => 0,
        51..=200 => 1,
        201..=500 => 2,
        _ => 3,
    };
    let connectives = CONNECTIVE_RE.find_iter(text).count().min(3);

    (1 + keyword_factor + length_factor + connectives).clamp(1, 10) as u8
}

pub fn detect_technologies(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    TECHNOLOGY_PATTERNS
        .iter()
        .filter(|(_, regex)| regex.is_match(&text))
        .map(|(name, _)| (*name).to_string())
        .collect()
}

/// Count of complexity markers, used by automatic mode selection.
pub fn complex_marker_count(text: &str) -> usize {
    COMPLEX_MARKER_RE.find_iter(&text.to_lowercase()).count()
}

/// Count of connective conjunctions, shared by complexity scoring and
/// automatic mode selection.
pub fn connective_count(text: &str) -> usize {
    CONNECTIVE_RE.find_iter(&text.to_lowercase()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn explicit_invocation_is_parsed() {
        let analysis = analyze(r#"use test-expert: "write tests for parseDate""#);
        assert_eq!(analysis.explicit_agent.as_deref(), Some("test-expert"));
        assert_eq!(
            analysis.explicit_query.as_deref(),
            Some("write tests for parseDate")
        );
        assert_eq!(analysis.intent, QueryIntent::Testing);
    }

    #[test]
    fn malformed_explicit_syntax_falls_through() {
        let analysis = analyze("use the grep tool to find callers");
        assert!(analysis.explicit_agent.is_none());
    }

    #[test]
    fn keywords_drop_stopwords_and_short_tokens() {
        let keywords = extract_keywords("how can I fix the broken build on CI");
        assert_eq!(keywords, vec!["fix", "broken", "build"]);
    }

    #[test]
    fn keywords_cap_at_ten() {
        let text = (0..30).map(|i| format!("token{i}")).collect::<Vec<_>>().join(" ");
        assert_eq!(extract_keywords(&text).len(), 10);
    }

    #[test]
    fn intent_order_prefers_testing_over_generation() {
        assert_eq!(
            detect_intent("write tests for the parser"),
            QueryIntent::Testing
        );
        assert_eq!(
            detect_intent("write a parser for json"),
            QueryIntent::CodeGeneration
        );
        assert_eq!(detect_intent("fix the crash on startup"), QueryIntent::Debugging);
        assert_eq!(detect_intent("hello there"), QueryIntent::General);
    }

    #[test]
    fn complexity_is_bounded_and_saturates() {
        assert_eq!(complexity_score("hi"), 1);
        let long = "implement and test and document and deploy ".repeat(300);
        assert_eq!(complexity_score(&long), 10);
        for text in ["fix bug", "write a react component and test it thoroughly"] {
            let score = complexity_score(text);
            assert!((1..=10).contains(&score));
        }
    }

    #[test]
    fn technologies_are_detected_case_insensitively() {
        let techs = detect_technologies("a react component in TypeScript backed by postgres");
        assert!(techs.contains(&"react".to_string()));
        assert!(techs.contains(&"typescript".to_string()));
        assert!(techs.contains(&"postgres".to_string()));
    }

    #[test]
    fn analysis_is_deterministic() {
        let query = "design, implement, and test a React component with documentation";
        assert_eq!(analyze(query), analyze(query));
    }
}
