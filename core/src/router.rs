use pk_agents::AgentRegistry;
use pk_agents::AgentSpec;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::analysis::QueryAnalysis;
use crate::analysis::QueryIntent;
use crate::analysis::analyze;
use crate::error::RouterError;

/// Bucketed routing certainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteConfidence {
    None,
    Low,
    Medium,
    High,
    Exact,
}

impl RouteConfidence {
    pub fn value(self) -> f64 {
        match self {
            RouteConfidence::Exact => 1.0,
            RouteConfidence::High => 0.8,
            RouteConfidence::Medium => 0.6,
            RouteConfidence::Low => 0.4,
            RouteConfidence::None => 0.0,
        }
    }

    /// Bucket a composite score. Anything under the LOW floor is NONE and
    /// not selectable as a primary answer.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            RouteConfidence::Exact
        } else if score >= 0.7 {
            RouteConfidence::High
        } else if score >= 0.5 {
            RouteConfidence::Medium
        } else if score >= 0.3 {
            RouteConfidence::Low
        } else {
            RouteConfidence::None
        }
    }
}

/// One scored agent candidate.
#[derive(Debug, Clone)]
pub struct AgentMatch {
    pub agent: Arc<AgentSpec>,
    pub confidence: RouteConfidence,
    pub score: f64,
    pub reason: String,
}

/// Single-agent routing decision.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub selected: AgentMatch,
    pub alternatives: Vec<AgentMatch>,
    pub analysis: QueryAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
    Prioritized,
}

/// Multi-agent routing decision: primaries carry the answer, secondaries
/// add supporting opinions.
#[derive(Debug, Clone)]
pub struct MultiAgentRoutingResult {
    pub primary: Vec<AgentMatch>,
    pub secondary: Vec<AgentMatch>,
    pub strategy: ExecutionStrategy,
    pub estimated_duration_ms: u64,
    pub analysis: QueryAnalysis,
}

impl MultiAgentRoutingResult {
    pub fn all_matches(&self) -> impl Iterator<Item = &AgentMatch> {
        self.primary.iter().chain(self.secondary.iter())
    }

    pub fn agent_count(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }
}

/// Scores registry agents against analyzed queries. Deterministic: the
/// same registry contents and query always produce the same decision.
pub struct Router {
    registry: Arc<AgentRegistry>,
    fallback: Option<String>,
}

impl Router {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<Option<String>>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub async fn route_single(&self, query: &str) -> Result<RoutingResult, RouterError> {
        let analysis = analyze(query);

        if let Some(result) = self.try_explicit(&analysis).await {
            return Ok(result);
        }
        if analysis.effective_query(query).trim().is_empty() {
            return self.fallback_result(analysis).await;
        }

        let scored = self.score_all(&analysis).await;
        let mut qualified = scored
            .iter()
            .filter(|m| m.confidence != RouteConfidence::None);

        match qualified.next() {
            Some(best) => {
                let alternatives = scored
                    .iter()
                    .filter(|m| !Arc::ptr_eq(&m.agent, &best.agent) && m.score > 0.05)
                    .take(3)
                    .cloned()
                    .collect();
                debug!(agent = %best.agent.name, score = best.score, "routed query");
                Ok(RoutingResult {
                    selected: best.clone(),
                    alternatives,
                    analysis,
                })
            }
            None => self.fallback_result(analysis).await,
        }
    }

    pub async fn route_multi(
        &self,
        query: &str,
        max_agents: usize,
    ) -> Result<MultiAgentRoutingResult, RouterError> {
        let max_agents = max_agents.max(1);
        let analysis = analyze(query);

        if let Some(single) = self.try_explicit(&analysis).await {
            let estimated_duration_ms = estimate_duration(&[single.selected.clone()]);
            return Ok(MultiAgentRoutingResult {
                primary: vec![single.selected],
                secondary: Vec::new(),
                strategy: ExecutionStrategy::Sequential,
                estimated_duration_ms,
                analysis: single.analysis,
            });
        }

        let scored = self.score_all(&analysis).await;

        let mut primary: Vec<AgentMatch> = scored
            .iter()
            .filter(|m| m.confidence >= RouteConfidence::High)
            .take(max_agents)
            .cloned()
            .collect();
        let mut secondary: Vec<AgentMatch> = scored
            .iter()
            .filter(|m| m.confidence == RouteConfidence::Medium)
            .take(max_agents.saturating_sub(primary.len()))
            .cloned()
            .collect();

        // A multi-agent plan still needs a main answer; when nothing clears
        // HIGH, the best MEDIUM candidate is promoted.
        if primary.is_empty() && !secondary.is_empty() {
            primary.push(secondary.remove(0));
        }
        if primary.is_empty() {
            let fallback = self.fallback_result(analysis.clone()).await?;
            primary.push(fallback.selected);
        }

        let strategy = if primary.len() == 1 && secondary.is_empty() {
            ExecutionStrategy::Sequential
        } else if analysis.complexity > 7 {
            ExecutionStrategy::Prioritized
        } else {
            ExecutionStrategy::Parallel
        };

        let all: Vec<AgentMatch> = primary.iter().chain(secondary.iter()).cloned().collect();
        let estimated_duration_ms = estimate_duration(&all);

        Ok(MultiAgentRoutingResult {
            primary,
            secondary,
            strategy,
            estimated_duration_ms,
            analysis,
        })
    }

    /// True iff the agent carries every tool the detected intent requires
    /// and overlaps the detected technologies (when any were detected).
    pub async fn validate_agent_capability(&self, agent: &AgentSpec, query: &str) -> bool {
        let analysis = analyze(query);
        agent_capable(agent, &analysis)
    }

    async fn try_explicit(&self, analysis: &QueryAnalysis) -> Option<RoutingResult> {
        let name = analysis.explicit_agent.as_deref()?;
        let agent = self.registry.get(name).await?;
        debug!(agent = %agent.name, "explicitly requested agent");
        Some(RoutingResult {
            selected: AgentMatch {
                confidence: RouteConfidence::Exact,
                score: 1.0,
                reason: format!("explicitly requested via `use {name}`"),
                agent,
            },
            alternatives: Vec::new(),
            analysis: analysis.clone(),
        })
    }

    /// Score every registered agent, sorted best-first: composite score
    /// descending, then priority, then registration order (the sort is
    /// stable over the registry's insertion order).
    async fn score_all(&self, analysis: &QueryAnalysis) -> Vec<AgentMatch> {
        let agents = self.registry.list().await;
        let mut scored: Vec<AgentMatch> = agents
            .into_iter()
            .map(|agent| {
                let score = composite_score(&agent, analysis);
                AgentMatch {
                    confidence: RouteConfidence::from_score(score),
                    score,
                    reason: score_reason(&agent, analysis, score),
                    agent,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.agent
                        .effective_priority()
                        .cmp(&b.agent.effective_priority())
                })
        });
        scored
    }

    async fn fallback_result(&self, analysis: QueryAnalysis) -> Result<RoutingResult, RouterError> {
        let name = self.fallback.as_deref().ok_or(RouterError::NoAgent)?;
        let agent = self.registry.get(name).await.ok_or(RouterError::NoAgent)?;
        debug!(agent = %agent.name, "falling back to configured agent");
        Ok(RoutingResult {
            selected: AgentMatch {
                confidence: RouteConfidence::Low,
                score: RouteConfidence::Low.value(),
                reason: "no agent cleared the confidence floor; using fallback".to_string(),
                agent,
            },
            alternatives: Vec::new(),
            analysis,
        })
    }
}

/// Composite fitness in [0, 1]: keywords 0.40, intent 0.30, technology
/// 0.20, tooling 0.10.
pub fn composite_score(agent: &AgentSpec, analysis: &QueryAnalysis) -> f64 {
    0.40 * keyword_score(agent, analysis)
        + 0.30 * intent_score(agent, analysis.intent)
        + 0.20 * technology_score(agent, analysis)
        + 0.10 * tool_score(agent, analysis.intent)
}

/// Keyword fitness: direct keyword overlap carries 0.6, partial and
/// name/description matches up to 0.4, and a density bonus up to 0.2 for
/// agents whose keyword set concentrates on the query.
fn keyword_score(agent: &AgentSpec, analysis: &QueryAnalysis) -> f64 {
    if analysis.keywords.is_empty() || agent.keywords.is_empty() {
        return 0.0;
    }
    let agent_text = agent.searchable_text();

    let mut direct = 0usize;
    let mut partial = 0usize;
    for query_kw in &analysis.keywords {
        if agent.has_keyword(query_kw) {
            direct += 1;
        } else if agent.keywords.iter().any(|own| {
            let own = own.to_lowercase();
            own.contains(query_kw.as_str()) || query_kw.contains(&own)
        }) || agent_text.contains(query_kw.as_str())
        {
            partial += 1;
        }
    }

    // Overlap is measured against the smaller keyword set so a focused
    // agent is not diluted by a wordy query.
    let overlap_base = analysis.keywords.len().min(agent.keywords.len()) as f64;
    let direct_component = 0.6 * (direct as f64 / overlap_base).min(1.0);
    let partial_component = 0.4 * (partial as f64 / analysis.keywords.len() as f64);
    let density_bonus = (0.2 * (direct as f64 / agent.keywords.len() as f64)).min(0.2);

    (direct_component + partial_component + density_bonus).min(1.0)
}

/// Intent fitness: how much of the intent's lexicon the agent surface
/// mentions. One hit is a strong signal; two saturate.
fn intent_score(agent: &AgentSpec, intent: QueryIntent) -> f64 {
    let text = agent.searchable_text();
    let matches = intent
        .lexicon()
        .iter()
        .filter(|term| text.contains(*term))
        .count();
    match matches {
        0 => 0.0,
        1 => 0.7,
        _ => 1.0,
    }
}

/// Technology fitness: neutral when the query names no technology; for
/// tech-specific queries, the covered fraction. An agent that names no
/// known technology at all is near-neutral rather than penalized, so
/// generalists stay routable for tech-flavored queries.
fn technology_score(agent: &AgentSpec, analysis: &QueryAnalysis) -> f64 {
    if analysis.technologies.is_empty() {
        return 1.0;
    }
    let text = agent.searchable_text();
    if crate::analysis::detect_technologies(&text).is_empty() {
        return 0.8;
    }
    let covered = analysis
        .technologies
        .iter()
        .filter(|tech| text.contains(tech.as_str()))
        .count();
    covered as f64 / analysis.technologies.len() as f64
}

/// Tooling fitness: the fraction of the intent's required tools the agent
/// carries. Intents with no requirements score full marks.
fn tool_score(agent: &AgentSpec, intent: QueryIntent) -> f64 {
    let required = intent.required_tools();
    if required.is_empty() {
        return 1.0;
    }
    let present = required.iter().filter(|tool| agent.has_tool(tool)).count();
    present as f64 / required.len() as f64
}

pub(crate) fn agent_capable(agent: &AgentSpec, analysis: &QueryAnalysis) -> bool {
    let tools_ok = analysis
        .intent
        .required_tools()
        .iter()
        .all(|tool| agent.has_tool(tool));
    let tech_ok = analysis.technologies.is_empty() || {
        let text = agent.searchable_text();
        analysis
            .technologies
            .iter()
            .any(|tech| text.contains(tech.as_str()))
    };
    tools_ok && tech_ok
}

fn score_reason(agent: &AgentSpec, analysis: &QueryAnalysis, score: f64) -> String {
    format!(
        "{} scored {score:.2} for {} intent ({} keyword(s) considered)",
        agent.name,
        analysis.intent.describe(),
        analysis.keywords.len()
    )
}

/// Duration estimate for a routed agent set: a 2 s base per agent plus
/// 100 ms per tool, discounted 30% when agents run together.
fn estimate_duration(matches: &[AgentMatch]) -> u64 {
    let base: u64 = matches
        .iter()
        .map(|m| 2000 + m.agent.tools.len() as u64 * 100)
        .sum();
    if matches.len() > 1 {
        (base as f64 * 0.7) as u64
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_agents::AgentBuilder;
    use pk_agents::AgentLoader;
    use pk_agents::LoaderOptions;
    use pk_agents::ModelProvider;

    fn agent(name: &str, description: &str, keywords: &[&str], tools: &[&str]) -> AgentSpec {
        AgentBuilder::new(name)
            .description(description)
            .keywords(keywords.iter().copied())
            .tool_names(tools.iter().copied())
            .model("gemini-2.0-flash")
            .provider(ModelProvider::Gemini)
            .example("in", "out")
            .build()
            .unwrap()
    }

    async fn registry_with(agents: Vec<AgentSpec>) -> Arc<AgentRegistry> {
        let registry = AgentRegistry::new(AgentLoader::with_options(
            "/nonexistent",
            LoaderOptions {
                include_global: false,
                ..LoaderOptions::default()
            },
        ));
        for spec in agents {
            registry.register(spec).await;
        }
        Arc::new(registry)
    }

    fn code_generator() -> AgentSpec {
        agent(
            "code-generator",
            "Generates code in javascript and typescript from descriptions",
            &["code", "generate", "javascript", "typescript"],
            &["edit", "write", "create"],
        )
    }

    fn docs_writer() -> AgentSpec {
        agent(
            "docs-writer",
            "Writes documentation and readme files for projects",
            &["docs", "documentation", "readme"],
            &["read", "write", "edit"],
        )
    }

    #[tokio::test]
    async fn routes_code_generation_query_to_code_generator() {
        let registry = registry_with(vec![code_generator(), docs_writer()]).await;
        let router = Router::new(registry);

        let result = router
            .route_single("generate a JavaScript function to calculate factorial")
            .await
            .unwrap();
        assert_eq!(result.selected.agent.name, "code-generator");
        assert!(result.selected.confidence >= RouteConfidence::Medium);
        assert!(!result.alternatives.is_empty());
    }

    #[tokio::test]
    async fn explicit_invocation_returns_exact() {
        let registry = registry_with(vec![
            code_generator(),
            agent(
                "test-expert",
                "Writes and runs unit tests for any codebase",
                &["test", "testing"],
                &["shell", "read", "test"],
            ),
        ])
        .await;
        let router = Router::new(registry);

        let result = router
            .route_single(r#"use test-expert: "write tests for parseDate""#)
            .await
            .unwrap();
        assert_eq!(result.selected.agent.name, "test-expert");
        assert_eq!(result.selected.confidence, RouteConfidence::Exact);
        assert!(result.selected.reason.contains("explicitly requested"));
        assert!(result.alternatives.is_empty());
    }

    #[tokio::test]
    async fn explicit_invocation_of_unknown_agent_falls_through() {
        let registry = registry_with(vec![code_generator()]).await;
        let router = Router::new(registry);

        let result = router
            .route_single(r#"use nobody: "generate code for a factorial function""#)
            .await
            .unwrap();
        assert_ne!(result.selected.confidence, RouteConfidence::Exact);
    }

    #[tokio::test]
    async fn empty_query_uses_fallback_at_low_confidence() {
        let registry = registry_with(vec![code_generator()]).await;
        let router = Router::new(registry).with_fallback("code-generator".to_string());

        let result = router.route_single("").await.unwrap();
        assert_eq!(result.selected.agent.name, "code-generator");
        assert_eq!(result.selected.confidence, RouteConfidence::Low);
    }

    #[tokio::test]
    async fn no_match_and_no_fallback_is_an_error() {
        let registry = registry_with(vec![]).await;
        let router = Router::new(registry);
        assert!(matches!(
            router.route_single("anything").await,
            Err(RouterError::NoAgent)
        ));
    }

    #[tokio::test]
    async fn tie_break_prefers_lower_priority_value() {
        let mut a = agent(
            "twin-a",
            "Identical twin agent used for tie breaking",
            &["twin"],
            &[],
        );
        a.priority = Some(5);
        let mut b = agent(
            "twin-b",
            "Identical twin agent used for tie breaking",
            &["twin"],
            &[],
        );
        b.priority = Some(1);
        let registry = registry_with(vec![a, b]).await;
        let router = Router::new(registry);

        let result = router.route_single("twin").await.unwrap();
        assert_eq!(result.selected.agent.name, "twin-b");
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let registry = registry_with(vec![code_generator(), docs_writer()]).await;
        let router = Router::new(registry);
        let query = "generate a JavaScript function to calculate factorial";

        let first = router.route_single(query).await.unwrap();
        let second = router.route_single(query).await.unwrap();
        assert_eq!(first.selected.agent.name, second.selected.agent.name);
        assert_eq!(first.selected.score, second.selected.score);
        assert_eq!(first.alternatives.len(), second.alternatives.len());
    }

    #[tokio::test]
    async fn multi_routing_selects_specialists_for_complex_query() {
        let registry = registry_with(vec![
            code_generator(),
            agent(
                "react-specialist",
                "Builds react components and frontend features in typescript",
                &["react", "component", "frontend"],
                &["read", "edit", "write", "create", "shell", "test"],
            ),
            agent(
                "test-expert",
                "Writes and runs unit tests for any codebase",
                &["test", "testing"],
                &["shell", "read", "test"],
            ),
            docs_writer(),
        ])
        .await;
        let router = Router::new(registry);

        let result = router
            .route_multi(
                "design, implement, and test a React component with documentation",
                3,
            )
            .await
            .unwrap();
        assert!((2..=3).contains(&result.primary.len()), "{result:?}");
        let names: Vec<&str> = result
            .all_matches()
            .map(|m| m.agent.name.as_str())
            .collect();
        assert!(names.contains(&"react-specialist"));
        assert!(names.contains(&"test-expert") || names.contains(&"docs-writer"));
        assert!(matches!(
            result.strategy,
            ExecutionStrategy::Parallel | ExecutionStrategy::Prioritized
        ));
    }

    #[tokio::test]
    async fn multi_routing_explicit_is_sequential_single() {
        let registry = registry_with(vec![code_generator()]).await;
        let router = Router::new(registry);

        let result = router
            .route_multi(r#"use code-generator: "write a loop""#, 3)
            .await
            .unwrap();
        assert_eq!(result.primary.len(), 1);
        assert_eq!(result.strategy, ExecutionStrategy::Sequential);
        assert_eq!(result.primary[0].confidence, RouteConfidence::Exact);
    }

    #[tokio::test]
    async fn duration_estimate_discounts_parallel_work() {
        let registry = registry_with(vec![code_generator()]).await;
        let router = Router::new(registry);
        let result = router
            .route_multi(r#"use code-generator: "write a loop""#, 3)
            .await
            .unwrap();
        // One agent with three tools: no discount.
        assert_eq!(result.estimated_duration_ms, 2300);
    }

    #[tokio::test]
    async fn capability_check_requires_tools_and_technology() {
        let registry = registry_with(vec![]).await;
        let router = Router::new(registry);

        let capable = agent(
            "js-coder",
            "Writes javascript code for web applications",
            &["javascript", "code"],
            &["edit", "write", "create"],
        );
        assert!(
            router
                .validate_agent_capability(&capable, "generate a javascript helper function")
                .await
        );

        let toolless = agent(
            "talker",
            "Chats about javascript without any tooling",
            &["javascript"],
            &[],
        );
        assert!(
            !router
                .validate_agent_capability(&toolless, "generate a javascript helper function")
                .await
        );
    }

    #[test]
    fn confidence_buckets_match_thresholds() {
        assert_eq!(RouteConfidence::from_score(0.95), RouteConfidence::Exact);
        assert_eq!(RouteConfidence::from_score(0.75), RouteConfidence::High);
        assert_eq!(RouteConfidence::from_score(0.55), RouteConfidence::Medium);
        assert_eq!(RouteConfidence::from_score(0.35), RouteConfidence::Low);
        assert_eq!(RouteConfidence::from_score(0.2), RouteConfidence::None);
    }
}
