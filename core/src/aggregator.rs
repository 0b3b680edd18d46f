use chrono::DateTime;
use chrono::Utc;
use pk_agents::AgentSpec;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::AggregatorError;
use crate::executor::ExecutionResult;
use crate::executor::MultiAgentExecutionResult;
use crate::quality;
use crate::quality::ResponseQuality;
use crate::router::AgentMatch;
use crate::router::MultiAgentRoutingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStrategy {
    HighestConfidence,
    FastestSuccess,
    ExpertPriority,
    MajorityConsensus,
    IntelligentMerge,
}

/// Weights for the composite ranking used by `INTELLIGENT_MERGE`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeWeights {
    pub confidence: f64,
    pub speed: f64,
    pub expertise: f64,
    pub quality: f64,
}

impl Default for MergeWeights {
    fn default() -> Self {
        Self {
            confidence: 0.4,
            speed: 0.2,
            expertise: 0.2,
            quality: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub strategy: ConsensusStrategy,
    pub weights: MergeWeights,
    /// Successes below this routing confidence are not aggregated.
    pub min_confidence: f64,
    pub max_alternatives: usize,
    /// Caller-supplied ranking for `EXPERT_PRIORITY`; smaller is stronger.
    pub expert_priorities: HashMap<String, u32>,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategy::IntelligentMerge,
            weights: MergeWeights::default(),
            min_confidence: 0.3,
            max_alternatives: 3,
            expert_priorities: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub agent: String,
    pub confidence: f64,
    pub content: String,
    pub quality: ResponseQuality,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    pub agent: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusTheme {
    pub term: String,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub has_conflicts: bool,
    pub has_code_conflicts: bool,
    pub has_approach_conflicts: bool,
    /// Human-readable descriptions of each detected conflict.
    pub conflicts: Vec<String>,
    /// Architecture terms at least two agents agreed on.
    pub consensus: Vec<ConsensusTheme>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_agents: usize,
    pub successful_agents: usize,
    pub total_execution_time_ms: u64,
    pub aggregation_overhead_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationMetadata {
    pub strategy: ConsensusStrategy,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub processing_time_ms: u64,
}

/// One primary answer plus ranked supporting opinions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResponse {
    pub primary: ResponseSummary,
    pub supporting: Vec<ResponseSummary>,
    pub confidence: f64,
    pub summary: String,
    pub alternatives: Vec<Alternative>,
    pub conflict_analysis: ConflictAnalysis,
    pub performance: PerformanceMetrics,
    pub recommendation_strength: f64,
    pub metadata: AggregationMetadata,
}

/// Serialization-stable record for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResponse {
    pub version: String,
    pub primary: ResponseSummary,
    pub supporting: Vec<ResponseSummary>,
    pub analysis: StructuredAnalysis,
    pub metadata: AggregationMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredAnalysis {
    pub recommendation_strength: f64,
    pub consensus: Vec<ConsensusTheme>,
    pub conflicts: Vec<String>,
    pub performance: PerformanceMetrics,
}

impl AggregatedResponse {
    pub fn structured(&self) -> StructuredResponse {
        StructuredResponse {
            version: "1.0".to_string(),
            primary: self.primary.clone(),
            supporting: self.supporting.clone(),
            analysis: StructuredAnalysis {
                recommendation_strength: self.recommendation_strength,
                consensus: self.conflict_analysis.consensus.clone(),
                conflicts: self.conflict_analysis.conflicts.clone(),
                performance: self.performance,
            },
            metadata: self.metadata.clone(),
        }
    }
}

/// A successful result joined with its routing context.
struct Candidate {
    agent: Arc<AgentSpec>,
    text: String,
    confidence: f64,
    quality: ResponseQuality,
    duration_ms: u64,
}

/// Combines multi-agent execution output into a single response with
/// quality, consensus, and conflict analysis.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    options: AggregatorOptions,
}

impl ResultAggregator {
    pub fn new(options: AggregatorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    pub fn aggregate(
        &self,
        execution: &MultiAgentExecutionResult,
        routing: &MultiAgentRoutingResult,
        query: &str,
    ) -> Result<AggregatedResponse, AggregatorError> {
        let started = Instant::now();

        let candidates = collect_candidates(execution, routing, query, self.options.min_confidence);
        if candidates.is_empty() {
            return Err(AggregatorError::NoSuccessfulResults);
        }

        let primary_idx = self.pick_primary(&candidates);
        let conflict_analysis = analyze_conflicts(&candidates);

        let mut supporting_indices: Vec<usize> =
            (0..candidates.len()).filter(|&i| i != primary_idx).collect();
        supporting_indices.sort_by(|&a, &b| {
            candidates[b]
                .quality
                .overall
                .partial_cmp(&candidates[a].quality.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        supporting_indices.truncate(self.options.max_alternatives);

        let primary = summarize(&candidates[primary_idx]);
        let supporting: Vec<ResponseSummary> = supporting_indices
            .iter()
            .map(|&i| summarize(&candidates[i]))
            .collect();
        let alternatives: Vec<Alternative> = supporting_indices
            .iter()
            .map(|&i| Alternative {
                agent: candidates[i].agent.name.clone(),
                excerpt: excerpt(&candidates[i].text),
            })
            .collect();

        let other_high_quality = supporting
            .iter()
            .filter(|s| s.quality.overall > 0.7)
            .count();
        let recommendation_strength = (0.4 * primary.confidence
            + 0.4 * primary.quality.overall
            + 0.05 * conflict_analysis.consensus.len() as f64
            - 0.1 * conflict_analysis.conflicts.len() as f64
            + 0.05 * other_high_quality as f64)
            .clamp(0.0, 1.0);

        let counts = execution.counts();
        let summary = compose_summary(&primary, &supporting, &conflict_analysis);
        debug!(
            primary = %primary.agent,
            supporting = supporting.len(),
            conflicts = conflict_analysis.conflicts.len(),
            "aggregated multi-agent results"
        );

        let processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(AggregatedResponse {
            confidence: primary.confidence,
            primary,
            supporting,
            summary,
            alternatives,
            conflict_analysis,
            performance: PerformanceMetrics {
                total_agents: counts.total,
                successful_agents: counts.successful,
                total_execution_time_ms: execution.total_duration.as_millis() as u64,
                aggregation_overhead_ms: processing_time_ms,
            },
            recommendation_strength,
            metadata: AggregationMetadata {
                strategy: self.options.strategy,
                timestamp: Utc::now(),
                query: query.to_string(),
                processing_time_ms,
            },
        })
    }

    fn pick_primary(&self, candidates: &[Candidate]) -> usize {
        match self.options.strategy {
            ConsensusStrategy::HighestConfidence => max_by_f64(candidates, |c| c.confidence),
            ConsensusStrategy::FastestSuccess => {
                max_by_f64(candidates, |c| -(c.duration_ms as f64))
            }
            ConsensusStrategy::ExpertPriority => {
                let rank = |c: &Candidate| {
                    self.options
                        .expert_priorities
                        .get(&c.agent.name)
                        .copied()
                        .unwrap_or(u32::MAX)
                };
                let best_rank = candidates.iter().map(|c| rank(c)).min().unwrap_or(u32::MAX);
                let tied: Vec<usize> = (0..candidates.len())
                    .filter(|&i| rank(&candidates[i]) == best_rank)
                    .collect();
                tied.into_iter()
                    .max_by(|&a, &b| {
                        candidates[a]
                            .quality
                            .overall
                            .partial_cmp(&candidates[b].quality.overall)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0)
            }
            ConsensusStrategy::MajorityConsensus => {
                let top = candidates
                    .iter()
                    .map(|c| c.confidence)
                    .fold(0.0_f64, f64::max);
                let threshold = top * 0.8;
                let eligible: Vec<usize> = (0..candidates.len())
                    .filter(|&i| candidates[i].confidence >= threshold)
                    .collect();
                eligible
                    .into_iter()
                    .max_by(|&a, &b| {
                        candidates[a]
                            .quality
                            .overall
                            .partial_cmp(&candidates[b].quality.overall)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0)
            }
            ConsensusStrategy::IntelligentMerge => {
                let max_duration = candidates
                    .iter()
                    .map(|c| c.duration_ms)
                    .max()
                    .unwrap_or(1)
                    .max(1) as f64;
                let w = self.options.weights;
                max_by_f64(candidates, |c| {
                    let speed = 1.0 - c.duration_ms as f64 / max_duration;
                    w.confidence * c.confidence
                        + w.speed * speed
                        + w.expertise * expertise_score(&c.agent)
                        + w.quality * c.quality.overall
                })
            }
        }
    }
}

/// Minimal aggregate the executor synthesizes when asked to bypass the
/// full aggregation pass: highest-confidence success first, the rest as
/// supporting opinions, no conflict analysis.
pub(crate) fn minimal_aggregate(
    execution: &MultiAgentExecutionResult,
    routing: &MultiAgentRoutingResult,
    query: &str,
) -> Option<AggregatedResponse> {
    let candidates = collect_candidates(execution, routing, query, 0.0);
    if candidates.is_empty() {
        return None;
    }
    let primary_idx = max_by_f64(&candidates, |c| c.confidence);
    let primary = summarize(&candidates[primary_idx]);
    let supporting: Vec<ResponseSummary> = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary_idx)
        .map(|(_, c)| summarize(c))
        .collect();

    let counts = execution.counts();
    let recommendation_strength =
        (0.4 * primary.confidence + 0.4 * primary.quality.overall).clamp(0.0, 1.0);
    Some(AggregatedResponse {
        confidence: primary.confidence,
        summary: format!("{} answered; aggregation bypassed", primary.agent),
        alternatives: supporting
            .iter()
            .map(|s| Alternative {
                agent: s.agent.clone(),
                excerpt: excerpt(&s.content),
            })
            .collect(),
        primary,
        supporting,
        conflict_analysis: ConflictAnalysis::default(),
        performance: PerformanceMetrics {
            total_agents: counts.total,
            successful_agents: counts.successful,
            total_execution_time_ms: execution.total_duration.as_millis() as u64,
            aggregation_overhead_ms: 0,
        },
        recommendation_strength,
        metadata: AggregationMetadata {
            strategy: ConsensusStrategy::HighestConfidence,
            timestamp: Utc::now(),
            query: query.to_string(),
            processing_time_ms: 0,
        },
    })
}

fn collect_candidates(
    execution: &MultiAgentExecutionResult,
    routing: &MultiAgentRoutingResult,
    query: &str,
    min_confidence: f64,
) -> Vec<Candidate> {
    let matches: HashMap<&str, &AgentMatch> = routing
        .all_matches()
        .map(|m| (m.agent.name.as_str(), m))
        .collect();

    execution
        .all_results()
        .filter(|r| r.is_success())
        .filter_map(|result: &ExecutionResult| {
            let routed = matches.get(result.agent.as_str())?;
            let text = result.response_text().unwrap_or_default();
            if text.trim().is_empty() {
                return None;
            }
            let confidence = routed.confidence.value();
            if confidence < min_confidence {
                return None;
            }
            Some(Candidate {
                agent: routed.agent.clone(),
                quality: quality::evaluate(&text, query),
                text,
                confidence,
                duration_ms: result.duration_ms(),
            })
        })
        .collect()
}

fn summarize(candidate: &Candidate) -> ResponseSummary {
    ResponseSummary {
        agent: candidate.agent.name.clone(),
        confidence: candidate.confidence,
        content: candidate.text.clone(),
        quality: candidate.quality.clone(),
        execution_time_ms: candidate.duration_ms,
    }
}

/// Verbs that open an actionable recommendation; the first sentence led by
/// one of these is taken as the response's main approach.
const APPROACH_VERBS: &[&str] = &[
    "use", "create", "implement", "build", "define", "apply", "prefer", "choose", "adopt",
    "write", "extend",
];

/// Architecture vocabulary scanned for cross-agent agreement.
const CONSENSUS_TERMS: &[&str] = &[
    "function",
    "class",
    "module",
    "interface",
    "api",
    "component",
    "service",
    "database",
    "test",
    "pattern",
    "factory",
    "singleton",
    "async",
    "cache",
    "queue",
];

fn analyze_conflicts(candidates: &[Candidate]) -> ConflictAnalysis {
    let mut analysis = ConflictAnalysis::default();
    if candidates.is_empty() {
        return analysis;
    }

    let with_code: Vec<&Candidate> =
        candidates.iter().filter(|c| c.text.contains("```")).collect();
    if with_code.len() > 1 {
        analysis.has_code_conflicts = true;
        analysis.conflicts.push(format!(
            "{} agents returned competing code blocks",
            with_code.len()
        ));
    }

    let mut approaches: Vec<(String, &str)> = Vec::new();
    for candidate in candidates {
        if let Some(approach) = main_approach(&candidate.text) {
            approaches.push((approach, candidate.agent.name.as_str()));
        }
    }
    let mut unique: Vec<&str> = approaches.iter().map(|(a, _)| a.as_str()).collect();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() > 1 {
        analysis.has_approach_conflicts = true;
        analysis.conflicts.push(format!(
            "agents recommend different approaches: {}",
            approaches
                .iter()
                .map(|(approach, agent)| format!("{agent} ({approach})"))
                .collect::<Vec<_>>()
                .join(" vs ")
        ));
    }

    for term in CONSENSUS_TERMS {
        let supporters: Vec<String> = candidates
            .iter()
            .filter(|c| c.text.to_lowercase().contains(term))
            .map(|c| c.agent.name.clone())
            .collect();
        if supporters.len() >= 2 {
            analysis.consensus.push(ConsensusTheme {
                term: (*term).to_string(),
                agents: supporters,
            });
        }
    }

    analysis.has_conflicts = analysis.has_code_conflicts || analysis.has_approach_conflicts;
    analysis
}

/// First sentence that opens with a recommendation verb, normalized to its
/// first few words.
fn main_approach(text: &str) -> Option<String> {
    for sentence in text.split(['.', '!', '?', '\n']) {
        let sentence = sentence.trim().trim_start_matches(['-', '*', '#', ' ']);
        let lower = sentence.to_lowercase();
        let mut words = lower.split_whitespace();
        let first = words.next()?;
        if APPROACH_VERBS.contains(&first) {
            let phrase: Vec<&str> = std::iter::once(first).chain(words.take(5)).collect();
            return Some(phrase.join(" "));
        }
    }
    None
}

fn compose_summary(
    primary: &ResponseSummary,
    supporting: &[ResponseSummary],
    conflicts: &ConflictAnalysis,
) -> String {
    let mut summary = format!(
        "{} provided the primary answer (quality {:.2})",
        primary.agent, primary.quality.overall
    );
    if !supporting.is_empty() {
        summary.push_str(&format!(" with {} supporting response(s)", supporting.len()));
    }
    if conflicts.has_conflicts {
        summary.push_str("; agents disagree, see alternatives");
    } else if !conflicts.consensus.is_empty() {
        summary.push_str(&format!(
            "; consensus on {}",
            conflicts
                .consensus
                .iter()
                .map(|t| t.term.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    summary
}

fn excerpt(text: &str) -> String {
    const LIMIT: usize = 140;
    let trimmed = text.trim();
    if trimmed.chars().count() <= LIMIT {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(LIMIT).collect();
        format!("{cut}…")
    }
}

fn max_by_f64<T>(items: &[T], score: impl Fn(&T) -> f64) -> usize {
    let mut best = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (index, item) in items.iter().enumerate() {
        let value = score(item);
        if value > best_score {
            best = index;
            best_score = value;
        }
    }
    best
}

/// Expertise proxy from the breadth of an agent's declared surface.
fn expertise_score(agent: &AgentSpec) -> f64 {
    let tools = (agent.tools.len() as f64 / 10.0).min(1.0) * 0.3;
    let keywords = (agent.keywords.len() as f64 / 10.0).min(1.0) * 0.3;
    let examples = (agent.examples.len() as f64 / 5.0).min(1.0) * 0.2;
    let prompt = if agent.system_prompt.is_some() { 0.2 } else { 0.0 };
    tools + keywords + examples + prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::executor::ExecutionMetadata;
    use crate::executor::ExecutionStatus;
    use crate::executor::MultiExecutionOutcome;
    use crate::model::GenerateResponse;
    use crate::router::ExecutionStrategy;
    use crate::router::RouteConfidence;
    use pk_agents::AgentBuilder;
    use pk_agents::ModelProvider;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn agent(name: &str) -> Arc<AgentSpec> {
        Arc::new(
            AgentBuilder::new(name)
                .description(format!("The {name} agent for aggregator tests"))
                .keywords([name])
                .model("gemini-2.0-flash")
                .provider(ModelProvider::Gemini)
                .example("in", "out")
                .build()
                .unwrap(),
        )
    }

    fn success(agent_name: &str, text: &str, duration_ms: u64) -> ExecutionResult {
        ExecutionResult {
            agent: agent_name.to_string(),
            status: ExecutionStatus::Success,
            response: Some(GenerateResponse::from_text(text)),
            failure: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration: Duration::from_millis(duration_ms),
            metadata: ExecutionMetadata {
                overhead_ms: 0,
                breaker_state: BreakerState::Closed,
            },
        }
    }

    fn routing_for(matches: Vec<(Arc<AgentSpec>, RouteConfidence)>) -> MultiAgentRoutingResult {
        MultiAgentRoutingResult {
            primary: matches
                .into_iter()
                .map(|(agent, confidence)| AgentMatch {
                    confidence,
                    score: confidence.value(),
                    reason: String::new(),
                    agent,
                })
                .collect(),
            secondary: Vec::new(),
            strategy: ExecutionStrategy::Parallel,
            estimated_duration_ms: 0,
            analysis: crate::analysis::analyze("create a user"),
        }
    }

    fn execution_with(results: Vec<ExecutionResult>) -> MultiAgentExecutionResult {
        MultiAgentExecutionResult {
            primary_results: results,
            secondary_results: Vec::new(),
            outcome: MultiExecutionOutcome::Success,
            total_duration: Duration::from_millis(500),
            aggregated: None,
        }
    }

    #[test]
    fn errors_on_zero_successes() {
        let routing = routing_for(vec![(agent("a"), RouteConfidence::High)]);
        let execution = execution_with(Vec::new());
        let aggregator = ResultAggregator::default();
        assert!(matches!(
            aggregator.aggregate(&execution, &routing, "query"),
            Err(AggregatorError::NoSuccessfulResults)
        ));
    }

    #[test]
    fn conflicting_answers_surface_in_alternatives() {
        let routing = routing_for(vec![
            (agent("oop-advocate"), RouteConfidence::High),
            (agent("fp-advocate"), RouteConfidence::Medium),
        ]);
        let execution = execution_with(vec![
            success(
                "oop-advocate",
                "Use a class for the user model.\n```js\nclass User {}\n```",
                200,
            ),
            success(
                "fp-advocate",
                "Use factory functions to create users.\n```js\nconst makeUser = () => ({});\n```",
                300,
            ),
        ]);

        let aggregator = ResultAggregator::default();
        let response = aggregator
            .aggregate(&execution, &routing, "create a user")
            .unwrap();

        assert!(response.conflict_analysis.has_conflicts);
        assert!(response.conflict_analysis.has_code_conflicts);
        assert!(response.conflict_analysis.has_approach_conflicts);
        assert_eq!(response.supporting.len(), 1);
        assert_eq!(response.alternatives.len(), 1);
        let non_primary = if response.primary.agent == "oop-advocate" {
            "fp-advocate"
        } else {
            "oop-advocate"
        };
        assert_eq!(response.alternatives[0].agent, non_primary);
    }

    #[test]
    fn highest_confidence_strategy_picks_by_routing() {
        let routing = routing_for(vec![
            (agent("confident"), RouteConfidence::High),
            (agent("fast"), RouteConfidence::Low),
        ]);
        let execution = execution_with(vec![
            success("confident", "Implement the slow but confident answer here", 900),
            success("fast", "Implement the quick answer right here for you", 10),
        ]);

        let aggregator = ResultAggregator::new(AggregatorOptions {
            strategy: ConsensusStrategy::HighestConfidence,
            ..AggregatorOptions::default()
        });
        let response = aggregator.aggregate(&execution, &routing, "answer").unwrap();
        assert_eq!(response.primary.agent, "confident");
    }

    #[test]
    fn fastest_success_strategy_picks_by_duration() {
        let routing = routing_for(vec![
            (agent("confident"), RouteConfidence::High),
            (agent("fast"), RouteConfidence::Medium),
        ]);
        let execution = execution_with(vec![
            success("confident", "Implement the slow but confident answer here", 900),
            success("fast", "Implement the quick answer right here for you", 10),
        ]);

        let aggregator = ResultAggregator::new(AggregatorOptions {
            strategy: ConsensusStrategy::FastestSuccess,
            ..AggregatorOptions::default()
        });
        let response = aggregator.aggregate(&execution, &routing, "answer").unwrap();
        assert_eq!(response.primary.agent, "fast");
    }

    #[test]
    fn expert_priority_strategy_uses_caller_ranking() {
        let routing = routing_for(vec![
            (agent("generalist"), RouteConfidence::High),
            (agent("expert"), RouteConfidence::Low),
        ]);
        let execution = execution_with(vec![
            success("generalist", "Implement a serviceable generalist answer", 100),
            success("expert", "Implement the expert answer with specifics", 100),
        ]);

        let mut expert_priorities = HashMap::new();
        expert_priorities.insert("expert".to_string(), 1);
        expert_priorities.insert("generalist".to_string(), 10);
        let aggregator = ResultAggregator::new(AggregatorOptions {
            strategy: ConsensusStrategy::ExpertPriority,
            expert_priorities,
            ..AggregatorOptions::default()
        });
        let response = aggregator.aggregate(&execution, &routing, "answer").unwrap();
        assert_eq!(response.primary.agent, "expert");
    }

    #[test]
    fn low_confidence_successes_are_filtered() {
        let routing = routing_for(vec![
            (agent("strong"), RouteConfidence::High),
            (agent("weak"), RouteConfidence::None),
        ]);
        let execution = execution_with(vec![
            success("strong", "Implement the strong answer with detail", 100),
            success("weak", "Implement the weak answer nobody routed to", 100),
        ]);

        let aggregator = ResultAggregator::default();
        let response = aggregator.aggregate(&execution, &routing, "answer").unwrap();
        assert_eq!(response.primary.agent, "strong");
        assert!(response.supporting.is_empty());
    }

    #[test]
    fn consensus_terms_require_two_supporters() {
        let routing = routing_for(vec![
            (agent("a"), RouteConfidence::High),
            (agent("b"), RouteConfidence::High),
        ]);
        let execution = execution_with(vec![
            success("a", "Define a service behind an api with a cache layer", 100),
            success("b", "The api service should sit in front of a cache", 120),
        ]);

        let aggregator = ResultAggregator::default();
        let response = aggregator.aggregate(&execution, &routing, "design").unwrap();
        let terms: Vec<&str> = response
            .conflict_analysis
            .consensus
            .iter()
            .map(|t| t.term.as_str())
            .collect();
        assert!(terms.contains(&"api"));
        assert!(terms.contains(&"service"));
        assert!(terms.contains(&"cache"));
    }

    #[test]
    fn structured_output_round_trips() {
        let routing = routing_for(vec![(agent("solo"), RouteConfidence::High)]);
        let execution = execution_with(vec![success(
            "solo",
            "Implement the answer as a single module",
            100,
        )]);
        let aggregator = ResultAggregator::default();
        let response = aggregator.aggregate(&execution, &routing, "answer").unwrap();

        let structured = response.structured();
        assert_eq!(structured.version, "1.0");
        let json = serde_json::to_string(&structured).unwrap();
        assert!(json.contains("\"recommendationStrength\""));
        assert!(json.contains("\"executionTimeMs\""));
        let back: StructuredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(structured, back);
    }

    #[test]
    fn recommendation_strength_is_clamped() {
        let routing = routing_for(vec![(agent("solo"), RouteConfidence::Exact)]);
        let execution = execution_with(vec![success(
            "solo",
            "Implement everything precisely. Specifically, for example: \n\n- first step\n- second step",
            100,
        )]);
        let aggregator = ResultAggregator::default();
        let response = aggregator.aggregate(&execution, &routing, "implement").unwrap();
        assert!((0.0..=1.0).contains(&response.recommendation_strength));
    }
}
