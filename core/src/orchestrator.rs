use pk_agents::AgentRegistry;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::aggregator::AggregatedResponse;
use crate::aggregator::AggregatorOptions;
use crate::aggregator::Alternative;
use crate::aggregator::ResultAggregator;
use crate::analysis;
use crate::error::AggregatorError;
use crate::executor::AgentExecutor;
use crate::executor::ExecutionCounts;
use crate::executor::ExecutionStatus;
use crate::executor::ExecutorOptions;
use crate::model::GeneratorFactory;
use crate::router::ExecutionStrategy;
use crate::router::Router;
use crate::router::RoutingResult;

/// Total processing time the core itself may add around routing,
/// execution, and aggregation.
const OVERHEAD_BUDGET_MS: u64 = 400;

/// Phrases that always warrant more than one opinion.
const MULTI_AGENT_CUES: &[&str] = &[
    "compare",
    "alternatives",
    "different approaches",
    "pros and cons",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestrationMode {
    Auto,
    SingleAgent,
    MultiAgent,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub mode: Option<OrchestrationMode>,
    /// Upper bound on agents selected in multi-agent mode.
    pub max_agents: Option<usize>,
    /// Wall-clock budget for the whole request; exceeding it is reported
    /// as a warning, not an error.
    pub max_execution_time: Option<Duration>,
    pub executor: ExecutorOptions,
    pub aggregator: AggregatorOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSummary {
    pub agents: Vec<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExecutionStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalResponse {
    pub text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<Alternative>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub routing_ms: u64,
    pub execution_ms: u64,
    pub aggregation_ms: u64,
    /// Core-added time: total minus the three phases above.
    pub overhead_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationMetadata {
    pub successful_agents: usize,
    pub failed_agents: usize,
    pub aggregated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_strength: Option<f64>,
}

/// The orchestrator's answer for one request. Always well-formed: total
/// failure yields empty routing, zero counts, and the error as the
/// response body.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub id: Uuid,
    pub query: String,
    /// The mode actually used after AUTO resolution.
    pub mode: OrchestrationMode,
    pub routing: RoutingSummary,
    pub execution: ExecutionCounts,
    pub response: FinalResponse,
    pub timings: TimingBreakdown,
    pub metadata: OrchestrationMetadata,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Thin façade composing router, executor, and aggregator.
pub struct Orchestrator {
    router: Router,
    executor: AgentExecutor,
}

impl Orchestrator {
    /// Build an orchestrator over a populated registry. The fallback agent
    /// is resolved here: the first agent advertising general assistance,
    /// else the first registered one.
    pub async fn new(registry: Arc<AgentRegistry>, factory: GeneratorFactory) -> Self {
        let fallback = resolve_fallback(&registry).await;
        if let Some(name) = fallback.as_deref() {
            info!(fallback = name, "orchestrator fallback agent resolved");
        }
        Self {
            router: Router::new(registry).with_fallback(fallback),
            executor: AgentExecutor::new(factory),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    pub async fn process(&self, query: &str, opts: &OrchestratorOptions) -> OrchestrationResult {
        let total_start = Instant::now();
        let id = Uuid::new_v4();

        let mode = match opts.mode.unwrap_or(OrchestrationMode::Auto) {
            OrchestrationMode::Auto => select_mode(query),
            explicit => explicit,
        };
        info!(%id, ?mode, "processing query");

        let mut result = match mode {
            OrchestrationMode::MultiAgent => self.process_multi(query, opts).await,
            _ => self.process_single(query, opts).await,
        };

        result.id = id;
        result.mode = mode;
        result.query = query.to_string();
        finish_timings(&mut result, total_start);

        if let Some(budget) = opts.max_execution_time {
            let budget_ms = budget.as_millis() as u64;
            if result.timings.total_ms > budget_ms {
                result.warnings.push(format!(
                    "total processing took {} ms, over the {budget_ms} ms budget",
                    result.timings.total_ms
                ));
            }
        }
        if result.timings.overhead_ms > OVERHEAD_BUDGET_MS {
            result.warnings.push(format!(
                "core overhead was {} ms, over the {OVERHEAD_BUDGET_MS} ms budget",
                result.timings.overhead_ms
            ));
        }
        for warning in &result.warnings {
            warn!(%id, warning, "performance budget exceeded");
        }

        result
    }

    async fn process_single(&self, query: &str, opts: &OrchestratorOptions) -> OrchestrationResult {
        let routing_start = Instant::now();
        let routing = match self.router.route_single(query).await {
            Ok(routing) => routing,
            Err(err) => return failure_result(query, &err.to_string()),
        };
        let routing_ms = routing_start.elapsed().as_millis() as u64;

        let execution_start = Instant::now();
        let exec = self
            .executor
            .execute_single(&routing, query, &opts.executor)
            .await;
        let execution_ms = execution_start.elapsed().as_millis() as u64;

        let mut counts = ExecutionCounts {
            total: 1,
            ..ExecutionCounts::default()
        };
        match exec.status {
            ExecutionStatus::Success => counts.successful = 1,
            ExecutionStatus::Error => counts.failed = 1,
            ExecutionStatus::Timeout => counts.timed_out = 1,
            ExecutionStatus::Cancelled => counts.cancelled = 1,
        }

        let (response, error) = if exec.is_success() {
            (
                FinalResponse {
                    text: exec.response_text().unwrap_or_default(),
                    confidence: routing.selected.confidence.value(),
                    alternatives: single_alternatives(&routing),
                    summary: None,
                },
                None,
            )
        } else {
            let message = exec
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "agent execution failed".to_string());
            (
                FinalResponse {
                    text: format!("The selected agent could not answer: {message}"),
                    confidence: 0.0,
                    alternatives: single_alternatives(&routing),
                    summary: None,
                },
                Some(message),
            )
        };

        OrchestrationResult {
            id: Uuid::nil(),
            query: String::new(),
            mode: OrchestrationMode::SingleAgent,
            routing: RoutingSummary {
                agents: vec![routing.selected.agent.name.clone()],
                confidence: routing.selected.confidence.value(),
                strategy: None,
            },
            execution: counts,
            response,
            timings: TimingBreakdown {
                routing_ms,
                execution_ms,
                aggregation_ms: 0,
                overhead_ms: 0,
                total_ms: 0,
            },
            metadata: OrchestrationMetadata {
                successful_agents: counts.successful,
                failed_agents: counts.failed + counts.timed_out + counts.cancelled,
                aggregated: false,
                recommendation_strength: None,
            },
            warnings: Vec::new(),
            error,
        }
    }

    async fn process_multi(&self, query: &str, opts: &OrchestratorOptions) -> OrchestrationResult {
        let routing_start = Instant::now();
        let routing = match self.router.route_multi(query, opts.max_agents.unwrap_or(3)).await {
            Ok(routing) => routing,
            Err(err) => return failure_result(query, &err.to_string()),
        };
        let routing_ms = routing_start.elapsed().as_millis() as u64;

        let execution_start = Instant::now();
        let exec = self
            .executor
            .execute_multi(&routing, query, &opts.executor)
            .await;
        let execution_ms = execution_start.elapsed().as_millis() as u64;
        let counts = exec.counts();

        let aggregation_start = Instant::now();
        let aggregated = ResultAggregator::new(opts.aggregator.clone())
            .aggregate(&exec, &routing, query);
        let aggregation_ms = aggregation_start.elapsed().as_millis() as u64;

        let routing_summary = RoutingSummary {
            agents: routing.all_matches().map(|m| m.agent.name.clone()).collect(),
            confidence: routing
                .primary
                .first()
                .map(|m| m.confidence.value())
                .unwrap_or(0.0),
            strategy: Some(routing.strategy),
        };

        let (response, metadata, error) = match aggregated {
            Ok(aggregated) => build_multi_response(&aggregated, &counts),
            Err(AggregatorError::NoSuccessfulResults) => (
                FinalResponse {
                    text: "No agent produced a usable answer for this query.".to_string(),
                    confidence: 0.0,
                    alternatives: Vec::new(),
                    summary: None,
                },
                OrchestrationMetadata {
                    successful_agents: counts.successful,
                    failed_agents: counts.failed + counts.timed_out + counts.cancelled,
                    aggregated: false,
                    recommendation_strength: None,
                },
                Some(AggregatorError::NoSuccessfulResults.to_string()),
            ),
        };

        OrchestrationResult {
            id: Uuid::nil(),
            query: String::new(),
            mode: OrchestrationMode::MultiAgent,
            routing: routing_summary,
            execution: counts,
            response,
            timings: TimingBreakdown {
                routing_ms,
                execution_ms,
                aggregation_ms,
                overhead_ms: 0,
                total_ms: 0,
            },
            metadata,
            warnings: Vec::new(),
            error,
        }
    }
}

fn build_multi_response(
    aggregated: &AggregatedResponse,
    counts: &ExecutionCounts,
) -> (FinalResponse, OrchestrationMetadata, Option<String>) {
    (
        FinalResponse {
            text: aggregated.primary.content.clone(),
            confidence: aggregated.confidence,
            alternatives: aggregated.alternatives.clone(),
            summary: Some(aggregated.summary.clone()),
        },
        OrchestrationMetadata {
            successful_agents: counts.successful,
            failed_agents: counts.failed + counts.timed_out + counts.cancelled,
            aggregated: true,
            recommendation_strength: Some(aggregated.recommendation_strength),
        },
        None,
    )
}

fn single_alternatives(routing: &RoutingResult) -> Vec<Alternative> {
    routing
        .alternatives
        .iter()
        .map(|m| Alternative {
            agent: m.agent.name.clone(),
            excerpt: m.reason.clone(),
        })
        .collect()
}

/// A well-formed result for a request that failed before execution.
fn failure_result(query: &str, message: &str) -> OrchestrationResult {
    OrchestrationResult {
        id: Uuid::nil(),
        query: query.to_string(),
        mode: OrchestrationMode::SingleAgent,
        routing: RoutingSummary::default(),
        execution: ExecutionCounts::default(),
        response: FinalResponse {
            text: format!("Unable to process the query: {message}"),
            confidence: 0.0,
            alternatives: Vec::new(),
            summary: None,
        },
        timings: TimingBreakdown::default(),
        metadata: OrchestrationMetadata::default(),
        warnings: Vec::new(),
        error: Some(message.to_string()),
    }
}

fn finish_timings(result: &mut OrchestrationResult, total_start: Instant) {
    let total_ms = total_start.elapsed().as_millis() as u64;
    let accounted = result.timings.routing_ms
        + result.timings.execution_ms
        + result.timings.aggregation_ms;
    result.timings.total_ms = total_ms;
    result.timings.overhead_ms = total_ms.saturating_sub(accounted);
}

/// AUTO mode selection: explicit comparison cues force multi-agent; a
/// complexity signal over the query decides otherwise.
fn select_mode(query: &str) -> OrchestrationMode {
    let lower = query.to_lowercase();
    if MULTI_AGENT_CUES.iter().any(|cue| lower.contains(cue)) {
        return OrchestrationMode::MultiAgent;
    }

    let technologies = analysis::detect_technologies(&lower).len();
    let markers = analysis::complex_marker_count(&lower);
    let length_points = match lower.len() {
        0..=80 => 0,
        81..=150 => 1,
        151..=300 => 2,
        _ => 3,
    };
    let questions = lower.matches('?').count();
    let score = length_points + questions + analysis::connective_count(&lower) + markers + technologies;

    if score > 7 || (technologies >= 3 && markers >= 3) {
        OrchestrationMode::MultiAgent
    } else {
        OrchestrationMode::SingleAgent
    }
}

async fn resolve_fallback(registry: &AgentRegistry) -> Option<String> {
    let agents = registry.list().await;
    agents
        .iter()
        .find(|agent| {
            agent.keywords.iter().any(|keyword| {
                let keyword = keyword.to_lowercase();
                keyword.contains("general")
                    || keyword.contains("assistant")
                    || keyword.contains("help")
            })
        })
        .or_else(|| agents.first())
        .map(|agent| agent.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_queries_stay_single_agent() {
        assert_eq!(select_mode("fix this bug"), OrchestrationMode::SingleAgent);
    }

    #[test]
    fn comparison_cues_force_multi_agent() {
        assert_eq!(
            select_mode("compare redux and zustand for state management"),
            OrchestrationMode::MultiAgent
        );
        assert_eq!(
            select_mode("what are the pros and cons of sqlite here"),
            OrchestrationMode::MultiAgent
        );
    }

    #[test]
    fn dense_technical_queries_go_multi_agent() {
        let query = "design a distributed microservices architecture in rust with kafka, \
                     postgres, and redis, then optimize performance and add integration \
                     coverage across the react and typescript frontend services?";
        assert_eq!(select_mode(query), OrchestrationMode::MultiAgent);
    }
}
