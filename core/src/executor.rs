use chrono::DateTime;
use chrono::Utc;
use pk_agents::AgentSpec;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::aggregator;
use crate::aggregator::AggregatedResponse;
use crate::breaker::BreakerDecision;
use crate::breaker::BreakerState;
use crate::breaker::CircuitBreakerConfig;
use crate::breaker::CircuitBreakerMap;
use crate::model::GeneratorFactory;
use crate::model::build_agent_request;
use crate::router::ExecutionStrategy;
use crate::router::MultiAgentRoutingResult;
use crate::router::RoutingResult;

const MIN_TIMEOUT: Duration = Duration::from_millis(5_000);
const MAX_TIMEOUT: Duration = Duration::from_millis(300_000);
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
const PRIORITIZED_PRIMARY_CAP: usize = 3;
const PRIORITIZED_SECONDARY_CAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecErrorCode {
    Timeout,
    TotalTimeout,
    Cancelled,
    CircuitBreakerOpen,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: ExecErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Observed duration minus the time the generator reports having spent
    /// itself; zero when the generator does not report one.
    pub overhead_ms: u64,
    /// Breaker state for this agent after the call was accounted for.
    pub breaker_state: BreakerState,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub agent: String,
    pub status: ExecutionStatus,
    pub response: Option<crate::model::GenerateResponse>,
    pub failure: Option<ExecutionFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn response_text(&self) -> Option<String> {
        self.response.as_ref().map(|r| r.text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiExecutionOutcome {
    /// Every agent succeeded.
    Success,
    /// At least one agent succeeded.
    Partial,
    /// No agent succeeded.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

#[derive(Debug)]
pub struct MultiAgentExecutionResult {
    /// Primary agent results, in routing order.
    pub primary_results: Vec<ExecutionResult>,
    /// Secondary agent results, in routing order.
    pub secondary_results: Vec<ExecutionResult>,
    pub outcome: MultiExecutionOutcome,
    pub total_duration: Duration,
    /// Present when the caller asked the executor to synthesize a minimal
    /// aggregate instead of running the full aggregator.
    pub aggregated: Option<AggregatedResponse>,
}

impl MultiAgentExecutionResult {
    pub fn all_results(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.primary_results.iter().chain(self.secondary_results.iter())
    }

    pub fn successes(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.all_results().filter(|r| r.is_success())
    }

    pub fn counts(&self) -> ExecutionCounts {
        let mut counts = ExecutionCounts::default();
        for result in self.all_results() {
            counts.total += 1;
            match result.status {
                ExecutionStatus::Success => counts.successful += 1,
                ExecutionStatus::Error => counts.failed += 1,
                ExecutionStatus::Timeout => counts.timed_out += 1,
                ExecutionStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// Progress update delivered once per completed agent, in completion order.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub agent: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ExecutorOptions {
    /// Per-agent timeout. Use [`ExecutorOptions::set_timeout_ms`] to apply
    /// the supported clamp.
    pub timeout: Duration,
    /// Budget for a whole multi-agent session; defaults to twice the
    /// per-agent timeout.
    pub total_timeout: Option<Duration>,
    pub max_concurrency: usize,
    /// Overrides the strategy default: parallel and prioritized runs keep
    /// going after failures, a sequential run for an explicit invocation
    /// stops at the first non-success.
    pub continue_on_error: Option<bool>,
    /// Ask the executor to synthesize a minimal aggregate when at least one
    /// agent succeeds.
    pub aggregate_results: bool,
    pub external_cancel: Option<CancellationToken>,
    /// Completion events, delivered over a bounded channel.
    pub progress: Option<mpsc::Sender<ProgressUpdate>>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            total_timeout: None,
            max_concurrency: 5,
            continue_on_error: None,
            aggregate_results: false,
            external_cancel: None,
            progress: None,
        }
    }
}

impl ExecutorOptions {
    /// Set the per-agent timeout, clamped to the supported range.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) -> &mut Self {
        self.timeout = Duration::from_millis(timeout_ms).clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Create the bounded progress channel; depth equals the concurrency
    /// cap so producers feel backpressure from a slow consumer.
    pub fn progress_channel(&mut self) -> mpsc::Receiver<ProgressUpdate> {
        let (tx, rx) = mpsc::channel(self.max_concurrency.max(1));
        self.progress = Some(tx);
        rx
    }

    fn effective_total_timeout(&self) -> Duration {
        self.total_timeout.unwrap_or(self.timeout * 2)
    }
}

impl std::fmt::Debug for ExecutorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("timeout", &self.timeout)
            .field("total_timeout", &self.total_timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .field("aggregate_results", &self.aggregate_results)
            .finish_non_exhaustive()
    }
}

enum CallVerdict {
    Finished(Result<crate::model::GenerateResponse, crate::error::GeneratorError>),
    TimedOut,
    TotalTimedOut,
    Cancelled,
}

/// Everything an in-flight agent task needs, cheap to clone into spawned
/// workers.
#[derive(Clone)]
struct ExecutorInner {
    factory: GeneratorFactory,
    breakers: Arc<CircuitBreakerMap>,
}

impl ExecutorInner {
    async fn run_agent(
        &self,
        agent: Arc<AgentSpec>,
        query: Arc<str>,
        timeout: Duration,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
        external: CancellationToken,
        total: CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        if self.breakers.check(&agent.name) == BreakerDecision::Reject {
            warn!(agent = %agent.name, "circuit open; skipping generator call");
            let result = self.finish(
                &agent,
                started_at,
                start,
                ExecutionStatus::Error,
                None,
                Some(ExecutionFailure {
                    code: ExecErrorCode::CircuitBreakerOpen,
                    message: format!("circuit breaker open for agent {}", agent.name),
                }),
                None,
            );
            send_progress(&progress, &result).await;
            return result;
        }

        let request = build_agent_request(&agent, &query);
        let generator = (self.factory)(&agent);
        let call_cancel = CancellationToken::new();
        let call = generator.generate_with_cancel(request, call_cancel.clone());
        tokio::pin!(call);

        // Cancellation sources are checked before the generator so an
        // already-cancelled session never spends model budget.
        let verdict = tokio::select! {
            biased;
            _ = external.cancelled() => {
                call_cancel.cancel();
                CallVerdict::Cancelled
            }
            _ = total.cancelled() => {
                call_cancel.cancel();
                CallVerdict::TotalTimedOut
            }
            _ = tokio::time::sleep(timeout) => {
                call_cancel.cancel();
                CallVerdict::TimedOut
            }
            result = &mut call => CallVerdict::Finished(result),
        };

        let result = match verdict {
            CallVerdict::Finished(Ok(response)) => {
                self.breakers.record_success(&agent.name);
                let generator_ms = response.execution_time_ms;
                self.finish(
                    &agent,
                    started_at,
                    start,
                    ExecutionStatus::Success,
                    Some(response),
                    None,
                    generator_ms,
                )
            }
            CallVerdict::Finished(Err(err)) => {
                self.breakers.record_failure(&agent.name, false);
                self.finish(
                    &agent,
                    started_at,
                    start,
                    ExecutionStatus::Error,
                    None,
                    Some(ExecutionFailure {
                        code: ExecErrorCode::ExecutionError,
                        message: err.to_string(),
                    }),
                    None,
                )
            }
            CallVerdict::TimedOut => {
                self.breakers.record_failure(&agent.name, true);
                self.finish(
                    &agent,
                    started_at,
                    start,
                    ExecutionStatus::Timeout,
                    None,
                    Some(ExecutionFailure {
                        code: ExecErrorCode::Timeout,
                        message: format!("agent timed out after {timeout:?}"),
                    }),
                    None,
                )
            }
            CallVerdict::TotalTimedOut => {
                self.breakers.record_failure(&agent.name, true);
                self.finish(
                    &agent,
                    started_at,
                    start,
                    ExecutionStatus::Timeout,
                    None,
                    Some(ExecutionFailure {
                        code: ExecErrorCode::TotalTimeout,
                        message: "session budget exhausted before the agent finished".to_string(),
                    }),
                    None,
                )
            }
            CallVerdict::Cancelled => {
                self.breakers.record_cancelled(&agent.name);
                self.finish(
                    &agent,
                    started_at,
                    start,
                    ExecutionStatus::Cancelled,
                    None,
                    Some(ExecutionFailure {
                        code: ExecErrorCode::Cancelled,
                        message: "execution cancelled by caller".to_string(),
                    }),
                    None,
                )
            }
        };

        send_progress(&progress, &result).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        agent: &AgentSpec,
        started_at: DateTime<Utc>,
        start: Instant,
        status: ExecutionStatus,
        response: Option<crate::model::GenerateResponse>,
        failure: Option<ExecutionFailure>,
        generator_ms: Option<u64>,
    ) -> ExecutionResult {
        let duration = start.elapsed();
        let overhead_ms = generator_ms
            .map(|ms| (duration.as_millis() as u64).saturating_sub(ms))
            .unwrap_or(0);
        debug!(agent = %agent.name, ?status, duration_ms = duration.as_millis() as u64, "agent finished");
        ExecutionResult {
            agent: agent.name.clone(),
            status,
            response,
            failure,
            started_at,
            finished_at: Utc::now(),
            duration,
            metadata: ExecutionMetadata {
                overhead_ms,
                breaker_state: self.breakers.state(&agent.name),
            },
        }
    }
}

async fn send_progress(progress: &Option<mpsc::Sender<ProgressUpdate>>, result: &ExecutionResult) {
    if let Some(tx) = progress {
        let _ = tx
            .send(ProgressUpdate {
                agent: result.agent.clone(),
                status: result.status,
                duration_ms: result.duration_ms(),
                timestamp: result.finished_at,
            })
            .await;
    }
}

/// Runs routed agents against their model endpoints under timeout,
/// cancellation, concurrency, and circuit-breaker control.
pub struct AgentExecutor {
    inner: ExecutorInner,
}

impl AgentExecutor {
    pub fn new(factory: GeneratorFactory) -> Self {
        Self::with_breaker_config(factory, CircuitBreakerConfig::default())
    }

    pub fn with_breaker_config(factory: GeneratorFactory, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: ExecutorInner {
                factory,
                breakers: Arc::new(CircuitBreakerMap::new(config)),
            },
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerMap {
        &self.inner.breakers
    }

    pub async fn execute_single(
        &self,
        routing: &RoutingResult,
        query: &str,
        opts: &ExecutorOptions,
    ) -> ExecutionResult {
        let query: Arc<str> = Arc::from(routing.analysis.effective_query(query));
        let external = opts.external_cancel.clone().unwrap_or_default();
        self.inner
            .run_agent(
                routing.selected.agent.clone(),
                query,
                opts.timeout,
                opts.progress.clone(),
                external,
                CancellationToken::new(),
            )
            .await
    }

    pub async fn execute_multi(
        &self,
        routing: &MultiAgentRoutingResult,
        query: &str,
        opts: &ExecutorOptions,
    ) -> MultiAgentExecutionResult {
        let start = Instant::now();
        let query: Arc<str> = Arc::from(routing.analysis.effective_query(query));
        let external = opts.external_cancel.clone().unwrap_or_default();

        // The total budget cancels stragglers; their results come back as
        // timeouts with the session-level code.
        let total = CancellationToken::new();
        let total_timer = {
            let total = total.clone();
            let budget = opts.effective_total_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                total.cancel();
            })
        };

        let primary_agents: Vec<Arc<AgentSpec>> =
            routing.primary.iter().map(|m| m.agent.clone()).collect();
        let secondary_agents: Vec<Arc<AgentSpec>> =
            routing.secondary.iter().map(|m| m.agent.clone()).collect();

        let explicit = routing.analysis.explicit_agent.is_some();
        let continue_on_error = opts.continue_on_error.unwrap_or(match routing.strategy {
            ExecutionStrategy::Sequential => !explicit,
            _ => true,
        });

        let (primary_results, secondary_results) = match routing.strategy {
            ExecutionStrategy::Sequential => {
                let all: Vec<Arc<AgentSpec>> = primary_agents
                    .iter()
                    .chain(secondary_agents.iter())
                    .cloned()
                    .collect();
                let mut results = self
                    .run_sequential(&all, &query, opts, continue_on_error, &external, &total)
                    .await;
                let split = results.len().min(primary_agents.len());
                let secondary = results.split_off(split);
                (results, secondary)
            }
            ExecutionStrategy::Parallel => {
                let all: Vec<Arc<AgentSpec>> = primary_agents
                    .iter()
                    .chain(secondary_agents.iter())
                    .cloned()
                    .collect();
                let mut results = self
                    .run_parallel(&all, &query, opts, opts.max_concurrency, &external, &total)
                    .await;
                let split = results.len().min(primary_agents.len());
                let secondary = results.split_off(split);
                (results, secondary)
            }
            ExecutionStrategy::Prioritized => {
                let cap = PRIORITIZED_PRIMARY_CAP.min(opts.max_concurrency.max(1));
                let primary_results = self
                    .run_parallel(&primary_agents, &query, opts, cap, &external, &total)
                    .await;

                // Supporting opinions are only worth model budget when a
                // main answer came back.
                let secondary_results = if primary_results.iter().any(ExecutionResult::is_success)
                {
                    let cap = PRIORITIZED_SECONDARY_CAP.min(opts.max_concurrency.max(1));
                    self.run_parallel(&secondary_agents, &query, opts, cap, &external, &total)
                        .await
                } else {
                    debug!("skipping secondary agents; no primary succeeded");
                    Vec::new()
                };
                (primary_results, secondary_results)
            }
        };

        total_timer.abort();

        let outcome = {
            let all = primary_results.iter().chain(secondary_results.iter());
            let successes = all.clone().filter(|r| r.is_success()).count();
            if successes == 0 {
                MultiExecutionOutcome::Failed
            } else if all.clone().count() == successes {
                MultiExecutionOutcome::Success
            } else {
                MultiExecutionOutcome::Partial
            }
        };

        let mut result = MultiAgentExecutionResult {
            primary_results,
            secondary_results,
            outcome,
            total_duration: start.elapsed(),
            aggregated: None,
        };

        if opts.aggregate_results && result.successes().next().is_some() {
            result.aggregated = aggregator::minimal_aggregate(&result, routing, &query);
        }

        result
    }

    async fn run_sequential(
        &self,
        agents: &[Arc<AgentSpec>],
        query: &Arc<str>,
        opts: &ExecutorOptions,
        continue_on_error: bool,
        external: &CancellationToken,
        total: &CancellationToken,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(agents.len());
        for agent in agents {
            let result = self
                .inner
                .run_agent(
                    agent.clone(),
                    query.clone(),
                    opts.timeout,
                    opts.progress.clone(),
                    external.clone(),
                    total.clone(),
                )
                .await;
            let stop = !continue_on_error && !result.is_success();
            results.push(result);
            if stop {
                debug!("sequential run stopped at first non-success");
                break;
            }
        }
        results
    }

    /// Worker-pool execution: tasks dispatch as permits free up, complete
    /// in arbitrary order, and are reported back in input order.
    async fn run_parallel(
        &self,
        agents: &[Arc<AgentSpec>],
        query: &Arc<str>,
        opts: &ExecutorOptions,
        cap: usize,
        external: &CancellationToken,
        total: &CancellationToken,
    ) -> Vec<ExecutionResult> {
        if agents.is_empty() {
            return Vec::new();
        }
        let semaphore = Arc::new(Semaphore::new(cap.max(1)));
        let mut handles = Vec::with_capacity(agents.len());

        for (index, agent) in agents.iter().enumerate() {
            let inner = self.inner.clone();
            let semaphore = semaphore.clone();
            let agent = agent.clone();
            let query = query.clone();
            let timeout = opts.timeout;
            let progress = opts.progress.clone();
            let external = external.clone();
            let total = total.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = inner
                    .run_agent(agent, query, timeout, progress, external, total)
                    .await;
                (index, result)
            }));
        }

        let mut indexed: Vec<(usize, ExecutionResult)> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flatten()
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor").finish_non_exhaustive()
    }
}
