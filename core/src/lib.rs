//! Multi-agent orchestration core: query analysis and routing over a
//! registry of agent definitions, model-endpoint execution under timeout,
//! cancellation, and circuit-breaker control, and aggregation of the
//! results into one primary answer with ranked alternatives.

pub mod aggregator;
pub mod analysis;
pub mod breaker;
pub mod error;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod quality;
pub mod react;
pub mod router;

pub use aggregator::AggregatedResponse;
pub use aggregator::AggregatorOptions;
pub use aggregator::Alternative;
pub use aggregator::ConflictAnalysis;
pub use aggregator::ConsensusStrategy;
pub use aggregator::MergeWeights;
pub use aggregator::ResponseSummary;
pub use aggregator::ResultAggregator;
pub use aggregator::StructuredResponse;
pub use analysis::QueryAnalysis;
pub use analysis::QueryIntent;
pub use analysis::analyze;
pub use breaker::BreakerState;
pub use breaker::CircuitBreakerConfig;
pub use breaker::CircuitBreakerMap;
pub use error::AggregatorError;
pub use error::GeneratorError;
pub use error::ReactError;
pub use error::RouterError;
pub use executor::AgentExecutor;
pub use executor::ExecErrorCode;
pub use executor::ExecutionCounts;
pub use executor::ExecutionResult;
pub use executor::ExecutionStatus;
pub use executor::ExecutorOptions;
pub use executor::MultiAgentExecutionResult;
pub use executor::MultiExecutionOutcome;
pub use executor::ProgressUpdate;
pub use model::Candidate;
pub use model::Content;
pub use model::ContentGenerator;
pub use model::FunctionCall;
pub use model::GenerateRequest;
pub use model::GenerateResponse;
pub use model::GenerationConfig;
pub use model::GeneratorFactory;
pub use model::InlineData;
pub use model::Part;
pub use model::build_agent_request;
pub use orchestrator::OrchestrationMode;
pub use orchestrator::OrchestrationResult;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorOptions;
pub use quality::ResponseQuality;
pub use quality::evaluate;
pub use react::ReactAction;
pub use react::ReactAdapter;
pub use react::ReactOptions;
pub use react::ReactStep;
pub use react::parse_react_response;
pub use router::AgentMatch;
pub use router::ExecutionStrategy;
pub use router::MultiAgentRoutingResult;
pub use router::RouteConfidence;
pub use router::Router;
pub use router::RoutingResult;
