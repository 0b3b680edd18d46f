use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no agent matched the query and no fallback is configured")]
    NoAgent,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("model endpoint error: {0}")]
    Endpoint(String),
    #[error("model endpoint returned no candidates")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("no successful results to aggregate")]
    NoSuccessfulResults,
}

#[derive(Debug, Error)]
pub enum ReactError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}
