use thiserror::Error;

/// Errors raised while loading, configuring, or running a fit.
///
/// Every message names the step or operation that failed and the condition
/// that was violated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitterError {
    /// A required input is missing or insufficient, e.g. a named group that
    /// does not exist or fewer than three marker correspondences.
    #[error("Precondition error: {0}")]
    Precondition(String),

    /// The optimizer did not succeed. Coordinate updates already committed
    /// by the failing step are not rolled back.
    #[error("Solver error: {0}")]
    Solver(String),

    /// No valid nearest mesh location could be found for an active point.
    #[error("Projection error: {0}")]
    Projection(String),

    /// Wrong dimensionality, negative weights, malformed settings.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type FitResult<T> = Result<T, FitterError>;
