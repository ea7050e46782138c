//! Engine error types.

use thiserror::Error;

/// Failure to evaluate a submission before any user code ran.
///
/// No engine state is mutated when one of these is returned.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The submission could not be parsed.
    #[error("Invalid syntax. {0}")]
    Syntax(String),
    /// A sigil invocation named an unregistered extension.
    #[error("Invalid syntax. Unknown identifier '{0}'")]
    UnknownExtension(String),
    /// Aggregated compiler diagnostics.
    #[error("{0}")]
    Compilation(String),
    /// A dependency reference could not be resolved.
    #[error("{0}")]
    Dependency(String),
}

/// Error surfaced out of [`crate::Evaluator::evaluate`].
#[derive(Debug, Error)]
pub enum EvalError {
    /// Pre-execution failure; state untouched.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    /// A tracked variable's declared type changed across submissions.
    ///
    /// Warning-class: the submission was aborted before any code ran,
    /// the offending variables were dropped from tracked state, and the
    /// diagnostic was already written to the evaluation stderr.
    #[error("stale tracked state: {}", variables.join(", "))]
    StaleState { variables: Vec<String> },
    /// Failure raised by the submitted code itself while running.
    #[error("{0}")]
    Execution(String),
}
