use thiserror::Error;

use crate::executor::ExecutionResult;

/// Deepest nesting level a macro may run at; the top-level macro is depth 0.
pub const MAX_DEPTH: usize = 5;

/// Errors surfaced by the macro engine and schedule store.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No macro with this key in the catalog.
    #[error("Unknown macro: {0}")]
    UnknownMacro(String),

    /// Step `type` the engine does not know how to run.
    #[error("Unknown step type: {0}")]
    UnknownStep(String),

    /// Nested macros went deeper than [`MAX_DEPTH`].
    #[error("Max nesting depth (5) exceeded at macro {0}")]
    RecursionLimitExceeded(String),

    /// A step failed and its policy aborted the macro.
    #[error("{0}")]
    StepFailed(String),

    /// No schedule with this id.
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(u64),

    /// Schedule fields failed validation (bad `HH:MM`, bad weekday, ...).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A nested macro failed structurally after the outer run had started.
    /// `result` is the outer run's report: steps completed, failing path.
    #[error("{cause}")]
    Aborted {
        /// The structural error underneath.
        cause: Box<GatewayError>,
        /// Report of the run it ended.
        result: Box<ExecutionResult>,
    },

    /// Backing KV store failed.
    #[error("store: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl GatewayError {
    /// Structural errors end the whole invocation; no `on_fail` policy applies.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::UnknownMacro(_) | Self::RecursionLimitExceeded(_) | Self::Aborted { .. })
    }

    /// The error with any [`GatewayError::Aborted`] wrapper peeled off.
    pub fn root_cause(&self) -> &GatewayError {
        match self {
            Self::Aborted { cause, .. } => cause.root_cause(),
            e => e,
        }
    }

    /// Report of the run this error ended, when steps had already started.
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Aborted { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }

    fn into_cause(self) -> GatewayError {
        match self {
            Self::Aborted { cause, .. } => (*cause).into_cause(),
            e => e,
        }
    }

    /// Wrap `self` around the report of the outer run it ended.
    pub(crate) fn abort_with(self, result: ExecutionResult) -> GatewayError {
        Self::Aborted { cause: Box::new(self.into_cause()), result: Box::new(result) }
    }
}
