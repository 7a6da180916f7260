use thiserror::Error;

pub type SweepResult<T> = Result<T, SweepError>;

/// Failures raised while expanding a sweep or driving the project lifecycle.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("too few values for {name}: needed {needed}, list has {found}")]
    InsufficientValues {
        name: String,
        needed: usize,
        found: usize,
    },

    #[error("unresolved reference '{{{reference}}}' in template \"{template}\"")]
    UnresolvedReference { reference: String, template: String },

    #[error("bad condition \"{expression}\": {reason}")]
    BadCondition { expression: String, reason: String },

    #[error("unknown scheduler '{name}' (known: {})", .known.join(", "))]
    UnknownScheduler { name: String, known: Vec<String> },

    #[error("'{command}' not allowed in current state ({state})")]
    TransitionNotAllowed { command: String, state: String },

    #[error("external command failed: {command} ({status})")]
    ExternalProcess { command: String, status: String },

    #[error("invalid sweep for {name}: {reason}")]
    InvalidSweep { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    /// Stable machine-readable name, used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::InsufficientValues { .. } => "insufficient_values",
            SweepError::UnresolvedReference { .. } => "unresolved_reference",
            SweepError::BadCondition { .. } => "bad_condition",
            SweepError::UnknownScheduler { .. } => "unknown_scheduler",
            SweepError::TransitionNotAllowed { .. } => "transition_not_allowed",
            SweepError::ExternalProcess { .. } => "external_process",
            SweepError::InvalidSweep { .. } => "invalid_sweep",
            SweepError::InvalidConfig(_) => "invalid_config",
            SweepError::Io(_) => "io",
            SweepError::Json(_) => "json",
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        SweepError::InvalidConfig(message.into())
    }
}
