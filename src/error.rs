//! Error types shared by the invoker, retry policy and walker

use std::time::Duration;
use thiserror::Error;

/// Categories of errors a step can fail with
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // Not retryable - the input itself is wrong
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("authorization error: {message}")]
    Authorization { message: String },

    // Retryable - transient failures
    #[error("execution error: {message}")]
    Execution { message: String },

    #[error("timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl ErrorKind {
    /// Returns true if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Execution { .. } | ErrorKind::Timeout { .. }
        )
    }

    /// Stable machine-readable code, stored in the error ledger
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation { .. } => "VALIDATION_ERROR",
            ErrorKind::Authorization { .. } => "AUTHORIZATION_ERROR",
            ErrorKind::Execution { .. } => "EXECUTION_ERROR",
            ErrorKind::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }
}

/// Full error context for a failed step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub step: Option<String>,

    // Retry state
    pub attempt: u32,
    pub max_attempts: u32,

    /// Underlying cause chain, outermost first
    pub causes: Vec<String>,
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step {
            Some(ref step) => write!(f, "step '{}' failed: {}", step, self.kind)?,
            None => write!(f, "{}", self.kind)?,
        }
        if self.max_attempts > 1 {
            write!(f, " [attempt {}/{}]", self.attempt, self.max_attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl StepError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            step: None,
            attempt: 1,
            max_attempts: 1,
            causes: Vec::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation {
            message: message.into(),
        })
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization {
            message: message.into(),
        })
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution {
            message: message.into(),
        })
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(ErrorKind::Timeout { elapsed })
    }

    /// Wrap any error as an execution failure, keeping its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            causes,
            ..Self::execution(err.to_string())
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The bare message, without step or attempt decoration
    pub fn message(&self) -> String {
        match &self.kind {
            ErrorKind::Validation { message }
            | ErrorKind::Authorization { message }
            | ErrorKind::Execution { message } => message.clone(),
            ErrorKind::Timeout { .. } => self.kind.to_string(),
        }
    }

    /// Cause chain joined for the error ledger
    pub fn stack(&self) -> Option<String> {
        if self.causes.is_empty() {
            None
        } else {
            Some(self.causes.join("\ncaused by: "))
        }
    }
}
