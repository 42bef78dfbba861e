use crate::blackboard::Blackboard;
use crate::ctx::Ctx;
use std::time::Duration;

/// The result of running a stage: what the enclosing pipeline should do next.
pub type StepResult = Result<Outcome, StepError>;

/// A unit of work that reads and writes the shared [`Blackboard`].
///
/// Implement this trait on your own structs and register them into a
/// [`crate::Pipeline`]. A stage never sees the structure around it: the same
/// stage behaves identically whether it runs once, inside a loop, or from a
/// branch.
pub trait Stage: Send + 'static {
    /// A unique name for this stage. Pipeline nodes refer to stages by name,
    /// and every event the stage emits is authored under it.
    fn name(&self) -> &'static str;

    /// Run once against the blackboard. Progress is reported through
    /// [`Ctx::emit`]; the returned [`Outcome`] tells the runner whether to
    /// carry on or stop early.
    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult;
}

/// Control flow signal returned by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Carry on with the next node.
    Continue,
    /// Stop early. Inside a loop this ends the loop once the current pass
    /// finishes; anywhere else it stops the pipeline.
    Terminate,
}

/// Error type for stages, with variants designed around what the caller
/// can do about them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Bad input or stage logic error. Don't retry, fix the code.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Transient failure (network, rate limit). Retrying might help.
    #[error("transient: {0}")]
    Transient(String),
    /// Stage decided to fail explicitly.
    #[error("failed: {0}")]
    Failed(String),
    /// The stage ran past its deadline.
    #[error("timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { limit: Duration, elapsed: Duration },
    /// The run was cancelled before or while the stage ran.
    #[error("cancelled")]
    Cancelled,
    /// Everything else. Inspect the message for details.
    #[error("{0}")]
    Other(String),
}

impl From<ureq::Error> for StepError {
    fn from(e: ureq::Error) -> Self {
        StepError::Transient(e.to_string())
    }
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        StepError::Other(e.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::Invalid(e.to_string())
    }
}

impl StepError {
    /// Create an [`Invalid`](StepError::Invalid) error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        StepError::Invalid(msg.into())
    }

    /// Create an [`Other`](StepError::Other) error.
    pub fn other(msg: impl Into<String>) -> Self {
        StepError::Other(msg.into())
    }

    /// Create a [`Transient`](StepError::Transient) error.
    pub fn transient(msg: impl Into<String>) -> Self {
        StepError::Transient(msg.into())
    }

    /// Create a [`Failed`](StepError::Failed) error.
    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }

    /// Whether retrying the same stage might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- StepError constructors ---

    #[test]
    fn invalid_constructor() {
        let err = StepError::invalid("bad input");
        assert!(matches!(err, StepError::Invalid(msg) if msg == "bad input"));
    }

    #[test]
    fn other_constructor() {
        let err = StepError::other("something");
        assert!(matches!(err, StepError::Other(msg) if msg == "something"));
    }

    #[test]
    fn transient_constructor() {
        let err = StepError::transient("timeout");
        assert!(err.is_transient());
        assert!(matches!(err, StepError::Transient(msg) if msg == "timeout"));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(!StepError::failed("nope").is_transient());
        assert!(!StepError::Cancelled.is_transient());
    }

    // --- StepError Display ---

    #[test]
    fn display_invalid() {
        let err = StepError::Invalid("bad input".into());
        assert_eq!(err.to_string(), "invalid: bad input");
    }

    #[test]
    fn display_other() {
        let err = StepError::Other("something".into());
        assert_eq!(err.to_string(), "something");
    }

    #[test]
    fn display_failed() {
        let err = StepError::Failed("nope".into());
        assert_eq!(err.to_string(), "failed: nope");
    }

    #[test]
    fn display_timeout() {
        let err = StepError::Timeout {
            limit: Duration::from_millis(10),
            elapsed: Duration::from_millis(25),
        };
        assert_eq!(err.to_string(), "timed out after 25ms (limit 10ms)");
    }

    #[test]
    fn display_cancelled() {
        assert_eq!(StepError::Cancelled.to_string(), "cancelled");
    }

    // --- From conversions ---

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let step_err: StepError = io_err.into();
        assert!(matches!(step_err, StepError::Other(msg) if msg.contains("file missing")));
    }

    #[test]
    fn from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let step_err: StepError = json_err.into();
        assert!(matches!(step_err, StepError::Invalid(_)));
    }
}
