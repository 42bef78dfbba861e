use crate::event::Event;
use crate::stage::StepError;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the caller and a run.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Execution context handed to a stage for one invocation.
///
/// Collects the events the stage emits and exposes the run's cancellation
/// token and the invocation deadline, if any.
pub struct Ctx {
    stage: &'static str,
    events: Vec<Event>,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl Ctx {
    pub fn new() -> Self {
        Self::with_cancel_token(CancelToken::new())
    }

    pub fn with_cancel_token(cancel: CancelToken) -> Self {
        Self {
            stage: "",
            events: vec![],
            cancel,
            deadline: None,
        }
    }

    /// Name of the stage currently running.
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Emit a progress event authored by the current stage.
    pub fn emit(&mut self, payload: impl Into<Value>) {
        self.events.push(Event::new(self.stage, payload));
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with [`StepError::Cancelled`] if the run was cancelled.
    /// Call this around external work.
    pub fn check_cancelled(&self) -> Result<(), StepError> {
        if self.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn begin(&mut self, stage: &'static str, deadline: Option<Instant>) {
        self.stage = stage;
        self.deadline = deadline;
        self.events.clear();
    }

    /// Drop events emitted after the first `len`.
    pub(crate) fn truncate_events(&mut self, len: usize) {
        self.events.truncate(len);
    }

    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}
