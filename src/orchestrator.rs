use crate::blackboard::Blackboard;
use crate::ctx::{CancelToken, Ctx};
use crate::event::Event;
use crate::pipeline::Pipeline;
use crate::stage::{Outcome, StepError};
use crate::walker::{Advance, Ending, Walker};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info};

/// Passed to the `on_step` hook after each successful stage invocation.
pub struct StepEvent<'a> {
    pub stage: &'a str,
    pub outcome: Outcome,
    pub duration: Duration,
    pub step_number: usize,
    /// Pass of the innermost enclosing loop, 1-based. `None` outside loops.
    pub iteration: Option<usize>,
    /// Number of events the stage emitted.
    pub events: usize,
}

/// Passed to the `on_error` hook when a stage fails, times out or is
/// cancelled.
pub struct ErrorEvent<'a> {
    pub stage: &'a str,
    pub error: &'a StepError,
    pub step_number: usize,
}

/// The stage that aborted a run and why.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: String,
    pub cause: StepError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Failed(StageFailure),
    /// A stage outside any loop asked to stop while nodes were still pending.
    Terminated { stage: String },
}

/// Lifecycle of an [`Orchestrator`]: `Idle → Running → Completed | Aborted`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Aborted(AbortReason),
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted(_))
    }
}

/// Final (or current) state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub status: RunStatus,
    pub values: Blackboard,
}

impl Snapshot {
    /// The failure marker, when a stage aborted the run.
    pub fn failure(&self) -> Option<&StageFailure> {
        match &self.status {
            RunStatus::Aborted(AbortReason::Failed(failure)) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("orchestrator for pipeline '{0}' has already been started")]
    AlreadyStarted(&'static str),
}

/// Drives one run of a [`Pipeline`] against its own blackboard.
///
/// An orchestrator executes exactly one run; build a fresh one to run the
/// pipeline again.
pub struct Orchestrator {
    pipeline: Pipeline,
    board: Blackboard,
    status: RunStatus,
    cancel: CancelToken,
    default_deadline: Option<Duration>,
    on_step: Option<Box<dyn FnMut(&StepEvent)>>,
    on_error: Option<Box<dyn FnMut(&ErrorEvent)>>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            board: Blackboard::new(),
            status: RunStatus::Idle,
            cancel: CancelToken::new(),
            default_deadline: None,
            on_step: None,
            on_error: None,
        }
    }

    /// Use `token` to cancel the run from outside. Checked before every
    /// stage dispatch and visible to stages through [`Ctx`].
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Deadline for every stage node that does not set its own.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Register a callback that fires after each successful stage.
    pub fn on_step(mut self, cb: impl FnMut(&StepEvent) + 'static) -> Self {
        self.on_step = Some(Box::new(cb));
        self
    }

    /// Register a callback that fires when a stage fails.
    pub fn on_error(mut self, cb: impl FnMut(&ErrorEvent) + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    /// Set both hooks to log step transitions and errors through `tracing`.
    pub fn with_tracing(self) -> Self {
        self.on_step(|e| {
            info!(
                "[step {}] {} -> {:?} ({:.3}s)",
                e.step_number,
                e.stage,
                e.outcome,
                e.duration.as_secs_f64()
            );
        })
        .on_error(|e| {
            error!("[error] {} at step {}: {}", e.stage, e.step_number, e.error);
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.board
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.status.clone(),
            values: self.board.clone(),
        }
    }

    /// Start the run. The blackboard is seeded with a copy of `initial`.
    /// Events are produced lazily as the returned iterator is consumed.
    pub fn run(&mut self, initial: &Blackboard) -> Result<Run<'_>, RunError> {
        if self.status != RunStatus::Idle {
            return Err(RunError::AlreadyStarted(self.pipeline.name()));
        }

        info!(pipeline = self.pipeline.name(), keys = initial.len(), "starting run");
        self.board = initial.clone();
        self.status = RunStatus::Running;

        Ok(Run {
            walker: Walker::new(self.pipeline.plan.root()),
            ctx: Ctx::with_cancel_token(self.cancel.clone()),
            pending: VecDeque::new(),
            step_number: 0,
            orchestrator: self,
        })
    }
}

/// A run in progress: a single-pass iterator over the events stages emit,
/// in execution order.
pub struct Run<'a> {
    orchestrator: &'a mut Orchestrator,
    walker: Walker,
    ctx: Ctx,
    pending: VecDeque<Event>,
    step_number: usize,
}

impl Run<'_> {
    pub fn status(&self) -> &RunStatus {
        &self.orchestrator.status
    }

    /// The blackboard as the last executed stage left it.
    pub fn blackboard(&self) -> &Blackboard {
        &self.orchestrator.board
    }

    /// Drive the run to the end, discarding remaining events, and return
    /// the final snapshot.
    pub fn finish(mut self) -> Snapshot {
        for _ in self.by_ref() {}
        self.orchestrator.snapshot()
    }

    fn advance(&mut self) {
        let orch = &mut *self.orchestrator;
        let advance = self.walker.advance(
            &orch.pipeline.plan,
            &mut orch.pipeline.stages,
            &mut orch.board,
            &mut self.ctx,
            orch.default_deadline,
        );

        match advance {
            Advance::Ran(runs) => {
                for run in runs {
                    self.step_number += 1;
                    let emitted = run.events.len();
                    self.pending.extend(run.events);

                    match run.result {
                        Ok(outcome) => {
                            if let Some(cb) = &mut orch.on_step {
                                cb(&StepEvent {
                                    stage: run.stage,
                                    outcome,
                                    duration: run.duration,
                                    step_number: self.step_number,
                                    iteration: run.iteration,
                                    events: emitted,
                                });
                            }
                        }
                        Err(cause) => {
                            if let Some(cb) = &mut orch.on_error {
                                cb(&ErrorEvent {
                                    stage: run.stage,
                                    error: &cause,
                                    step_number: self.step_number,
                                });
                            }
                            error!(
                                pipeline = orch.pipeline.name(),
                                stage = run.stage,
                                error = %cause,
                                "run aborted"
                            );
                            orch.status = RunStatus::Aborted(AbortReason::Failed(StageFailure {
                                stage: run.stage.to_string(),
                                cause,
                            }));
                            return;
                        }
                    }
                }
            }
            Advance::Done(Ending::Completed) => {
                info!(pipeline = orch.pipeline.name(), steps = self.step_number, "run completed");
                orch.status = RunStatus::Completed;
            }
            Advance::Done(Ending::Terminated(stage)) => {
                info!(pipeline = orch.pipeline.name(), stage, "run terminated early");
                orch.status = RunStatus::Aborted(AbortReason::Terminated {
                    stage: stage.to_string(),
                });
            }
        }
    }
}

impl Iterator for Run<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.orchestrator.status != RunStatus::Running {
                return None;
            }
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FanOutBranch, Node};
    use crate::{Stage, StepResult};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    // --- test stages ---

    /// Appends its name to the "order" list, writes `key = value` and emits
    /// one event.
    struct Writer {
        name: &'static str,
        key: &'static str,
        value: Value,
    }

    impl Writer {
        fn new(name: &'static str, key: &'static str, value: impl Into<Value>) -> Self {
            Self {
                name,
                key,
                value: value.into(),
            }
        }
    }

    fn record(board: &mut Blackboard, name: &str) {
        let mut order: Vec<String> = board.get_as("order").unwrap().unwrap_or_default();
        order.push(name.to_string());
        board.set_as("order", &order).unwrap();
    }

    impl Stage for Writer {
        fn name(&self) -> &'static str {
            self.name
        }
        fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
            record(board, self.name);
            board.set(self.key, self.value.clone());
            ctx.emit(format!("{} wrote {}", self.name, self.key));
            Ok(Outcome::Continue)
        }
    }

    /// Bumps the "pass" counter and writes it under "first".
    struct PassCounter;
    impl Stage for PassCounter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            let pass = board.get("pass").and_then(Value::as_u64).unwrap_or(0) + 1;
            board.set("pass", pass);
            board.set("first", pass);
            Ok(Outcome::Continue)
        }
    }

    /// Mirrors the pass counter under "second", terminating on `stop_on`.
    struct StopOn {
        stop_on: Option<u64>,
    }
    impl Stage for StopOn {
        fn name(&self) -> &'static str {
            "stop_on"
        }
        fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            let pass = board.get("pass").and_then(Value::as_u64).unwrap_or(0);
            board.set("second", pass);
            if Some(pass) == self.stop_on {
                Ok(Outcome::Terminate)
            } else {
                Ok(Outcome::Continue)
            }
        }
    }

    struct Terminator(&'static str);
    impl Stage for Terminator {
        fn name(&self) -> &'static str {
            self.0
        }
        fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            record(board, self.0);
            Ok(Outcome::Terminate)
        }
    }

    struct Failing(&'static str);
    impl Stage for Failing {
        fn name(&self) -> &'static str {
            self.0
        }
        fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
            board.set("partial", true);
            ctx.emit("about to fail");
            Err(StepError::transient("boom"))
        }
    }

    fn run_all(orch: &mut Orchestrator, initial: &Blackboard) -> Vec<Event> {
        orch.run(initial).unwrap().collect()
    }

    fn order(board: &Blackboard) -> Vec<String> {
        board.get_as("order").unwrap().unwrap_or_default()
    }

    // --- sequential ordering ---

    #[test]
    fn sequence_runs_stages_in_order() {
        let pipeline = Pipeline::builder("seq")
            .register(Writer::new("s1", "a", 1))
            .register(Writer::new("s2", "b", 2))
            .register(Writer::new("s3", "a", 3))
            .stage("s1")
            .stage("s2")
            .stage("s3")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        let events = run_all(&mut orch, &Blackboard::new());

        let authors: Vec<_> = events.iter().map(|e| e.author.as_str()).collect();
        assert_eq!(authors, vec!["s1", "s2", "s3"]);
        let snap = orch.snapshot();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(order(&snap.values), vec!["s1", "s2", "s3"]);
        // s3 overwrote s1's value.
        assert_eq!(snap.values.get("a"), Some(&json!(3)));
    }

    #[test]
    fn events_are_produced_lazily() {
        let pipeline = Pipeline::builder("lazy")
            .register(Writer::new("s1", "a", 1))
            .register(Writer::new("s2", "b", 2))
            .stage("s1")
            .stage("s2")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        let mut run = orch.run(&Blackboard::new()).unwrap();

        let first = run.next().unwrap();
        assert_eq!(first.author, "s1");
        assert!(run.blackboard().contains("a"));
        assert!(!run.blackboard().contains("b"));
        assert_eq!(run.status(), &RunStatus::Running);

        let snap = run.finish();
        assert_eq!(snap.status, RunStatus::Completed);
        assert!(snap.values.contains("b"));
    }

    #[test]
    fn initial_state_is_copied() {
        let pipeline = Pipeline::builder("copy")
            .register(Writer::new("s1", "topic", "changed"))
            .stage("s1")
            .build()
            .unwrap();

        let initial = Blackboard::from([("topic", "X")]);
        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &initial);

        assert_eq!(initial.get_str("topic"), Some("X"));
        assert_eq!(orch.blackboard().get_str("topic"), Some("changed"));
    }

    // --- bounded loop ---

    fn loop_pipeline(max: usize, stop_on: Option<u64>) -> Pipeline {
        Pipeline::builder("loop")
            .register(PassCounter)
            .register(StopOn { stop_on })
            .register(Writer::new("after", "after", true))
            .then(Node::repeat(
                max,
                vec![Node::stage("counter"), Node::stage("stop_on")],
            ))
            .stage("after")
            .build()
            .unwrap()
    }

    #[test]
    fn loop_stops_after_terminating_pass() {
        let mut orch = Orchestrator::new(loop_pipeline(5, Some(3)));
        run_all(&mut orch, &Blackboard::new());

        let board = orch.blackboard();
        assert_eq!(board.get("pass"), Some(&json!(3)));
        assert_eq!(board.get("first"), Some(&json!(3)));
        assert_eq!(board.get("second"), Some(&json!(3)));
        assert_eq!(board.get("after"), Some(&json!(true)));
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn loop_without_terminate_runs_exactly_bound_passes() {
        let mut orch = Orchestrator::new(loop_pipeline(2, None));
        run_all(&mut orch, &Blackboard::new());

        let board = orch.blackboard();
        assert_eq!(board.get("pass"), Some(&json!(2)));
        assert_eq!(board.get("after"), Some(&json!(true)));
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn terminate_mid_pass_finishes_the_pass() {
        let pipeline = Pipeline::builder("mid")
            .register(Terminator("stop"))
            .register(Writer::new("tail", "tail", true))
            .then(Node::repeat(
                4,
                vec![Node::stage("stop"), Node::sequence(vec![Node::stage("tail")])],
            ))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        assert_eq!(order(orch.blackboard()), vec!["stop", "tail"]);
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn on_step_reports_loop_iteration() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let mut orch = Orchestrator::new(loop_pipeline(3, None)).on_step(move |e| {
            seen_clone
                .lock()
                .unwrap()
                .push((e.stage.to_string(), e.iteration, e.step_number));
        });
        run_all(&mut orch, &Blackboard::new());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], ("counter".to_string(), Some(1), 1));
        assert_eq!(seen[5], ("stop_on".to_string(), Some(3), 6));
        assert_eq!(seen[6], ("after".to_string(), None, 7));
    }

    // --- branch ---

    fn branch_pipeline() -> Pipeline {
        Pipeline::builder("branch")
            .register(Writer::new("neg", "picked", "negative"))
            .register(Writer::new("pos", "picked", "positive"))
            .register(Writer::new("fallback", "picked", "default"))
            .then(Node::branch(
                "tone",
                vec![
                    (json!("negative"), vec![Node::stage("neg")]),
                    (json!("positive"), vec![Node::stage("pos")]),
                ],
                vec![Node::stage("fallback")],
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn branch_runs_first_matching_arm() {
        let mut orch = Orchestrator::new(branch_pipeline());
        run_all(&mut orch, &Blackboard::from([("tone", "positive")]));
        assert_eq!(orch.blackboard().get_str("picked"), Some("positive"));
    }

    #[test]
    fn branch_with_absent_discriminant_runs_default() {
        let mut orch = Orchestrator::new(branch_pipeline());
        run_all(&mut orch, &Blackboard::new());
        assert_eq!(orch.blackboard().get_str("picked"), Some("default"));
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn branch_match_is_exact_and_case_sensitive() {
        let mut orch = Orchestrator::new(branch_pipeline());
        run_all(&mut orch, &Blackboard::from([("tone", "Negative")]));
        assert_eq!(orch.blackboard().get_str("picked"), Some("default"));
    }

    // --- idempotence ---

    #[test]
    fn identical_runs_are_identical() {
        let initial = Blackboard::from([("seed", 7)]);

        let mut first = Orchestrator::new(loop_pipeline(4, Some(2)));
        let first_events = run_all(&mut first, &initial);

        let mut second = Orchestrator::new(loop_pipeline(4, Some(2)));
        let second_events = run_all(&mut second, &initial);

        assert_eq!(first_events, second_events);
        assert_eq!(first.snapshot(), second.snapshot());
    }

    // --- story scenario ---

    struct Generator;
    impl Stage for Generator {
        fn name(&self) -> &'static str {
            "generator"
        }
        fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
            let topic = board.get_str("topic").unwrap_or("nothing").to_string();
            let runs = board.get("generated").and_then(Value::as_u64).unwrap_or(0) + 1;
            board.set("generated", runs);
            board.set("draft", format!("a story about {topic}"));
            ctx.emit("draft written");
            Ok(Outcome::Continue)
        }
    }

    struct Critic;
    impl Stage for Critic {
        fn name(&self) -> &'static str {
            "critic"
        }
        fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            board.set("critique", "OK");
            Ok(Outcome::Continue)
        }
    }

    struct Reviser;
    impl Stage for Reviser {
        fn name(&self) -> &'static str {
            "reviser"
        }
        fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            let passes = board.get("revisions").and_then(Value::as_u64).unwrap_or(0) + 1;
            board.set("revisions", passes);
            let draft = board.get_str("draft").unwrap_or_default().to_string();
            board.set("draft", format!("{draft} (revised)"));
            if board.get_str("critique") == Some("OK") {
                Ok(Outcome::Terminate)
            } else {
                Ok(Outcome::Continue)
            }
        }
    }

    fn story_pipeline() -> Pipeline {
        Pipeline::builder("story")
            .register(Generator)
            .register(Critic)
            .register(Reviser)
            .stage("generator")
            .then(Node::repeat(
                2,
                vec![Node::stage("critic"), Node::stage("reviser")],
            ))
            .then(Node::when("tone", "negative", vec![Node::stage("generator")]))
            .build()
            .unwrap()
    }

    #[test]
    fn story_scenario_single_pass_no_regeneration() {
        let mut orch = Orchestrator::new(story_pipeline());
        run_all(&mut orch, &Blackboard::from([("topic", "X")]));

        let board = orch.blackboard();
        assert_eq!(board.get("revisions"), Some(&json!(1)));
        assert_eq!(board.get("generated"), Some(&json!(1)));
        assert_eq!(board.get_str("draft"), Some("a story about X (revised)"));
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn story_scenario_regenerates_on_negative_tone() {
        let mut orch = Orchestrator::new(story_pipeline());
        let events = run_all(&mut orch, &Blackboard::from([("topic", "X"), ("tone", "negative")]));

        let board = orch.blackboard();
        assert_eq!(board.get("generated"), Some(&json!(2)));
        assert_eq!(board.get_str("draft"), Some("a story about X"));
        assert_eq!(events.iter().filter(|e| e.author == "generator").count(), 2);
    }

    // --- abort ---

    #[test]
    fn stage_failure_aborts_before_loop() {
        let pipeline = Pipeline::builder("abort")
            .register(Writer::new("before", "before", true))
            .register(Failing("a"))
            .register(PassCounter)
            .stage("before")
            .stage("a")
            .then(Node::repeat(2, vec![Node::stage("counter")]))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        let events = run_all(&mut orch, &Blackboard::from([("topic", "X")]));

        let authors: Vec<_> = events.iter().map(|e| e.author.as_str()).collect();
        assert_eq!(authors, vec!["before", "a"]);

        let snap = orch.snapshot();
        let failure = snap.failure().unwrap();
        assert_eq!(failure.stage, "a");
        assert_eq!(failure.cause, StepError::transient("boom"));
        assert!(!snap.values.contains("pass"));
        // Writes made before the failure stay.
        assert_eq!(snap.values.get("partial"), Some(&json!(true)));
        assert_eq!(snap.values.get_str("topic"), Some("X"));
    }

    #[test]
    fn on_error_fires_once_on_failure() {
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = Arc::clone(&count);

        let pipeline = Pipeline::builder("err")
            .register(Failing("a"))
            .stage("a")
            .build()
            .unwrap();
        let mut orch = Orchestrator::new(pipeline).on_error(move |e| {
            assert_eq!(e.stage, "a");
            *count_clone.lock().unwrap() += 1;
        });
        run_all(&mut orch, &Blackboard::new());

        assert_eq!(*count.lock().unwrap(), 1);
    }

    // --- terminate outside loops ---

    #[test]
    fn top_level_terminate_skips_remaining_nodes() {
        let pipeline = Pipeline::builder("term")
            .register(Terminator("stop"))
            .register(Writer::new("never", "never", true))
            .then(Node::sequence(vec![Node::stage("stop")]))
            .stage("never")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        assert!(!orch.blackboard().contains("never"));
        assert_eq!(
            orch.status(),
            &RunStatus::Aborted(AbortReason::Terminated {
                stage: "stop".into()
            })
        );
        assert!(orch.snapshot().failure().is_none());
    }

    #[test]
    fn terminate_from_last_node_completes() {
        let pipeline = Pipeline::builder("term")
            .register(Writer::new("first", "first", true))
            .register(Terminator("stop"))
            .stage("first")
            .stage("stop")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    // --- lifecycle ---

    #[test]
    fn second_run_is_rejected() {
        let pipeline = Pipeline::builder("once")
            .register(Writer::new("s1", "a", 1))
            .stage("s1")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        assert_eq!(orch.status(), &RunStatus::Idle);
        run_all(&mut orch, &Blackboard::new());

        let err = orch.run(&Blackboard::new()).err().unwrap();
        assert_eq!(err, RunError::AlreadyStarted("once"));
        assert!(orch.status().is_finished());
    }

    // --- cancellation and deadlines ---

    struct CancelsRun(CancelToken);
    impl Stage for CancelsRun {
        fn name(&self) -> &'static str {
            "canceller"
        }
        fn run(&mut self, _board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            self.0.cancel();
            Ok(Outcome::Continue)
        }
    }

    #[test]
    fn cancellation_stops_before_next_stage() {
        let token = CancelToken::new();
        let pipeline = Pipeline::builder("cancel")
            .register(CancelsRun(token.clone()))
            .register(Writer::new("never", "never", true))
            .stage("canceller")
            .stage("never")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline).with_cancel_token(token);
        run_all(&mut orch, &Blackboard::new());

        let snap = orch.snapshot();
        assert!(!snap.values.contains("never"));
        let failure = snap.failure().unwrap();
        assert_eq!(failure.stage, "never");
        assert_eq!(failure.cause, StepError::Cancelled);
    }

    struct Sleeper;
    impl Stage for Sleeper {
        fn name(&self) -> &'static str {
            "sleeper"
        }
        fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
            assert!(ctx.deadline().is_some());
            std::thread::sleep(Duration::from_millis(20));
            board.set("slept", true);
            Ok(Outcome::Continue)
        }
    }

    #[test]
    fn exceeding_deadline_is_a_stage_failure() {
        let pipeline = Pipeline::builder("deadline")
            .register(Sleeper)
            .stage_with_deadline("sleeper", Duration::from_millis(1))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        let snap = orch.snapshot();
        let failure = snap.failure().unwrap();
        assert!(matches!(failure.cause, StepError::Timeout { .. }));
        assert_eq!(snap.values.get("slept"), Some(&json!(true)));
    }

    #[test]
    fn default_deadline_applies_to_plain_stages() {
        let pipeline = Pipeline::builder("deadline")
            .register(Sleeper)
            .stage("sleeper")
            .build()
            .unwrap();

        let mut orch =
            Orchestrator::new(pipeline).with_default_deadline(Duration::from_millis(1));
        run_all(&mut orch, &Blackboard::new());
        assert!(orch.snapshot().failure().is_some());
    }

    #[test]
    fn unrepresentable_deadline_means_no_deadline() {
        let pipeline = Pipeline::builder("deadline")
            .register(Writer::new("w", "w", 1))
            .register(Writer::new("x", "x", 2))
            .stage("w")
            .stage_with_deadline("x", Duration::MAX)
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline).with_default_deadline(Duration::MAX);
        let events = run_all(&mut orch, &Blackboard::new());

        assert_eq!(events.len(), 2);
        assert_eq!(orch.status(), &RunStatus::Completed);
        assert_eq!(order(orch.blackboard()), vec!["w", "x"]);
    }

    #[test]
    fn terminate_in_nested_loop_exits_only_the_inner_loop() {
        let pipeline = Pipeline::builder("nested")
            .register(Writer::new("outer", "outer", true))
            .register(Terminator("inner"))
            .register(Writer::new("after", "after", true))
            .then(Node::repeat(
                3,
                vec![
                    Node::stage("outer"),
                    Node::repeat(5, vec![Node::stage("inner")]),
                ],
            ))
            .stage("after")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        assert_eq!(
            order(orch.blackboard()),
            vec!["outer", "inner", "outer", "inner", "outer", "inner", "after"]
        );
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    // --- fan-out ---

    struct Scratch {
        name: &'static str,
        key: &'static str,
    }
    impl Stage for Scratch {
        fn name(&self) -> &'static str {
            self.name
        }
        fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
            board.set("tmp", self.name);
            let topic = board.get_str("topic").unwrap_or_default().to_string();
            board.set(self.key, format!("{} on {topic}", self.name));
            ctx.emit(self.name);
            Ok(Outcome::Continue)
        }
    }

    #[test]
    fn fan_out_merges_designated_keys_in_branch_order() {
        let pipeline = Pipeline::builder("fan")
            .register(Scratch {
                name: "left",
                key: "left",
            })
            .register(Scratch {
                name: "right",
                key: "right",
            })
            .register(Writer::new("join", "joined", true))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("left")]).merge(["left"]),
                FanOutBranch::new(vec![Node::stage("right")]).merge(["right"]),
            ]))
            .stage("join")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        let events = run_all(&mut orch, &Blackboard::from([("topic", "rust")]));

        let authors: Vec<_> = events.iter().map(|e| e.author.as_str()).collect();
        assert_eq!(authors, vec!["left", "right", "join"]);

        let board = orch.blackboard();
        assert_eq!(board.get_str("left"), Some("left on rust"));
        assert_eq!(board.get_str("right"), Some("right on rust"));
        assert!(!board.contains("tmp"));
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn fan_out_failure_aborts_without_merging() {
        let pipeline = Pipeline::builder("fan")
            .register(Scratch {
                name: "left",
                key: "left",
            })
            .register(Failing("broken"))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("left")]).merge(["left"]),
                FanOutBranch::new(vec![Node::stage("broken")]).merge(["partial"]),
            ]))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        let snap = orch.snapshot();
        assert_eq!(snap.failure().unwrap().stage, "broken");
        assert!(!snap.values.contains("left"));
        assert!(!snap.values.contains("partial"));
    }

    #[test]
    fn fan_out_stages_are_usable_again_afterwards() {
        let pipeline = Pipeline::builder("fan")
            .register(Writer::new("w", "w", 1))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("w")]).merge(["w"])
            ]))
            .stage("w")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        let events = run_all(&mut orch, &Blackboard::new());
        assert_eq!(events.len(), 2);
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    #[test]
    fn terminate_in_fan_out_branch_ends_only_that_branch() {
        let pipeline = Pipeline::builder("fan")
            .register(Terminator("quit"))
            .register(Writer::new("skipped", "skipped", true))
            .register(Writer::new("other", "other", true))
            .register(Writer::new("after", "after", true))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("quit"), Node::stage("skipped")])
                    .merge(["skipped", "order"]),
                FanOutBranch::new(vec![Node::stage("other")]).merge(["other"]),
            ]))
            .stage("after")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        let board = orch.blackboard();
        assert!(!board.contains("skipped"));
        assert_eq!(board.get("other"), Some(&json!(true)));
        assert_eq!(order(board), vec!["quit", "after"]);
        assert_eq!(orch.status(), &RunStatus::Completed);
    }

    struct Panics;
    impl Stage for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }
        fn run(&mut self, _board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
            panic!("stage blew up");
        }
    }

    #[test]
    fn panicking_fan_out_branch_aborts_without_merging() {
        let pipeline = Pipeline::builder("fan")
            .register(Scratch {
                name: "left",
                key: "left",
            })
            .register(Panics)
            .register(Writer::new("after", "after", true))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("left")]).merge(["left"]),
                FanOutBranch::new(vec![Node::stage("panics")]).merge(["tmp"]),
            ]))
            .stage("after")
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline);
        run_all(&mut orch, &Blackboard::new());

        let snap = orch.snapshot();
        let failure = snap.failure().unwrap();
        assert_eq!(failure.stage, "fan_out");
        assert_eq!(failure.cause, StepError::other("fan-out branch panicked"));
        assert!(!snap.values.contains("left"));
        assert!(!snap.values.contains("after"));
    }

    #[test]
    fn cancellation_reaches_fan_out_branches() {
        let token = CancelToken::new();
        let pipeline = Pipeline::builder("fan")
            .register(CancelsRun(token.clone()))
            .register(Writer::new("never", "never", true))
            .then(Node::fan_out(vec![
                FanOutBranch::new(vec![Node::stage("canceller"), Node::stage("never")])
                    .merge(["never"]),
            ]))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline).with_cancel_token(token);
        run_all(&mut orch, &Blackboard::new());

        let snap = orch.snapshot();
        assert!(!snap.values.contains("never"));
        let failure = snap.failure().unwrap();
        assert_eq!(failure.stage, "never");
        assert_eq!(failure.cause, StepError::Cancelled);
    }

    #[test]
    fn fan_out_inside_loop_reports_the_pass() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let pipeline = Pipeline::builder("fan")
            .register(Writer::new("w", "w", 1))
            .then(Node::repeat(
                2,
                vec![Node::fan_out(vec![
                    FanOutBranch::new(vec![Node::stage("w")]).merge(["w"]),
                ])],
            ))
            .build()
            .unwrap();

        let mut orch = Orchestrator::new(pipeline).on_step(move |e| {
            seen_clone.lock().unwrap().push(e.iteration);
        });
        run_all(&mut orch, &Blackboard::new());

        assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(2)]);
    }
}
