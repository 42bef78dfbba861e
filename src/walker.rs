//! Depth-first traversal of a compiled [`Plan`], one stage at a time.
//!
//! The walker keeps an explicit stack of frames instead of recursing so the
//! orchestrator can hand control back to the caller between stages.

use crate::blackboard::Blackboard;
use crate::ctx::{CancelToken, Ctx};
use crate::event::Event;
use crate::pipeline::{Lane, NodeId, Op, Plan, Registry};
use crate::stage::{Outcome, StepError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Record of one stage invocation.
pub(crate) struct StageRun {
    pub(crate) stage: &'static str,
    pub(crate) result: Result<Outcome, StepError>,
    pub(crate) duration: Duration,
    pub(crate) events: Vec<Event>,
    /// Pass number of the innermost enclosing loop, 1-based.
    pub(crate) iteration: Option<usize>,
}

/// How a traversal ended when nothing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ending {
    Completed,
    /// A stage outside any loop terminated while nodes were still pending.
    Terminated(&'static str),
}

pub(crate) enum Advance {
    /// One stage ran, or a whole fan-out. A failed run is always last.
    Ran(Vec<StageRun>),
    Done(Ending),
}

enum Frame {
    Seq { id: NodeId, next: usize },
    Loop { id: NodeId, pass: usize, terminate: bool },
}

pub(crate) struct Walker {
    stack: Vec<Frame>,
    ending: Ending,
    /// Loop pass the walker was started inside, for fan-out branches.
    outer_pass: Option<usize>,
}

impl Walker {
    pub(crate) fn new(root: NodeId) -> Self {
        Self {
            stack: vec![Frame::Seq { id: root, next: 0 }],
            ending: Ending::Completed,
            outer_pass: None,
        }
    }

    fn within(root: NodeId, outer_pass: Option<usize>) -> Self {
        Self {
            outer_pass,
            ..Self::new(root)
        }
    }

    /// Run until one stage (or one fan-out) has executed, or the traversal
    /// is over.
    pub(crate) fn advance(
        &mut self,
        plan: &Plan,
        stages: &mut Registry,
        board: &mut Blackboard,
        ctx: &mut Ctx,
        default_deadline: Option<Duration>,
    ) -> Advance {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Advance::Done(self.ending);
            };

            match frame {
                Frame::Seq { id, next } => {
                    let children = plan.children(*id);
                    let Some(&child) = children.get(*next) else {
                        self.stack.pop();
                        continue;
                    };
                    *next += 1;

                    match plan.op(child) {
                        Op::Sequence(_) => self.stack.push(Frame::Seq { id: child, next: 0 }),
                        Op::Loop { .. } => self.stack.push(Frame::Loop {
                            id: child,
                            pass: 0,
                            terminate: false,
                        }),
                        Op::Branch {
                            discriminant,
                            arms,
                            default,
                        } => {
                            let value = board.get(discriminant);
                            let chosen = arms
                                .iter()
                                .position(|(literal, _)| value == Some(literal));
                            let target = match chosen {
                                Some(i) => arms[i].1,
                                None => *default,
                            };
                            debug!(
                                discriminant = discriminant.as_str(),
                                arm = ?chosen,
                                "branch selected"
                            );
                            self.stack.push(Frame::Seq { id: target, next: 0 });
                        }
                        Op::Stage { name, deadline } => {
                            let limit = (*deadline).or(default_deadline);
                            let run = self.run_stage(plan, *name, limit, stages, board, ctx);
                            return Advance::Ran(vec![run]);
                        }
                        Op::FanOut(lanes) => {
                            let runs =
                                self.fan_out(plan, lanes, stages, board, ctx, default_deadline);
                            return Advance::Ran(runs);
                        }
                    }
                }
                Frame::Loop {
                    id,
                    pass,
                    terminate,
                } => {
                    let Op::Loop {
                        body,
                        max_iterations,
                    } = plan.op(*id)
                    else {
                        self.stack.pop();
                        continue;
                    };

                    if *pass > 0 && (*terminate || *pass >= *max_iterations) {
                        debug!(passes = *pass, terminated = *terminate, "loop finished");
                        self.stack.pop();
                        continue;
                    }
                    *pass += 1;
                    debug!(pass = *pass, max_iterations = *max_iterations, "loop pass");
                    let body = *body;
                    self.stack.push(Frame::Seq { id: body, next: 0 });
                }
            }
        }
    }

    fn run_stage(
        &mut self,
        plan: &Plan,
        name: &'static str,
        limit: Option<Duration>,
        stages: &mut Registry,
        board: &mut Blackboard,
        ctx: &mut Ctx,
    ) -> StageRun {
        let iteration = self.iteration();

        if ctx.is_cancelled() {
            self.stack.clear();
            return StageRun {
                stage: name,
                result: Err(StepError::Cancelled),
                duration: Duration::ZERO,
                events: vec![],
                iteration,
            };
        }

        let Some(stage) = stages.get_mut(name) else {
            self.stack.clear();
            return StageRun {
                stage: name,
                result: Err(StepError::other(format!("unknown stage: {name}"))),
                duration: Duration::ZERO,
                events: vec![],
                iteration,
            };
        };

        info!(stage = name, ?iteration, "running stage");
        let start = Instant::now();
        // A deadline too far out to represent is no deadline at all.
        ctx.begin(name, limit.and_then(|l| start.checked_add(l)));
        let mut result = stage.run(board, ctx);
        let duration = start.elapsed();
        let events = ctx.take_events();

        if let Some(limit) = limit
            && result.is_ok()
            && duration > limit
        {
            result = Err(StepError::Timeout {
                limit,
                elapsed: duration,
            });
        }

        match &result {
            Err(err) => {
                warn!(stage = name, error = %err, "stage failed");
                self.stack.clear();
            }
            Ok(Outcome::Terminate) => self.terminate(plan, name),
            Ok(Outcome::Continue) => {}
        }

        StageRun {
            stage: name,
            result,
            duration,
            events,
            iteration,
        }
    }

    /// Deliver a terminate signal to the innermost loop, or end the whole
    /// traversal when there is none.
    fn terminate(&mut self, plan: &Plan, stage: &'static str) {
        for frame in self.stack.iter_mut().rev() {
            if let Frame::Loop { terminate, .. } = frame {
                *terminate = true;
                return;
            }
        }

        let pending = self.stack.iter().any(|frame| match frame {
            Frame::Seq { id, next } => *next < plan.children(*id).len(),
            Frame::Loop { .. } => false,
        });
        self.stack.clear();
        if pending {
            info!(stage, "pipeline terminated early");
            self.ending = Ending::Terminated(stage);
        }
    }

    fn iteration(&self) -> Option<usize> {
        self.stack
            .iter()
            .rev()
            .find_map(|frame| match frame {
                Frame::Loop { pass, .. } => Some(*pass),
                Frame::Seq { .. } => None,
            })
            .or(self.outer_pass)
    }

    fn fan_out(
        &mut self,
        plan: &Plan,
        lanes: &[Lane],
        stages: &mut Registry,
        board: &mut Blackboard,
        ctx: &mut Ctx,
        default_deadline: Option<Duration>,
    ) -> Vec<StageRun> {
        debug!(branches = lanes.len(), "fanning out");
        let iteration = self.iteration();

        let mut work: Vec<(Registry, Blackboard)> = lanes
            .iter()
            .map(|lane| {
                let owned: Registry = lane
                    .stages
                    .iter()
                    .filter_map(|name| stages.remove_entry(name))
                    .collect();
                (owned, board.clone())
            })
            .collect();

        let cancel = ctx.cancel_token().clone();
        let results: Vec<Vec<StageRun>> = std::thread::scope(|scope| {
            let handles: Vec<_> = lanes
                .iter()
                .zip(work.iter_mut())
                .map(|(lane, (owned, lane_board))| {
                    let cancel = cancel.clone();
                    scope.spawn(move || {
                        let mut walker = Walker::within(lane.root, iteration);
                        run_lane(&mut walker, plan, owned, lane_board, cancel, default_deadline)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        vec![StageRun {
                            stage: "fan_out",
                            result: Err(StepError::other("fan-out branch panicked")),
                            duration: Duration::ZERO,
                            events: vec![],
                            iteration,
                        }]
                    })
                })
                .collect()
        });

        let mut runs = Vec::new();
        let mut failed = false;
        for lane_runs in results {
            for run in lane_runs {
                failed = run.result.is_err();
                runs.push(run);
                if failed {
                    break;
                }
            }
            if failed {
                break;
            }
        }

        for ((owned, lane_board), lane) in work.into_iter().zip(lanes) {
            stages.extend(owned);
            if failed {
                continue;
            }
            for key in &lane.merge {
                if let Some(value) = lane_board.get(key) {
                    board.set(key.clone(), value.clone());
                }
            }
        }

        if failed {
            self.stack.clear();
        }
        runs
    }
}

/// Drive one fan-out branch to the end on its own thread.
fn run_lane(
    walker: &mut Walker,
    plan: &Plan,
    stages: &mut Registry,
    board: &mut Blackboard,
    cancel: CancelToken,
    default_deadline: Option<Duration>,
) -> Vec<StageRun> {
    let mut ctx = Ctx::with_cancel_token(cancel);
    let mut runs = Vec::new();

    loop {
        match walker.advance(plan, stages, board, &mut ctx, default_deadline) {
            Advance::Ran(batch) => {
                let failed = batch.iter().any(|run| run.result.is_err());
                runs.extend(batch);
                if failed {
                    return runs;
                }
            }
            Advance::Done(_) => return runs,
        }
    }
}
