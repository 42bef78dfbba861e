//! A deterministic stage orchestrator for agent-style workflows.
//!
//! Register [`Stage`]s, arrange them into a [`Pipeline`] of sequences,
//! bounded loops, branches and fan-outs, and let the [`Orchestrator`] run
//! them against a shared [`Blackboard`]. Stages report progress through
//! [`Ctx::emit`] and steer control flow with [`Outcome::Continue`] and
//! [`Outcome::Terminate`].
//!
//! # Quick start
//!
//! ```rust
//! use stage_line::{Blackboard, Ctx, Node, Orchestrator, Outcome, Pipeline, Stage, StepResult};
//!
//! struct Draft;
//! impl Stage for Draft {
//!     fn name(&self) -> &'static str { "draft" }
//!     fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
//!         let topic = board.get_str("topic").unwrap_or("nothing").to_string();
//!         board.set("draft", format!("a story about {topic}"));
//!         ctx.emit("drafted");
//!         Ok(Outcome::Continue)
//!     }
//! }
//!
//! struct Review;
//! impl Stage for Review {
//!     fn name(&self) -> &'static str { "review" }
//!     fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
//!         board.set("verdict", "OK");
//!         Ok(Outcome::Terminate)
//!     }
//! }
//!
//! let pipeline = Pipeline::builder("demo")
//!     .register(Draft)
//!     .register(Review)
//!     .stage("draft")
//!     .then(Node::repeat(3, vec![Node::stage("review")]))
//!     .build()
//!     .unwrap();
//!
//! let mut orchestrator = Orchestrator::new(pipeline);
//! let events: Vec<_> = orchestrator
//!     .run(&Blackboard::from([("topic", "rust")]))
//!     .unwrap()
//!     .collect();
//!
//! assert_eq!(events.len(), 1);
//! assert_eq!(orchestrator.blackboard().get_str("verdict"), Some("OK"));
//! ```

mod blackboard;
mod ctx;
mod event;
mod orchestrator;
mod pipeline;
mod stage;
pub mod stages;
pub mod tools;
mod walker;

pub use blackboard::Blackboard;
pub use ctx::{CancelToken, Ctx};
pub use event::Event;
pub use orchestrator::{
    AbortReason, ErrorEvent, Orchestrator, Run, RunError, RunStatus, Snapshot, StageFailure,
    StepEvent,
};
pub use pipeline::{FanOutBranch, Node, Pipeline, PipelineBuilder, PipelineError};
pub use stage::{Outcome, Stage, StepError, StepResult};
