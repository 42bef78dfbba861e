// Write / review loop with a sentinel exit and a flaky stage behind a retry
// wrapper.
//
// writer -> (reviewer -> exit when verdict == "APPROVED" -> fixer) x5
//
// Run: cargo run --example critic_loop

use stage_line::stages::{ExitWhen, FnStage, Retrying};
use stage_line::{Blackboard, Ctx, Node, Orchestrator, Outcome, Pipeline, StepError, StepResult};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let writer = FnStage::new("writer", |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
        board.set("text", "Hello wrold! This is a dcument.");
        ctx.emit("first draft written");
        Ok(Outcome::Continue)
    });

    // Fails twice with a transient error before answering, like a rate limited API.
    let mut calls = 0;
    let reviewer = FnStage::new(
        "reviewer",
        move |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
            calls += 1;
            if calls <= 2 {
                return Err(StepError::transient("429 too many requests"));
            }

            let text = board.get_str("text").unwrap_or_default();
            let mut problems = Vec::new();
            if text.contains("wrold") {
                problems.push("typo: 'wrold' should be 'world'");
            }
            if text.contains("dcument") {
                problems.push("typo: 'dcument' should be 'document'");
            }

            let verdict = if problems.is_empty() { "APPROVED" } else { "CHANGES" };
            board.set("verdict", verdict);
            board.set_as("problems", &problems)?;
            ctx.emit(format!("{verdict}: {} problem(s)", problems.len()));
            Ok(Outcome::Continue)
        },
    );

    let fixer = FnStage::new("fixer", |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
        let problems: Vec<String> = board.get_as("problems")?.unwrap_or_default();
        let mut text = board.get_str("text").unwrap_or_default().to_string();
        for problem in &problems {
            if problem.contains("wrold") {
                text = text.replace("wrold", "world");
            }
            if problem.contains("dcument") {
                text = text.replace("dcument", "document");
            }
        }
        ctx.emit(format!("fixed {} problem(s)", problems.len()));
        board.set("text", text);
        Ok(Outcome::Continue)
    });

    let pipeline = Pipeline::builder("edit_loop")
        .register(writer)
        .register(Retrying::new(reviewer).with_wait(Duration::from_millis(50)))
        .register(ExitWhen::equals("approved", "verdict", "APPROVED"))
        .register(fixer)
        .stage("writer")
        .then(Node::repeat(
            5,
            vec![
                Node::stage("reviewer"),
                Node::stage("approved"),
                Node::stage("fixer"),
            ],
        ))
        .build()
        .unwrap();

    let mut orchestrator = Orchestrator::new(pipeline).on_step(|e| {
        println!(
            "  step {} {} (pass {:?}) -> {:?}",
            e.step_number, e.stage, e.iteration, e.outcome
        );
    });

    for event in orchestrator.run(&Blackboard::new()).unwrap() {
        println!("[{}] {}", event.author, event.payload);
    }

    let snapshot = orchestrator.snapshot();
    println!("status: {:?}", snapshot.status);
    println!("text:   {:?}", snapshot.values.get_str("text"));
}
