// Fan-out / fan-in.
//
// Three researchers run on their own threads against copies of the
// blackboard. Each branch copies its notes back under its own key once every
// branch is done, then a single editor stitches them together.
//
// Run: cargo run --example fan_out

use stage_line::stages::FnStage;
use stage_line::{Blackboard, Ctx, FanOutBranch, Node, Orchestrator, Outcome, Pipeline, StepResult};
use tracing_subscriber::EnvFilter;

fn researcher(
    name: &'static str,
    angle: &'static str,
) -> FnStage<impl FnMut(&mut Blackboard, &mut Ctx) -> StepResult + Send + 'static> {
    FnStage::new(name, move |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
        let topic = board.get_str("topic").unwrap_or("nothing").to_string();
        ctx.emit(format!("researching {topic} from the {angle} angle"));
        // Scratch space: never merged, so branches can't trip over each other.
        board.set("scratch", name);
        board.set(name, format!("{angle} notes on {topic}"));
        Ok(Outcome::Continue)
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let editor = FnStage::new("editor", |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
        let sections: Vec<String> = ["history", "tooling", "people"]
            .iter()
            .filter_map(|key| board.get_str(key).map(str::to_string))
            .collect();
        board.set("article", sections.join("\n\n"));
        ctx.emit(format!("stitched {} sections", sections.len()));
        Ok(Outcome::Continue)
    });

    let pipeline = Pipeline::builder("newsletter")
        .register(researcher("history", "historical"))
        .register(researcher("tooling", "tooling"))
        .register(researcher("people", "community"))
        .register(editor)
        .then(Node::fan_out(vec![
            FanOutBranch::new(vec![Node::stage("history")]).merge(["history"]),
            FanOutBranch::new(vec![Node::stage("tooling")]).merge(["tooling"]),
            FanOutBranch::new(vec![Node::stage("people")]).merge(["people"]),
        ]))
        .stage("editor")
        .build()
        .unwrap();

    let mut orchestrator = Orchestrator::new(pipeline).with_tracing();
    let initial = Blackboard::from([("topic", "Rust in embedded firmware")]);

    for event in orchestrator.run(&initial).unwrap() {
        println!("[{}] {}", event.author, event.payload);
    }

    let board = orchestrator.blackboard();
    println!("\n{}", board.get_str("article").unwrap_or_default());
    println!("\nscratch merged? {}", board.contains("scratch"));
}
