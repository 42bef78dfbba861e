// Story generation and refinement.
//
// generator -> require story -> (critic -> reviser) x2 -> grammar -> tone
//   -> regenerate if the tone came out negative
//
// The models are canned closures so the demo runs offline. Swap them for a
// real model client to talk to an LLM.
//
// Run: RUST_LOG=info cargo run --example story_flow

use stage_line::stages::{PromptStage, RequireKey};
use stage_line::{Blackboard, Node, Orchestrator, Pipeline, StepError};
use tracing_subscriber::EnvFilter;

fn scripted(
    replies: &'static [&'static str],
) -> impl FnMut(&str) -> Result<String, StepError> + Send + 'static {
    let mut next = 0;
    move |_prompt: &str| -> Result<String, StepError> {
        let reply = replies[next.min(replies.len() - 1)];
        next += 1;
        Ok(reply.to_string())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let generator = PromptStage::new(
        "story_generator",
        "You are a story writer. Write a short story (around 100 words) on the following topic: {topic}",
        "current_story",
        scripted(&[
            "The robot sat alone among rusted cars until a stray dog limped in.",
            "The robot and the dog built a kite from scrap and flew it at dawn.",
        ]),
    );
    let critic = PromptStage::new(
        "critic",
        "You are a story critic. Review the story: {current_story}. Give 1-2 sentences of criticism.",
        "criticism",
        scripted(&["Give the dog a name.", "Show how the robot feels."]),
    );
    let reviser = PromptStage::new(
        "reviser",
        "Revise the story: {current_story}, based on the criticism: {criticism}. Output only the story.",
        "current_story",
        scripted(&[
            "The robot sat alone among rusted cars until Bolt, a stray dog, limped in.",
            "The robot, lonely for years, warmed when Bolt, a stray dog, limped in.",
        ]),
    );
    let grammar = PromptStage::new(
        "grammar_check",
        "Check the grammar of: {current_story}. List corrections or say 'Grammar is good!'",
        "grammar_suggestions",
        scripted(&["Grammar is good!"]),
    );
    let tone = PromptStage::new(
        "tone_check",
        "Analyze the tone of: {current_story}. Answer positive, negative or neutral.",
        "tone_check_result",
        scripted(&["negative", "positive"]),
    );

    let pipeline = Pipeline::builder("story_flow")
        .register(generator)
        .register(RequireKey::new("require_story", "current_story"))
        .register(critic)
        .register(reviser)
        .register(grammar)
        .register(tone)
        .stage("story_generator")
        .stage("require_story")
        .then(Node::repeat(
            2,
            vec![Node::stage("critic"), Node::stage("reviser")],
        ))
        .then(Node::sequence(vec![
            Node::stage("grammar_check"),
            Node::stage("tone_check"),
        ]))
        .then(Node::when(
            "tone_check_result",
            "negative",
            vec![Node::stage("story_generator")],
        ))
        .build()
        .unwrap();

    let initial = Blackboard::from([("topic", "a lonely robot finding a friend in a junkyard")]);
    let mut orchestrator = Orchestrator::new(pipeline).with_tracing();

    for event in orchestrator.run(&initial).unwrap() {
        println!("[{}] {}", event.author, event.payload);
    }

    let snapshot = orchestrator.snapshot();
    println!("\nstatus: {:?}", snapshot.status);
    println!(
        "final state:\n{}",
        serde_json::to_string_pretty(&snapshot.values).unwrap()
    );
}
