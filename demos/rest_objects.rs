// REST calls as pipeline stages against https://api.restful-api.dev.
//
// list a few seeded objects -> add object -> read it back -> patch its name
//   -> delete it
//
// Needs network access.
//
// Run: cargo run --example rest_objects

use serde_json::json;
use stage_line::stages::{FnStage, HttpStage, Method, RequireKey, Retrying};
use stage_line::{Blackboard, Ctx, Orchestrator, Outcome, Pipeline, StepError, StepResult};
use tracing_subscriber::EnvFilter;

const BASE_URL: &str = "https://api.restful-api.dev/objects";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Copies the id of the created object to where the URL templates expect it.
    let remember_id = FnStage::new(
        "remember_id",
        |board: &mut Blackboard, _ctx: &mut Ctx| -> StepResult {
            let id = board
                .get("created")
                .and_then(|created| created.get("id"))
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| StepError::invalid("create response carried no id"))?;
            board.set("object_id", id);
            Ok(Outcome::Continue)
        },
    );

    let pipeline = Pipeline::builder("rest_objects")
        .register(
            HttpStage::new("list_objects", Method::Get, BASE_URL, "listed").with_query_from("ids"),
        )
        .register(
            HttpStage::new("add_object", Method::Post, BASE_URL, "created")
                .with_body_from("new_object"),
        )
        .register(remember_id)
        .register(RequireKey::new("require_id", "object_id"))
        .register(Retrying::new(HttpStage::new(
            "get_object",
            Method::Get,
            format!("{BASE_URL}/{{object_id}}"),
            "fetched",
        )))
        .register(
            HttpStage::new(
                "patch_object",
                Method::Patch,
                format!("{BASE_URL}/{{object_id}}"),
                "patched",
            )
            .with_body_from("patch"),
        )
        .register(HttpStage::new(
            "delete_object",
            Method::Delete,
            format!("{BASE_URL}/{{object_id}}"),
            "deleted",
        ))
        .stage("list_objects")
        .stage("add_object")
        .stage("remember_id")
        .stage("require_id")
        .stage("get_object")
        .stage("patch_object")
        .stage("delete_object")
        .build()
        .unwrap();

    let initial = Blackboard::from([
        ("ids", json!({"id": [3, 5, 10]})),
        (
            "new_object",
            json!({"name": "Apple MacBook Pro 16", "data": {"year": 2019, "price": 1849.99}}),
        ),
        ("patch", json!({"name": "Apple MacBook Pro 16 (Updated Name)"})),
    ]);

    let mut orchestrator = Orchestrator::new(pipeline).with_tracing();
    for event in orchestrator.run(&initial).unwrap() {
        println!("[{}] {}", event.author, event.payload);
    }

    let snapshot = orchestrator.snapshot();
    if let Some(failure) = snapshot.failure() {
        eprintln!("aborted at {}: {}", failure.stage, failure.cause);
    }
    println!("{}", serde_json::to_string_pretty(&snapshot.values).unwrap());
}
