// Export one OpenTelemetry span per stage invocation through the step and
// error hooks. Spans are printed to stdout.
//
// Run: cargo run --example otel_steps

use opentelemetry::trace::{Span, Status, Tracer, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracerProvider;
use stage_line::stages::{ExitWhen, FnStage};
use stage_line::{Blackboard, Ctx, Node, Orchestrator, Outcome, Pipeline, StepResult};

fn main() {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    let step_tracer = provider.tracer("stage-line");
    let error_tracer = step_tracer.clone();

    let counter = FnStage::new("counter", |board: &mut Blackboard, ctx: &mut Ctx| -> StepResult {
        let n = board.get("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        board.set("n", n);
        board.set("done", n >= 3);
        ctx.emit(n);
        Ok(Outcome::Continue)
    });

    let pipeline = Pipeline::builder("otel_demo")
        .register(counter)
        .register(ExitWhen::equals("enough", "done", true))
        .then(Node::repeat(
            10,
            vec![Node::stage("counter"), Node::stage("enough")],
        ))
        .build()
        .unwrap();

    let mut orchestrator = Orchestrator::new(pipeline)
        .on_step(move |e| {
            let mut span = step_tracer.start(e.stage.to_string());
            span.set_attribute(KeyValue::new("step_number", e.step_number as i64));
            span.set_attribute(KeyValue::new("outcome", format!("{:?}", e.outcome)));
            span.set_attribute(KeyValue::new("duration_ms", e.duration.as_secs_f64() * 1000.0));
            if let Some(pass) = e.iteration {
                span.set_attribute(KeyValue::new("loop_pass", pass as i64));
            }
            span.end();
        })
        .on_error(move |e| {
            let mut span = error_tracer.start(e.stage.to_string());
            span.set_status(Status::error(e.error.to_string()));
            span.end();
        });

    let events: Vec<_> = orchestrator.run(&Blackboard::new()).unwrap().collect();
    println!("{} events, status {:?}", events.len(), orchestrator.status());

    provider.shutdown().unwrap();
}
