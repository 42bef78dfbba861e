//! Ready-made stages for common pipeline chores.

use crate::tools;
use crate::{Blackboard, Ctx, Outcome, Stage, StepError, StepResult};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// FnStage
// ---------------------------------------------------------------------------

/// A stage backed by a closure.
pub struct FnStage<F> {
    name: &'static str,
    f: F,
}

impl<F> FnStage<F>
where
    F: FnMut(&mut Blackboard, &mut Ctx) -> StepResult + Send + 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> Stage for FnStage<F>
where
    F: FnMut(&mut Blackboard, &mut Ctx) -> StepResult + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
        (self.f)(board, ctx)
    }
}

// ---------------------------------------------------------------------------
// PromptStage
// ---------------------------------------------------------------------------

/// Something that turns a prompt into a reply: a hosted model, a local one,
/// or a canned script in tests.
pub trait Model: Send + 'static {
    fn complete(&mut self, prompt: &str) -> Result<String, StepError>;
}

impl<F> Model for F
where
    F: FnMut(&str) -> Result<String, StepError> + Send + 'static,
{
    fn complete(&mut self, prompt: &str) -> Result<String, StepError> {
        self(prompt)
    }
}

/// Renders an instruction template against the blackboard, asks a [`Model`]
/// and stores the reply under `output_key`.
pub struct PromptStage<M> {
    name: &'static str,
    instruction: String,
    output_key: String,
    model: M,
    json_output: bool,
}

impl<M: Model> PromptStage<M> {
    pub fn new(
        name: &'static str,
        instruction: impl Into<String>,
        output_key: impl Into<String>,
        model: M,
    ) -> Self {
        Self {
            name,
            instruction: instruction.into(),
            output_key: output_key.into(),
            model,
            json_output: false,
        }
    }

    /// Parse the reply as JSON before storing it.
    pub fn json_output(mut self) -> Self {
        self.json_output = true;
        self
    }
}

impl<M: Model> Stage for PromptStage<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
        let prompt = tools::render(&self.instruction, board)?;
        ctx.check_cancelled()?;
        let reply = self.model.complete(&prompt)?;
        ctx.check_cancelled()?;

        let value = if self.json_output {
            tools::extract_json(&reply)?
        } else {
            Value::String(reply.trim().to_string())
        };
        ctx.emit(value.clone());
        board.set(self.output_key.clone(), value);
        Ok(Outcome::Continue)
    }
}

// ---------------------------------------------------------------------------
// ExitWhen
// ---------------------------------------------------------------------------

enum ExitRule {
    Equals(Value),
    Contains(String),
}

/// Terminates the enclosing loop once a blackboard key carries a sentinel.
pub struct ExitWhen {
    name: &'static str,
    key: String,
    rule: ExitRule,
}

impl ExitWhen {
    /// Stop when the value under `key` equals `value` exactly.
    pub fn equals(name: &'static str, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name,
            key: key.into(),
            rule: ExitRule::Equals(value.into()),
        }
    }

    /// Stop when the string under `key` contains `needle`.
    pub fn contains(name: &'static str, key: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            name,
            key: key.into(),
            rule: ExitRule::Contains(needle.into()),
        }
    }
}

impl Stage for ExitWhen {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
        let hit = match &self.rule {
            ExitRule::Equals(sentinel) => board.get(&self.key) == Some(sentinel),
            ExitRule::Contains(needle) => board
                .get_str(&self.key)
                .is_some_and(|s| s.contains(needle.as_str())),
        };

        if hit {
            ctx.emit(json!({ "exit": self.key }));
            Ok(Outcome::Terminate)
        } else {
            Ok(Outcome::Continue)
        }
    }
}

// ---------------------------------------------------------------------------
// RequireKey
// ---------------------------------------------------------------------------

/// Fails the run unless an earlier stage produced `key`.
pub struct RequireKey {
    name: &'static str,
    key: String,
}

impl RequireKey {
    pub fn new(name: &'static str, key: impl Into<String>) -> Self {
        Self {
            name,
            key: key.into(),
        }
    }
}

impl Stage for RequireKey {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, board: &mut Blackboard, _ctx: &mut Ctx) -> StepResult {
        if board.is_present(&self.key) {
            Ok(Outcome::Continue)
        } else {
            Err(StepError::invalid(format!(
                "required key '{}' is missing or empty",
                self.key
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Retrying
// ---------------------------------------------------------------------------

/// Re-runs the wrapped stage on [`StepError::Transient`], up to
/// `max_retries` extra attempts with a fixed wait in between.
pub struct Retrying<S> {
    inner: S,
    max_retries: usize,
    wait: Duration,
}

impl<S: Stage> Retrying<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_retries: 3,
            wait: Duration::from_millis(200),
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl<S: Stage> Stage for Retrying<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
        let mut retries = 0;
        let emitted = ctx.events().len();
        loop {
            match self.inner.run(board, ctx) {
                Err(err) if err.is_transient() && retries < self.max_retries => {
                    // Don't sleep past the deadline.
                    if ctx.remaining().is_some_and(|left| left < self.wait) {
                        return Err(err);
                    }
                    ctx.truncate_events(emitted);
                    retries += 1;
                    warn!(stage = self.inner.name(), retries, error = %err, "retrying stage");
                    std::thread::sleep(self.wait);
                    ctx.check_cancelled()?;
                }
                result => return result,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HttpStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Calls a REST endpoint and stores the JSON response under `output_key`.
///
/// The URL is a template rendered against the blackboard, so
/// `https://host/objects/{object_id}` picks up `object_id`.
pub struct HttpStage {
    name: &'static str,
    method: Method,
    url: String,
    body_key: Option<String>,
    query_key: Option<String>,
    output_key: String,
}

impl HttpStage {
    pub fn new(
        name: &'static str,
        method: Method,
        url: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            name,
            method,
            url: url.into(),
            body_key: None,
            query_key: None,
            output_key: output_key.into(),
        }
    }

    /// Send the value under `key` as the JSON request body.
    pub fn with_body_from(mut self, key: impl Into<String>) -> Self {
        self.body_key = Some(key.into());
        self
    }

    /// Build the query string of a GET request from the object under `key`.
    /// Array values repeat their parameter, so `{"id": [3, 5]}` sends
    /// `?id=3&id=5`.
    pub fn with_query_from(mut self, key: impl Into<String>) -> Self {
        self.query_key = Some(key.into());
        self
    }
}

fn query_pairs(value: &Value) -> Result<Vec<(String, String)>, StepError> {
    let Value::Object(params) = value else {
        return Err(StepError::invalid("query parameters must be a JSON object"));
    };

    let mut pairs = Vec::new();
    for (name, value) in params {
        match value {
            Value::Array(items) => {
                pairs.extend(items.iter().map(|item| (name.clone(), query_value(item))));
            }
            other => pairs.push((name.clone(), query_value(other))),
        }
    }
    Ok(pairs)
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Stage for HttpStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, board: &mut Blackboard, ctx: &mut Ctx) -> StepResult {
        let url = tools::render(&self.url, board)?;
        let body = match &self.body_key {
            Some(key) => board
                .get(key)
                .cloned()
                .ok_or_else(|| StepError::invalid(format!("request body key '{key}' is missing")))?,
            None => Value::Null,
        };
        let query = match &self.query_key {
            Some(key) => match board.get(key) {
                Some(params) => query_pairs(params)?,
                None => return Err(StepError::invalid(format!("query key '{key}' is missing"))),
            },
            None => Vec::new(),
        };
        ctx.check_cancelled()?;

        let response = match self.method {
            Method::Get => {
                let query: Vec<(&str, &str)> =
                    query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                tools::http_get_with_query(&url, &query)?
            }
            Method::Post => tools::http_post_json(&url, &body)?,
            Method::Put => tools::http_put_json(&url, &body)?,
            Method::Patch => tools::http_patch_json(&url, &body)?,
            Method::Delete => tools::http_delete(&url)?,
        };

        ctx.emit(json!({ "method": format!("{:?}", self.method), "url": url }));
        board.set(self.output_key.clone(), response);
        Ok(Outcome::Continue)
    }
}
