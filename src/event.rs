use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A progress event emitted by a stage and forwarded to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the stage that emitted the event.
    pub author: String,
    pub payload: Value,
}

impl Event {
    pub fn new(author: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            author: author.into(),
            payload: payload.into(),
        }
    }

    /// The payload if it is plain text.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }
}
