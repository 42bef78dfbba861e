use std::time::Duration;

use crate::stage::StepError;
use serde_json::{Value, json};
use ureq::{self, Agent};

fn agent() -> Agent {
    let config = Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(5)))
        .build();

    config.into()
}

/// Send a GET request and return the JSON response body.
pub fn http_get(url: &str) -> Result<Value, StepError> {
    http_get_with_query(url, &[])
}

/// Send a GET request with query pairs (repeated keys allowed) and return
/// the JSON response body.
pub fn http_get_with_query(url: &str, query: &[(&str, &str)]) -> Result<Value, StepError> {
    let mut request = agent().get(url);
    for (key, value) in query {
        request = request.query(*key, *value);
    }

    Ok(request.call()?.body_mut().read_json::<Value>()?)
}

/// Send a POST request with a JSON body and return the JSON response body.
pub fn http_post_json(url: &str, body: &Value) -> Result<Value, StepError> {
    Ok(agent()
        .post(url)
        .send_json(body)?
        .body_mut()
        .read_json::<Value>()?)
}

/// Send a PUT request with a JSON body and return the JSON response body.
pub fn http_put_json(url: &str, body: &Value) -> Result<Value, StepError> {
    Ok(agent()
        .put(url)
        .send_json(body)?
        .body_mut()
        .read_json::<Value>()?)
}

/// Send a PATCH request with a JSON body and return the JSON response body.
pub fn http_patch_json(url: &str, body: &Value) -> Result<Value, StepError> {
    Ok(agent()
        .patch(url)
        .send_json(body)?
        .body_mut()
        .read_json::<Value>()?)
}

/// Send a DELETE request. Returns the JSON body, or the status code when
/// the server sends no body.
pub fn http_delete(url: &str) -> Result<Value, StepError> {
    let mut response = agent().delete(url).call()?;
    let status = response.status().as_u16();
    let body = response.body_mut().read_to_string()?;

    if body.trim().is_empty() {
        Ok(json!({ "status_code": status }))
    } else {
        Ok(serde_json::from_str(&body)?)
    }
}
