//! Request handlers.
//!
//! Property endpoints validate in a strict order, first failure wins:
//! property exists (404), operation allowed (405), device reachable (503),
//! body well-formed (400), then the wire operation itself (500/503 on
//! failure, 200 on success).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::modbus::address::{AccessForm, Operation};
use crate::modbus::WriteOutcome;
use crate::ServientContext;

pub const LIVE_BODY: &str = "Service is alive!";
pub const READY_BODY: &str = "Service is ready!";
pub const NOT_READY_BODY: &str = "PLC connection is down, service is not ready!";

pub async fn livez() -> &'static str {
    LIVE_BODY
}

/// Readiness probe. Drives the reachability state machine: the telemetry
/// scheduler starts and stops on the transitions observed here.
pub async fn readyz(State(context): State<Arc<ServientContext>>) -> Response {
    if context.monitor.check().await {
        (StatusCode::OK, READY_BODY).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, NOT_READY_BODY).into_response()
    }
}

pub async fn read_property(
    State(context): State<Arc<ServientContext>>,
    Path(property): Path<String>,
) -> Response {
    let Some(declared) = context.config.device.spec.property(&property) else {
        return not_found(&property);
    };
    let form = declared.form();
    if !form.allows(Operation::ReadProperty) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Property '{property}' is not readable"),
        )
            .into_response();
    }
    if !context.device_available() {
        return not_ready();
    }

    match context.read_property(&property, form).await {
        Ok(value) => Json(json!({ "value": value })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn write_property(
    State(context): State<Arc<ServientContext>>,
    Path(property): Path<String>,
    body: String,
) -> Response {
    let Some(declared) = context.config.device.spec.property(&property) else {
        return not_found(&property);
    };
    let form = declared.form();
    if !form.allows(Operation::WriteProperty) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Property '{property}' is not writable"),
        )
            .into_response();
    }
    if !context.device_available() {
        return not_ready();
    }
    let value = match parse_write_value(&body) {
        Ok(value) => value,
        Err(response) => return response,
    };

    match context.write_property(&property, form, value).await {
        Ok(outcomes) => (StatusCode::OK, describe_outcomes(&outcomes)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Raw form endpoint: operates an ad hoc access form, supporting combined
/// read+write in one call.
pub async fn invoke_form(
    State(context): State<Arc<ServientContext>>,
    body: String,
) -> Response {
    if !context.device_available() {
        return not_ready();
    }

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return bad_request("Request body must be JSON"),
    };
    let Some(form_value) = parsed.get("form") else {
        return bad_request("Request body must contain a 'form' object");
    };
    for field in ["href", "modbus:entity", "op"] {
        if form_value.get(field).is_none() {
            return bad_request(&format!("Form is missing '{field}'"));
        }
    }
    let form: AccessForm = match serde_json::from_value(form_value.clone()) {
        Ok(form) => form,
        Err(e) => return bad_request(&format!("Invalid form: {e}")),
    };
    let value = form_value.get("value").and_then(Value::as_i64);

    let wants_read = form.allows(Operation::ReadProperty);
    let wants_write = form.allows(Operation::WriteProperty);
    if !wants_read && !wants_write {
        return bad_request("Invalid operation");
    }
    if wants_write && value.is_none() {
        return bad_request("Write operation requires an integer 'value'");
    }

    // Write first so a combined call reads back the value it just wrote.
    let mut responses = Value::Null;
    if wants_write {
        let Some(value) = value else {
            return bad_request("Write operation requires an integer 'value'");
        };
        match context.write_form(&form, value).await {
            Ok(outcomes) => {
                responses = if outcomes.len() == 1 {
                    json!(outcomes[0].to_string())
                } else {
                    json!(outcomes.iter().map(ToString::to_string).collect::<Vec<_>>())
                };
            },
            Err(e) => return e.into_response(),
        }
    }

    let mut properties = Value::Null;
    if wants_read {
        match context.read_property(&form.href, &form).await {
            Ok(value) => properties = json!(value),
            Err(e) => return e.into_response(),
        }
    }

    Json(json!({ "properties": properties, "responses": responses })).into_response()
}

/// Server-sent observation stream. Each event is the JSON of one sampled
/// reading; the subscription is pruned from the bus once the stream drops.
pub async fn events(
    State(context): State<Arc<ServientContext>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let id = context.bus.next_subscriber_id();
    let subscription = context.bus.subscribe(id);
    debug!(subscriber = id, "sse stream opened");

    let stream = stream::unfold(subscription, |subscription| async move {
        let mut subscription = subscription?;
        loop {
            // recv() yields every second on idle so a dropped stream is
            // noticed promptly.
            if let Some(event) = subscription.recv().await {
                match Event::default().json_data(&event) {
                    Ok(sse_event) => {
                        return Some((Ok::<_, Infallible>(sse_event), Some(subscription)));
                    },
                    Err(e) => warn!(error = %e, "failed to encode sse event"),
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn parse_write_value(body: &str) -> std::result::Result<i64, Response> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|_| bad_request("Request body must be JSON"))?;
    parsed
        .get("value")
        .and_then(Value::as_i64)
        .ok_or_else(|| bad_request("Request body must contain an integer 'value'"))
}

fn describe_outcomes(outcomes: &[WriteOutcome]) -> String {
    if outcomes.len() == 1 {
        outcomes[0].to_string()
    } else {
        outcomes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn not_found(property: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("Property '{property}' not found"),
    )
        .into_response()
}

fn not_ready() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, NOT_READY_BODY).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}
