//! Builds the single caller-facing response out of an [`AggregateResult`].
//!
//! Only the primary instance's outcome shapes what the caller sees. The
//! relay deliberately does not fail over to a secondary's success when the
//! primary fails: the primary is the caller's source-of-truth account, and
//! answering from another instance would report state the caller's canonical
//! account never recorded. Secondary outcomes surface through logs and
//! metrics only.

use crate::config::TEXT_PLACEHOLDER;
use crate::dispatch::{AggregateResult, OutcomeStatus};
use crate::errors::RelayError;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Response, StatusCode};
use hyper::body::Bytes;

/// Replaces the placeholder token in a `time_text` template.
pub fn substitute(template: &str, value: &str) -> String {
    template.replace(TEXT_PLACEHOLDER, value)
}

/// Status-bar endpoints whose response text gets the `time_text` treatment.
pub fn is_statusbar_path(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    path.ends_with("/users/current/statusbar/today")
        || path.ends_with("/users/current/status_bar/today")
}

/// Maps the aggregate of all per-instance outcomes to the caller's response.
pub fn synthesize(result: &AggregateResult, path: &str, time_text: &str) -> Response<Bytes> {
    let primary = result.primary();

    match &primary.status {
        OutcomeStatus::Success {
            status,
            headers,
            body,
        } => {
            if is_statusbar_path(path) && status.is_success() {
                match rewrite_time_text(body, time_text) {
                    Ok(rewritten) => response_with(*status, headers, rewritten),
                    Err(detail) => {
                        let error = RelayError::UpstreamMalformedResponse(
                            primary.target.base_url.to_string(),
                            detail,
                        );
                        failure_response(&error)
                    }
                }
            } else {
                response_with(*status, headers, body.clone())
            }
        }
        OutcomeStatus::Failure(error) => failure_response(error),
    }
}

// Applies the time_text template to the response's human-readable text: the
// top-level `text` field and the status-bar `data.grand_total.text` field,
// whichever are present. A body that cannot be parsed is an error: the relay
// never forwards a partially-substituted body.
fn rewrite_time_text(body: &Bytes, template: &str) -> Result<Bytes, String> {
    let mut payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| e.to_string())?;

    for pointer in ["/text", "/data/grand_total/text"] {
        if let Some(field) = payload.pointer_mut(pointer)
            && let Some(value) = field.as_str()
        {
            *field = serde_json::Value::String(substitute(template, value));
        }
    }

    serde_json::to_vec(&payload)
        .map(Bytes::from)
        .map_err(|e| e.to_string())
}

fn response_with(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers.clone();
    response
}

/// Error response for a failed (or unusable) primary outcome. Timeouts map
/// to 504, everything else to 502.
fn failure_response(error: &RelayError) -> Response<Bytes> {
    let status = match error {
        RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };

    let body = serde_json::json!({
        "error": error.kind(),
        "detail": error.to_string(),
    });

    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}
