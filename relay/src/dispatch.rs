//! Concurrent fan-out of one inbound request to every configured instance.
//!
//! Each target gets its own task, its own rebuilt Authorization header, and
//! its own deadline. The dispatcher waits for every task to finish — success
//! or failure — and reports outcomes in configured order, so the aggregate
//! wait is bounded by one timeout rather than the sum, and a broken instance
//! can never delay or abort delivery to its siblings. The tasks are detached
//! from the dispatch future: a caller that disconnects mid-flight drops the
//! aggregate, not the sends already in progress. One attempt per target;
//! retry policy belongs to callers, not here.

use crate::auth::basic_header_value;
use crate::errors::{RelayError, Result};
use crate::http::send_to_upstream;
use crate::targets::{InstanceTarget, Targets};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode, request::Parts};
use hyper::body::Bytes;
use shared::headers::filter_hop_by_hop;
use std::time::{Duration, Instant};

/// Relay identifier appended to forwarded user agents.
pub const AGENT_SUFFIX: &str = concat!(" pulse-relay/", env!("CARGO_PKG_VERSION"));

/// How one instance answered (or failed to answer) a relayed request.
#[derive(Debug)]
pub enum OutcomeStatus {
    Success {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Failure(RelayError),
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Success { .. })
    }
}

/// Result of relaying to a single instance.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub target: InstanceTarget,
    pub status: OutcomeStatus,
    pub elapsed: Duration,
}

/// All per-instance outcomes for one inbound request, in configured order.
#[derive(Debug)]
pub struct AggregateResult {
    outcomes: Vec<DispatchOutcome>,
    primary_index: usize,
}

impl AggregateResult {
    pub(crate) fn new(outcomes: Vec<DispatchOutcome>, primary_index: usize) -> Self {
        Self {
            outcomes,
            primary_index,
        }
    }

    pub fn outcomes(&self) -> &[DispatchOutcome] {
        &self.outcomes
    }

    pub fn primary_index(&self) -> usize {
        self.primary_index
    }

    pub fn primary(&self) -> &DispatchOutcome {
        &self.outcomes[self.primary_index]
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl Dispatcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: crate::http::build_client()?,
            timeout_secs,
        })
    }

    /// Fans the request out to every target and waits for all outcomes.
    pub async fn dispatch(&self, parts: &Parts, body: Bytes, targets: &Targets) -> AggregateResult {
        let started = Instant::now();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let body = if is_heartbeat(&parts.method, parts.uri.path(), &parts.headers) {
            patch_heartbeat_user_agents(&body).unwrap_or(body)
        } else {
            body
        };

        // Detached tasks: dropping the aggregate future (caller disconnect)
        // leaves in-flight sends running to completion.
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets.iter() {
            let headers = build_outbound_headers(parts, target);
            let client = self.client.clone();
            let method = parts.method.clone();
            let path_and_query = path_and_query.clone();
            let body = body.clone();
            let target = target.clone();
            let timeout_secs = self.timeout_secs;

            handles.push(tokio::spawn(async move {
                let call_started = Instant::now();
                let result = send_to_upstream(
                    &client,
                    &target.base_url,
                    method,
                    &path_and_query,
                    headers,
                    body,
                    timeout_secs,
                )
                .await;
                (target, result, call_started.elapsed())
            }));
        }

        // Awaiting in configured order; the tasks themselves all run already
        let mut outcomes = Vec::with_capacity(targets.len());
        for (slot, (target, handle)) in targets.iter().zip(handles).enumerate() {
            match handle.await {
                Ok((target, result, elapsed)) => {
                    let status = match result {
                        Ok(response) => {
                            let (parts, body) = response.into_parts();
                            OutcomeStatus::Success {
                                status: parts.status,
                                headers: parts.headers,
                                body,
                            }
                        }
                        Err(e) => OutcomeStatus::Failure(e),
                    };
                    outcomes.push(DispatchOutcome {
                        target,
                        status,
                        elapsed,
                    });
                }
                Err(e) => {
                    // A panicked task still gets a reported outcome
                    tracing::error!(error = %e, slot, "dispatch task failed");
                    outcomes.push(DispatchOutcome {
                        target: target.clone(),
                        status: OutcomeStatus::Failure(RelayError::InternalError(
                            "dispatch task failed before completing".to_string(),
                        )),
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        AggregateResult::new(outcomes, targets.primary_index())
    }
}

/// Heartbeat submissions are JSON POSTs to the heartbeats endpoint.
pub fn is_heartbeat(method: &Method, path: &str, headers: &HeaderMap) -> bool {
    let json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    json && method == Method::POST
        && (path.ends_with("/users/current/heartbeats")
            || path.ends_with("/users/current/heartbeats.bulk"))
}

// Tags each heartbeat's user_agent field with the relay suffix so upstreams
// can tell relayed traffic apart. Returns None (leaving the body untouched)
// when the payload is not the expected array shape.
fn patch_heartbeat_user_agents(body: &Bytes) -> Option<Bytes> {
    let mut payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %e, "failed to decode heartbeat body");
            return None;
        }
    };

    let heartbeats = payload.as_array_mut()?;
    for heartbeat in heartbeats {
        if let Some(agent) = heartbeat.get_mut("user_agent")
            && let Some(value) = agent.as_str()
        {
            *agent = serde_json::Value::String(format!("{value}{AGENT_SUFFIX}"));
        }
    }

    match serde_json::to_vec(&payload) {
        Ok(patched) => Some(Bytes::from(patched)),
        Err(e) => {
            tracing::error!(error = %e, "failed to re-encode heartbeat body");
            None
        }
    }
}

/// Copies the inbound headers for one target: hop-by-hop headers and the
/// inbound Host/Content-Length are dropped, the Authorization header is
/// rebuilt from the target's own credential, and the relay tags the user
/// agent. The caller's presented key never leaves the relay.
fn build_outbound_headers(parts: &Parts, target: &InstanceTarget) -> HeaderMap {
    let mut headers = parts.headers.clone();
    filter_hop_by_hop(&mut headers, parts.version);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    let user_agent = match headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}{AGENT_SUFFIX}"),
        None => AGENT_SUFFIX.trim_start().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&user_agent) {
        headers.insert(USER_AGENT, value);
    }

    match HeaderValue::from_str(&basic_header_value(&target.credential)) {
        Ok(value) => {
            headers.insert(AUTHORIZATION, value);
        }
        Err(_) => {
            headers.remove(AUTHORIZATION);
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use http::Request;
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioExecutor;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    struct RecordedRequest {
        path: String,
        authorization: Option<String>,
        user_agent: Option<String>,
        body: Bytes,
    }

    type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

    /// Mock instance that records every request and answers with a fixed
    /// body after an optional delay.
    async fn start_instance(
        status: StatusCode,
        response_body: &'static str,
        delay: Duration,
    ) -> (u16, RequestLog) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let server_log = log.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                let log = server_log.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let log = log.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let header = |name| {
                                parts
                                    .headers
                                    .get(name)
                                    .and_then(|v: &HeaderValue| v.to_str().ok())
                                    .map(str::to_string)
                            };
                            log.lock().await.push(RecordedRequest {
                                path: parts.uri.path().to_string(),
                                authorization: header(AUTHORIZATION),
                                user_agent: header(USER_AGENT),
                                body,
                            });

                            tokio::time::sleep(delay).await;
                            let mut response =
                                http::Response::new(Full::new(Bytes::from(response_body)));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        (port, log)
    }

    fn targets_for(instances: &[(u16, &str)]) -> Targets {
        let mut config: RelayConfig =
            toml::from_str("[instances]\n\"https://placeholder.example.com\" = \"k\"\n").unwrap();
        config.instances = instances
            .iter()
            .map(|(port, key)| (format!("http://127.0.0.1:{port}"), key.to_string()))
            .collect();
        Targets::from_config(&config).unwrap()
    }

    fn heartbeat_parts() -> Parts {
        let (parts, ()) = Request::builder()
            .method(Method::POST)
            .uri("/users/current/heartbeats")
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, "wakatime/1.0 vscode")
            .header(AUTHORIZATION, basic_header_value("inbound-relay-key"))
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn heartbeat_body() -> Bytes {
        Bytes::from(
            serde_json::to_vec(&serde_json::json!([
                {"entity": "main.rs", "type": "file", "user_agent": "wakatime/1.0 vscode"}
            ]))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_one_outcome_per_target_in_configured_order() {
        let (port_a, _) = start_instance(StatusCode::CREATED, r#"{"id":"a"}"#, Duration::ZERO).await;
        let (port_b, _) = start_instance(StatusCode::ACCEPTED, r#"{"id":"b"}"#, Duration::ZERO).await;
        let (port_c, _) = start_instance(StatusCode::OK, r#"{"id":"c"}"#, Duration::ZERO).await;

        let targets = targets_for(&[(port_a, "ka"), (port_b, "kb"), (port_c, "kc")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        let result = dispatcher
            .dispatch(&heartbeat_parts(), heartbeat_body(), &targets)
            .await;

        assert_eq!(result.outcomes().len(), 3);
        assert_eq!(result.primary_index(), 0);

        let bodies: Vec<_> = result
            .outcomes()
            .iter()
            .map(|outcome| match &outcome.status {
                OutcomeStatus::Success { body, .. } => body.clone(),
                OutcomeStatus::Failure(e) => panic!("unexpected failure: {e}"),
            })
            .collect();
        assert_eq!(bodies[0].as_ref(), br#"{"id":"a"}"#);
        assert_eq!(bodies[1].as_ref(), br#"{"id":"b"}"#);
        assert_eq!(bodies[2].as_ref(), br#"{"id":"c"}"#);
    }

    #[tokio::test]
    async fn test_dispatch_is_parallel_not_serial() {
        let delay = Duration::from_millis(500);
        let (port_a, _) = start_instance(StatusCode::OK, "{}", delay).await;
        let (port_b, _) = start_instance(StatusCode::OK, "{}", delay).await;
        let (port_c, _) = start_instance(StatusCode::OK, "{}", delay).await;

        let targets = targets_for(&[(port_a, "ka"), (port_b, "kb"), (port_c, "kc")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        let started = Instant::now();
        let result = dispatcher
            .dispatch(&heartbeat_parts(), heartbeat_body(), &targets)
            .await;
        let elapsed = started.elapsed();

        assert!(result.outcomes().iter().all(|o| o.status.is_success()));
        // Serial execution would take at least 3x the per-instance delay
        assert!(
            elapsed < Duration::from_millis(1100),
            "dispatch took {elapsed:?}, expected one delay's worth"
        );
    }

    /// Mock instance that accepts connections but never answers.
    async fn start_silent_instance() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });

        port
    }

    #[tokio::test]
    async fn test_primary_timeout_does_not_mask_secondary_success() {
        let port_a = start_silent_instance().await;
        let (port_b, _) = start_instance(StatusCode::OK, r#"{"id":"b"}"#, Duration::ZERO).await;

        let mut config: RelayConfig =
            toml::from_str("[instances]\n\"https://placeholder.example.com\" = \"k\"\n").unwrap();
        config.instances = [
            (format!("http://127.0.0.1:{port_a}"), "ka".to_string()),
            (format!("http://127.0.0.1:{port_b}"), "kb".to_string()),
        ]
        .into_iter()
        .collect();
        let targets = Targets::from_config(&config).unwrap();

        let dispatcher = Dispatcher::new(1).unwrap();
        let result = dispatcher
            .dispatch(&heartbeat_parts(), heartbeat_body(), &targets)
            .await;

        assert_eq!(result.outcomes().len(), 2);
        assert!(matches!(
            result.primary().status,
            OutcomeStatus::Failure(RelayError::UpstreamTimeout(_))
        ));
        assert!(result.outcomes()[1].status.is_success());
    }

    #[tokio::test]
    async fn test_each_target_gets_only_its_own_credential() {
        let (port_a, log_a) = start_instance(StatusCode::OK, "{}", Duration::ZERO).await;
        let (port_b, log_b) = start_instance(StatusCode::OK, "{}", Duration::ZERO).await;

        let targets = targets_for(&[(port_a, "key-one"), (port_b, "key-two")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        dispatcher
            .dispatch(&heartbeat_parts(), heartbeat_body(), &targets)
            .await;

        let seen_a = log_a.lock().await;
        let seen_b = log_b.lock().await;
        // Exactly one attempt per target
        assert_eq!(seen_a.len(), 1);
        assert_eq!(seen_b.len(), 1);

        assert_eq!(
            seen_a[0].authorization.as_deref(),
            Some(basic_header_value("key-one").as_str())
        );
        assert_eq!(
            seen_b[0].authorization.as_deref(),
            Some(basic_header_value("key-two").as_str())
        );
        // The caller's presented key is never forwarded
        let inbound = basic_header_value("inbound-relay-key");
        assert_ne!(seen_a[0].authorization.as_deref(), Some(inbound.as_str()));
        assert_ne!(seen_b[0].authorization.as_deref(), Some(inbound.as_str()));
    }

    #[tokio::test]
    async fn test_dropped_dispatch_leaves_sends_in_flight() {
        let (port, log) =
            start_instance(StatusCode::CREATED, "{}", Duration::from_millis(200)).await;
        let targets = targets_for(&[(port, "ka")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        // A zero timeout polls the dispatch future once (spawning the
        // tasks) and then drops it, like a caller disconnecting.
        let dropped = tokio::time::timeout(
            Duration::ZERO,
            dispatcher.dispatch(&heartbeat_parts(), heartbeat_body(), &targets),
        )
        .await;
        assert!(dropped.is_err());

        // The detached send still reaches the instance
        tokio::time::sleep(Duration::from_millis(500)).await;
        let seen = log.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/users/current/heartbeats");
    }

    #[tokio::test]
    async fn test_heartbeat_user_agent_tagging() {
        let (port, log) = start_instance(StatusCode::CREATED, "{}", Duration::ZERO).await;
        let targets = targets_for(&[(port, "ka")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        dispatcher
            .dispatch(&heartbeat_parts(), heartbeat_body(), &targets)
            .await;

        let seen = log.lock().await;
        assert_eq!(seen[0].path, "/users/current/heartbeats");

        let agent = seen[0].user_agent.as_deref().unwrap();
        assert!(agent.starts_with("wakatime/1.0 vscode"));
        assert!(agent.ends_with(AGENT_SUFFIX.trim_start()));

        let payload: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
        let patched_agent = payload[0]["user_agent"].as_str().unwrap();
        assert!(patched_agent.starts_with("wakatime/1.0 vscode"));
        assert!(patched_agent.contains("pulse-relay/"));
    }

    #[tokio::test]
    async fn test_non_heartbeat_body_forwarded_verbatim() {
        let (port, log) = start_instance(StatusCode::OK, "{}", Duration::ZERO).await;
        let targets = targets_for(&[(port, "ka")]);
        let dispatcher = Dispatcher::new(5).unwrap();

        let (parts, ()) = Request::builder()
            .method(Method::GET)
            .uri("/users/current/statusbar/today")
            .header(CONTENT_TYPE, "application/json")
            .body(())
            .unwrap()
            .into_parts();

        let body = Bytes::from_static(b"{\"opaque\":true}");
        dispatcher.dispatch(&parts, body.clone(), &targets).await;

        let seen = log.lock().await;
        assert_eq!(seen[0].body, body);
    }

    #[test]
    fn test_is_heartbeat() {
        let json_headers = {
            let mut h = HeaderMap::new();
            h.insert(CONTENT_TYPE, "application/json".parse().unwrap());
            h
        };

        assert!(is_heartbeat(
            &Method::POST,
            "/users/current/heartbeats",
            &json_headers
        ));
        assert!(is_heartbeat(
            &Method::POST,
            "/users/current/heartbeats.bulk",
            &json_headers
        ));
        assert!(!is_heartbeat(
            &Method::GET,
            "/users/current/heartbeats",
            &json_headers
        ));
        assert!(!is_heartbeat(
            &Method::POST,
            "/users/current/statusbar/today",
            &json_headers
        ));
        assert!(!is_heartbeat(
            &Method::POST,
            "/users/current/heartbeats",
            &HeaderMap::new()
        ));
    }
}
