//! The request-handling service: auth gate, fan-out, response synthesis.

use crate::auth::{self, AuthDecision};
use crate::config::RelayConfig;
use crate::dispatch::{AggregateResult, Dispatcher, OutcomeStatus};
use crate::errors::{RelayError, Result};
use crate::metrics_defs;
use crate::synthesize::synthesize;
use crate::targets::Targets;
use http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const RELAYED_METHODS: &[Method] = &[Method::GET, Method::POST, Method::PUT, Method::DELETE];

#[derive(Clone)]
pub struct RelayService {
    config: Arc<RelayConfig>,
    targets: Targets,
    dispatcher: Dispatcher,
}

impl RelayService {
    pub fn new(config: Arc<RelayConfig>) -> Result<Self> {
        let targets = Targets::from_config(&config)
            .map_err(|e| RelayError::InternalError(e.to_string()))?;
        let dispatcher = Dispatcher::new(config.timeout)?;
        Ok(Self {
            config,
            targets,
            dispatcher,
        })
    }

    /// Handles one inbound request end to end and records the access log
    /// line and duration metric.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Bytes>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();

        let response = self.route(parts, body).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms,
            "handled request"
        );
        shared::histogram!(
            metrics_defs::REQUEST_DURATION,
            "status" => response.status().as_u16().to_string()
        )
        .record(elapsed_ms as f64);

        response
    }

    async fn route<B>(&self, parts: Parts, body: B) -> Response<Bytes>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        if parts.method == Method::GET && parts.uri.path() == "/" {
            return self.redirect_to_primary();
        }

        if !RELAYED_METHODS.contains(&parts.method) {
            return shared::http::make_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if auth::check(authorization, &self.config) == AuthDecision::Denied {
            shared::counter!(metrics_defs::AUTH_DENIED).increment(1);
            return json_error(StatusCode::UNAUTHORIZED, "invalid api key");
        }

        if self.targets.is_empty() {
            tracing::error!("no instances configured");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "no instances configured");
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let error = RelayError::RequestBodyError(e.to_string());
                tracing::warn!(error = %error, "rejecting request");
                return json_error(StatusCode::BAD_REQUEST, error.kind());
            }
        };

        let path = parts.uri.path().to_string();
        let result = self.dispatcher.dispatch(&parts, body_bytes, &self.targets).await;
        self.report_outcomes(&result);

        synthesize(&result, &path, &self.config.time_text)
    }

    fn redirect_to_primary(&self) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
        if let Ok(location) = self.targets.primary().base_url.as_str().parse() {
            response.headers_mut().insert(LOCATION, location);
        }
        response
    }

    /// Non-primary outcomes never shape the caller's response; they are
    /// reported here instead.
    fn report_outcomes(&self, result: &AggregateResult) {
        let primary = result.primary();
        let primary_succeeded = match &primary.status {
            OutcomeStatus::Success { status, .. } => status.is_success(),
            OutcomeStatus::Failure(error) => {
                shared::counter!(metrics_defs::UPSTREAM_FAILURES, "kind" => error.kind())
                    .increment(1);
                tracing::error!(
                    instance = %primary.target.base_url,
                    error = %error,
                    elapsed_ms = primary.elapsed.as_millis() as u64,
                    "primary instance dispatch failed"
                );
                false
            }
        };

        for (index, outcome) in result.outcomes().iter().enumerate() {
            if index == result.primary_index() {
                continue;
            }
            match &outcome.status {
                OutcomeStatus::Failure(error) => {
                    shared::counter!(metrics_defs::UPSTREAM_FAILURES, "kind" => error.kind())
                        .increment(1);
                    tracing::warn!(
                        instance = %outcome.target.base_url,
                        error = %error,
                        elapsed_ms = outcome.elapsed.as_millis() as u64,
                        "secondary instance dispatch failed"
                    );
                }
                OutcomeStatus::Success { status, .. } => {
                    if status.is_success() != primary_succeeded {
                        tracing::warn!(
                            instance = %outcome.target.base_url,
                            status = status.as_u16(),
                            "secondary instance status disagrees with primary"
                        );
                    }
                }
            }
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response<Bytes> {
    let body = serde_json::json!({ "error": message });
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<BoxBody<Bytes, RelayError>>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            let (parts, body) = service.handle(req).await.into_parts();
            Ok(Response::from_parts(
                parts,
                Full::new(body).map_err(|e| match e {}).boxed(),
            ))
        })
    }
}
