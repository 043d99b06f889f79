//! Liveness/readiness endpoints served on the admin listener.

use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness flag shared between a listener and its admin service.
///
/// Starts not-ready; the serving side flips it once its own listener is
/// bound, so `/ready` only answers ok when the service can actually accept
/// traffic.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// `/health` answers as long as the process is up; `/ready` consults the
/// shared [`Readiness`] flag. The error type is only there to satisfy
/// [`crate::http::run_http_service`]; the service itself never fails.
pub struct AdminService<E> {
    readiness: Readiness,
    _error: PhantomData<E>,
}

impl<E> AdminService<E> {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            _error: PhantomData,
        }
    }
}

fn respond(path: &str, ready: bool) -> Response<BoxBody<Bytes, Infallible>> {
    let ok = || Response::new(Full::new(Bytes::from("ok\n")).boxed());

    match (path, ready) {
        ("/health", _) => ok(),
        ("/ready", true) => ok(),
        ("/ready", false) => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

impl<E> Service<Request<Incoming>> for AdminService<E>
where
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = respond(req.uri().path(), self.readiness.is_ready());
        Box::pin(async move { Ok(response) })
    }
}
