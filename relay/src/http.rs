use crate::errors::{RelayError, Result};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, Response};
use hyper::body::Bytes;
use shared::headers::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Builds the outbound HTTP client used for every upstream call.
///
/// Redirects are not followed; an upstream redirect is part of the response
/// the relay passes through.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| RelayError::HttpClientError(e.to_string()))
}

/// Joins an inbound path-and-query onto an instance base URL, keeping any
/// path prefix the base URL carries (e.g. `/api/v1`).
pub fn join_url(base_url: &Url, path_and_query: &str) -> Result<Url> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut url = base_url.clone();
    let joined = format!(
        "{}/{}",
        base_url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    Ok(url)
}

/// Send a request to a single upstream instance with a hard deadline.
///
/// The timeout covers the entire request/response cycle including body
/// collection. Elapsed deadline maps to [`RelayError::UpstreamTimeout`];
/// connection and transport failures map to
/// [`RelayError::UpstreamRequestFailed`]. Hop-by-hop headers are stripped
/// from the response and a Via entry is added; Content-Length is dropped so
/// it is recomputed for the possibly-rewritten body.
pub async fn send_to_upstream(
    client: &reqwest::Client,
    base_url: &Url,
    method: Method,
    path_and_query: &str,
    headers: HeaderMap,
    body: Bytes,
    timeout_secs: u64,
) -> Result<Response<Bytes>> {
    // Host as identifier for error messages, never the credential
    let upstream_identifier = base_url
        .host_str()
        .unwrap_or_else(|| base_url.as_str())
        .to_string();

    let url = join_url(base_url, path_and_query)?;

    let exchange = async {
        let response = client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let version = response.version();
        let response_headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, version, response_headers, body))
    };

    let (status, version, mut response_headers, body) =
        timeout(Duration::from_secs(timeout_secs), exchange)
            .await
            .map_err(|_| RelayError::UpstreamTimeout(upstream_identifier.clone()))?
            .map_err(|e| {
                RelayError::UpstreamRequestFailed(upstream_identifier.clone(), e.to_string())
            })?;

    filter_hop_by_hop(&mut response_headers, version);
    add_via_header(&mut response_headers, version);
    response_headers.remove(CONTENT_LENGTH);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
