use crate::snapshot::RouteError;
use crate::store::SnapshotStore;
use http::header::{self, HeaderName, InvalidHeaderValue};
use http::uri::{PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Response, StatusCode, Uri, Version};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Forwards requests to the backend selected by the current snapshot.
pub struct Proxy {
    store: Arc<SnapshotStore>,
    client: Client<HttpConnector>,
    upstream_timeout: Duration,
}

impl Proxy {
    pub fn new(store: Arc<SnapshotStore>, upstream_timeout: Duration) -> Self {
        Proxy {
            store,
            client: Client::new(),
            upstream_timeout,
        }
    }

    /// Serves one request. Failures never escape: they become a status response.
    pub async fn handle(&self, req: Request<Body>, remote: SocketAddr, scheme: Scheme) -> Response<Body> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.send(req, remote, &scheme).await {
            Ok(res) => res,
            Err(e) if e.status() == StatusCode::NOT_FOUND => {
                debug!("{} {} from {}: {}", method, uri, remote, e);
                error_response(e.status())
            }
            Err(e) => {
                warn!("{} {} from {}: {}", method, uri, remote, e);
                error_response(e.status())
            }
        }
    }

    async fn send(
        &self,
        mut req: Request<Body>,
        remote: SocketAddr,
        scheme: &Scheme,
    ) -> Result<Response<Body>, RequestError> {
        let host = request_host(&req).ok_or(RequestError::MissingHost)?;

        // The snapshot is loaded once so the whole request sees one generation.
        let snapshot = self.store.current();
        let route = snapshot.route(strip_port(&host), req.uri().path())?;

        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(route.address)
            .path_and_query(path_and_query)
            .build()?;

        debug!("Forwarding {} {} for `{}` to {}.", req.method(), uri, host, route.address);

        let headers = req.headers_mut();
        remove_hop_by_hop(headers);
        append_forwarded_for(headers, remote)?;
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(&host)?);
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_str(scheme.as_str())?);
        if !headers.contains_key(header::HOST) {
            headers.insert(header::HOST, HeaderValue::from_str(&host)?);
        }

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;

        let mut res = tokio::time::timeout(self.upstream_timeout, self.client.request(req))
            .await
            .map_err(|_| RequestError::Timeout(self.upstream_timeout))??;

        remove_hop_by_hop(res.headers_mut());

        Ok(res)
    }
}

/// The host a request is addressed to: the `Host` header, or the authority
/// of an absolute-form URI (HTTP/2 requests carry it there).
fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|authority| authority.as_str().to_string()))
        .filter(|host| !host.is_empty())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets.
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rfind(':') {
        Some(idx) if idx > 0 => &host[..idx],
        _ => host,
    }
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) -> Result<(), InvalidHeaderValue> {
    let client = remote.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client),
        _ => client,
    };
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&value)?);

    Ok(())
}

fn error_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::from(status.canonical_reason().unwrap_or("error")));
    *res.status_mut() = status;
    res
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("The request does not name a host.")]
    MissingHost,
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("Backend request failed: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("Backend did not respond within {0:?}.")]
    Timeout(Duration),
    #[error(transparent)]
    HttpError(#[from] http::Error),
    #[error(transparent)]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::MissingHost => StatusCode::NOT_FOUND,
            RequestError::Route(e) => e.status(),
            RequestError::HyperError(_) => StatusCode::BAD_GATEWAY,
            RequestError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RequestError::HttpError(_) | RequestError::InvalidHeaderValue(_) => StatusCode::BAD_REQUEST,
        }
    }
}
