#![allow(dead_code)]

use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode};
use simple_ingress::store::SnapshotStore;
use simple_ingress::{BackendRef, Config, HostRule, PathRule, Server, ServerError, Snapshot};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HOST_NAME: &str = "www.example.com";

/// How long the `/slow` backend endpoint takes to answer.
pub const SLOW_RESPONSE: Duration = Duration::from_secs(2);

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn wait_for_port(port: u16) -> bool {
    for _ in 0..200 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Starts a backend that answers with its name. It also echoes the proxy
/// headers it received as `echo-*` response headers, echoes request bodies
/// on `/echo`, streams chunks on `/stream` and answers `/slow` late.
pub fn spawn_backend(name: &'static str) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let make_service = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |req| backend(name, req)))
    });
    let server = hyper::Server::from_tcp(listener).unwrap().serve(make_service);
    tokio::spawn(server);

    addr
}

async fn backend(name: &'static str, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut res = Response::builder().header("x-backend", name);
    for header in ["host", "x-forwarded-for", "x-forwarded-host", "x-forwarded-proto"] {
        if let Some(value) = req.headers().get(header) {
            res = res.header(format!("echo-{}", header), value.clone());
        }
    }
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    res = res.header("echo-path", path);

    let body = match req.uri().path() {
        "/echo" => Body::from(hyper::body::to_bytes(req.into_body()).await.unwrap()),
        "/stream" => {
            let (mut sender, body) = Body::channel();
            tokio::spawn(async move {
                for chunk in ["one,", "two,", "three"] {
                    if sender.send_data(Bytes::from(chunk)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
            body
        }
        "/slow" => {
            tokio::time::sleep(SLOW_RESPONSE).await;
            Body::from(name)
        }
        _ => Body::from(name),
    };

    Ok(res.body(body).unwrap())
}

/// A snapshot for [`HOST_NAME`] with `(prefix, service)` paths, where every
/// service in `endpoints` uses port name `http`.
pub fn snapshot(paths: &[(&str, &str)], endpoints: &[(&str, SocketAddr)]) -> Snapshot {
    let rules = vec![HostRule::new(
        HOST_NAME,
        paths
            .iter()
            .map(|(prefix, service)| PathRule::new(*prefix, BackendRef::new(*service, "http")))
            .collect(),
    )];
    let endpoints = endpoints
        .iter()
        .map(|(service, addr)| (BackendRef::new(*service, "http"), addr.to_string()))
        .collect();

    Snapshot::new(rules, endpoints, HashMap::new())
}

pub struct TestServer {
    pub server: Arc<Server>,
    pub http_port: u16,
    pub tls_port: u16,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

pub fn test_config() -> Config {
    Config::default()
        .with_host("127.0.0.1")
        .with_port(free_port())
        .with_tls_port(free_port())
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_upstream_timeout(Duration::from_secs(5))
}

pub async fn start_server(config: Config) -> TestServer {
    start_server_with_store(config, Arc::new(SnapshotStore::default())).await
}

pub async fn start_server_with_store(config: Config, store: Arc<SnapshotStore>) -> TestServer {
    let http_port = config.port;
    let tls_port = config.tls_port;
    let server = Arc::new(Server::with_store(config, store));
    let shutdown = CancellationToken::new();

    let handle = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    assert!(wait_for_port(http_port).await, "http server never started on {}", http_port);
    assert!(wait_for_port(tls_port).await, "tls server never started on {}", tls_port);

    TestServer {
        server,
        http_port,
        tls_port,
        shutdown,
        handle,
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: hyper::HeaderMap,
    pub body: String,
}

pub async fn send(port: u16, host: &str, req: Request<Body>) -> Reply {
    let (mut parts, body) = req.into_parts();
    parts.uri = format!("http://127.0.0.1:{}{}", port, parts.uri).parse().unwrap();
    parts.headers.insert(HOST, host.parse().unwrap());

    let res = Client::new()
        .request(Request::from_parts(parts, body))
        .await
        .unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();

    Reply {
        status,
        headers,
        body: String::from_utf8(body.to_vec()).unwrap(),
    }
}

pub async fn get(port: u16, host: &str, path: &str) -> Reply {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    send(port, host, req).await
}
