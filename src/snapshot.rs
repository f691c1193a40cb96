//! The immutable routing and certificate state served by the proxy.
//!
//! A [`Snapshot`] is built once, installed through the
//! [`SnapshotStore`](crate::store::SnapshotStore) and never mutated again.
//! Every request resolves its backend against exactly one snapshot.

use http::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::sign::CertifiedKey;

/// A service and one of its ports, as referenced by an Ingress path. Services
/// are namespaced, so two Ingresses naming `web` in different namespaces refer
/// to different backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendRef {
    pub namespace: String,
    pub service: String,
    pub port: String,
}

impl BackendRef {
    pub fn new(service: impl Into<String>, port: impl Into<String>) -> Self {
        BackendRef {
            namespace: String::new(),
            service: service.into(),
            port: port.into(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        write!(f, "{}:{}", self.service, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub prefix: String,
    pub backend: BackendRef,
}

impl PathRule {
    pub fn new(prefix: impl Into<String>, backend: BackendRef) -> Self {
        PathRule {
            prefix: prefix.into(),
            backend,
        }
    }

    fn matches(&self, path: &str) -> bool {
        path.starts_with(self.prefix.as_str())
    }
}

/// All paths declared for a single hostname, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRule {
    pub host: String,
    pub paths: Vec<PathRule>,
}

impl HostRule {
    pub fn new(host: impl Into<String>, paths: Vec<PathRule>) -> Self {
        HostRule {
            host: host.into(),
            paths,
        }
    }
}

/// A backend selected for a request.
#[derive(Debug, PartialEq, Eq)]
pub struct Route<'a> {
    pub backend: &'a BackendRef,
    pub address: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    rules: Vec<HostRule>,
    endpoints: HashMap<BackendRef, String>,
    certificates: HashMap<String, Arc<CertifiedKey>>,
}

impl Snapshot {
    pub fn new(
        rules: Vec<HostRule>,
        endpoints: HashMap<BackendRef, String>,
        certificates: HashMap<String, Arc<CertifiedKey>>,
    ) -> Self {
        Snapshot {
            rules,
            endpoints,
            certificates,
        }
    }

    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }

    pub fn endpoints(&self) -> &HashMap<BackendRef, String> {
        &self.endpoints
    }

    pub fn certificate(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certificates.get(host).cloned()
    }

    pub fn certificate_hosts(&self) -> impl Iterator<Item = &str> {
        self.certificates.keys().map(String::as_str)
    }

    /// Selects the backend address for `host` and `path`.
    ///
    /// The host must match a rule exactly. Paths are tried in declaration
    /// order and the first prefix match wins, even when a later rule has a
    /// longer prefix.
    pub fn route(&self, host: &str, path: &str) -> Result<Route<'_>, RouteError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.host == host)
            .ok_or_else(|| RouteError::UnknownHost(host.to_string()))?;

        let path_rule = rule
            .paths
            .iter()
            .find(|candidate| candidate.matches(path))
            .ok_or_else(|| RouteError::NoMatchingPath {
                host: host.to_string(),
                path: path.to_string(),
            })?;

        let backend = &path_rule.backend;
        let address = self
            .endpoints
            .get(backend)
            .ok_or_else(|| RouteError::UnresolvedBackend(backend.clone()))?;

        Ok(Route {
            backend,
            address: address.as_str(),
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("No rule for host `{0}`.")]
    UnknownHost(String),
    #[error("No path of host `{host}` matches `{path}`.")]
    NoMatchingPath { host: String, path: String },
    #[error("Backend {0} has no known endpoint.")]
    UnresolvedBackend(BackendRef),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::UnknownHost(_) | RouteError::NoMatchingPath { .. } => StatusCode::NOT_FOUND,
            RouteError::UnresolvedBackend(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
