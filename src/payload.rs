//! What the watcher hands to the server: the Ingress objects in effect, the
//! ports of the services they reference and the certificates for their TLS
//! hosts. Converting a [`Payload`] into a [`Snapshot`] resolves every backend
//! reference it can and leaves the rest to fail per request.

use crate::snapshot::{BackendRef, HostRule, PathRule, Snapshot};
use k8s_openapi::api::networking::v1 as networking;
use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::sign::CertifiedKey;

/// Service name -> port name -> port number.
pub type ServicePorts = HashMap<String, HashMap<String, u16>>;

#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub ingresses: Vec<IngressPayload>,
    pub tls_certificates: HashMap<String, Arc<CertifiedKey>>,
}

#[derive(Debug, Clone, Default)]
pub struct IngressPayload {
    pub ingress: networking::Ingress,
    pub service_ports: ServicePorts,
}

impl TryFrom<Payload> for Snapshot {
    type Error = PayloadError;

    fn try_from(payload: Payload) -> Result<Self, Self::Error> {
        let mut rules: Vec<HostRule> = Vec::new();
        let mut endpoints = HashMap::new();

        for ingress_payload in &payload.ingresses {
            let ingress = &ingress_payload.ingress;
            let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
            let spec = match &ingress.spec {
                Some(spec) => spec,
                None => continue,
            };

            for api_rule in &spec.rules {
                let host = match &api_rule.host {
                    Some(host) if !host.is_empty() => host,
                    _ => {
                        debug!("Skipping ingress rule without a host.");
                        continue;
                    }
                };
                let http = match &api_rule.http {
                    Some(http) => http,
                    None => {
                        debug!("Skipping ingress rule for `{}` without an http section.", host);
                        continue;
                    }
                };

                let mut paths = Vec::with_capacity(http.paths.len());
                for api_path in &http.paths {
                    let (path, port) = parse_path(api_path, namespace)?;

                    if let Some(address) = resolve(&path.backend, port, &ingress_payload.service_ports) {
                        endpoints.insert(path.backend.clone(), address);
                    }
                    paths.push(path);
                }

                match rules.iter_mut().find(|rule| &rule.host == host) {
                    Some(rule) => rule.paths.extend(paths),
                    None => rules.push(HostRule::new(host.as_str(), paths)),
                }
            }
        }

        Ok(Snapshot::new(rules, endpoints, payload.tls_certificates))
    }
}

/// How an Ingress refers to a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortRef {
    Named,
    Number(u16),
}

fn parse_path(
    api_path: &networking::HTTPIngressPath,
    namespace: &str,
) -> Result<(PathRule, PortRef), PayloadError> {
    let prefix = api_path.path.as_deref().filter(|p| !p.is_empty()).unwrap_or("/");

    let service = api_path
        .backend
        .service
        .as_ref()
        .ok_or(PayloadError::NoBackendService)?;
    let port = service.port.as_ref().ok_or(PayloadError::NoServicePort)?;

    let (port_key, port_ref) = match (&port.name, port.number) {
        (Some(name), _) if !name.is_empty() => (name.clone(), PortRef::Named),
        (_, Some(number)) => {
            let number: u16 = number
                .try_into()
                .map_err(|_| PayloadError::InvalidPortNumber(number))?;
            (number.to_string(), PortRef::Number(number))
        }
        _ => return Err(PayloadError::NoServicePort),
    };

    Ok((
        PathRule::new(
            prefix,
            BackendRef::new(service.name.as_str(), port_key).in_namespace(namespace),
        ),
        port_ref,
    ))
}

fn resolve(backend: &BackendRef, port: PortRef, service_ports: &ServicePorts) -> Option<String> {
    let number = match port {
        PortRef::Number(number) => number,
        PortRef::Named => match service_ports
            .get(&backend.service)
            .and_then(|ports| ports.get(&backend.port))
        {
            Some(number) => *number,
            None => {
                debug!("Port of {} is unknown, leaving it unresolved.", backend);
                return None;
            }
        },
    };

    let host = if backend.namespace.is_empty() {
        backend.service.clone()
    } else {
        format!("{}.{}", backend.service, backend.namespace)
    };

    Some(format!("{}:{}", host, number))
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Backend does not have a service defined.")]
    NoBackendService,
    #[error("Service does not have a port defined.")]
    NoServicePort,
    #[error("Service port {0} is out of range.")]
    InvalidPortNumber(i32),
}
