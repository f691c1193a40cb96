use crate::payload::{IngressPayload, Payload, ServicePorts};
use crate::tls::{load_certified_key, CertificateError};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use thiserror::Error;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Assembles the payload for the server from the cluster objects listed by
/// the watcher. Certificates that cannot be loaded are logged and left out,
/// so the affected hosts fail their TLS handshake while the rest keep working.
pub fn build_payload(ingresses: Vec<Ingress>, services: &[Service], secrets: &[Secret]) -> Payload {
    let ports_by_namespace = service_ports(services);
    let mut payload = Payload::default();

    for ingress in ingresses {
        let namespace = ingress.metadata.namespace.clone().unwrap_or_default();

        if let Some(spec) = &ingress.spec {
            for tls in &spec.tls {
                let secret_name = match &tls.secret_name {
                    Some(name) => name,
                    None => continue,
                };

                match certificate(secrets, &namespace, secret_name) {
                    Ok(certificate) => {
                        let certificate = Arc::new(certificate);
                        for host in &tls.hosts {
                            payload
                                .tls_certificates
                                .insert(host.clone(), certificate.clone());
                        }
                    }
                    Err(e) => warn!("Secret {}/{}: {}", namespace, secret_name, e),
                }
            }
        }

        payload.ingresses.push(IngressPayload {
            ingress,
            service_ports: ports_by_namespace.get(&namespace).cloned().unwrap_or_default(),
        });
    }

    payload
}

/// Named ports of every service, grouped by namespace.
fn service_ports(services: &[Service]) -> HashMap<String, ServicePorts> {
    let mut by_namespace: HashMap<String, ServicePorts> = HashMap::new();

    for service in services {
        let name = match &service.metadata.name {
            Some(name) => name,
            None => continue,
        };
        let namespace = service.metadata.namespace.clone().unwrap_or_default();

        let mut ports = HashMap::new();
        if let Some(spec) = &service.spec {
            for port in &spec.ports {
                let port_name = match &port.name {
                    Some(port_name) if !port_name.is_empty() => port_name,
                    _ => continue,
                };
                match u16::try_from(port.port) {
                    Ok(number) => {
                        ports.insert(port_name.clone(), number);
                    }
                    Err(_) => warn!("Service {}/{} has an invalid port {}.", namespace, name, port.port),
                }
            }
        }

        by_namespace
            .entry(namespace)
            .or_default()
            .insert(name.clone(), ports);
    }

    by_namespace
}

fn certificate(
    secrets: &[Secret],
    namespace: &str,
    name: &str,
) -> Result<tokio_rustls::rustls::sign::CertifiedKey, SecretError> {
    let secret = secrets
        .iter()
        .find(|secret| {
            secret.metadata.name.as_deref() == Some(name)
                && secret.metadata.namespace.as_deref().unwrap_or_default() == namespace
        })
        .ok_or(SecretError::NotFound)?;

    let cert = secret
        .data
        .get(TLS_CERT_KEY)
        .ok_or(SecretError::MissingData(TLS_CERT_KEY))?;
    let key = secret
        .data
        .get(TLS_PRIVATE_KEY_KEY)
        .ok_or(SecretError::MissingData(TLS_PRIVATE_KEY_KEY))?;

    Ok(load_certified_key(&cert.0, &key.0)?)
}

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("The secret does not exist.")]
    NotFound,
    #[error("The secret does not contain `{0}`.")]
    MissingData(&'static str),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}
