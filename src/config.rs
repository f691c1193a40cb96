use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 80;
const DEFAULT_TLS_PORT: u16 = 443;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Startup parameters of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address both listeners bind to.
    pub host: String,
    /// Plaintext HTTP port.
    pub port: u16,
    /// HTTPS port.
    pub tls_port: u16,
    /// How long in-flight connections may drain after shutdown is requested.
    pub shutdown_timeout: Duration,
    /// How long to wait for a backend's response headers.
    pub upstream_timeout: Duration,
    /// Quiet period the watcher waits for before rebuilding a snapshot.
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_port: DEFAULT_TLS_PORT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl Config {
    /// Reads `INGRESS_*` environment variables, falling back to defaults for
    /// the ones that are not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let parse = |name: &'static str| parse_var::<u64, _>(&lookup, name);

        Ok(Config {
            host: lookup("INGRESS_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "INGRESS_PORT")?.unwrap_or(defaults.port),
            tls_port: parse_var(&lookup, "INGRESS_TLS_PORT")?.unwrap_or(defaults.tls_port),
            shutdown_timeout: parse("INGRESS_SHUTDOWN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            upstream_timeout: parse("INGRESS_UPSTREAM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            debounce: parse("INGRESS_DEBOUNCE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tls_port(mut self, tls_port: u16) -> Self {
        self.tls_port = tls_port;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(None),
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable {name} has an invalid value `{value}`.")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 80);
        assert_eq!(config.tls_port, 443);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("INGRESS_HOST", "127.0.0.1"),
            ("INGRESS_PORT", "8080"),
            ("INGRESS_TLS_PORT", "8443"),
            ("INGRESS_SHUTDOWN_TIMEOUT_SECS", "3"),
            ("INGRESS_DEBOUNCE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.tls_port, 8443);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.upstream_timeout, DEFAULT_UPSTREAM_TIMEOUT);
        assert_eq!(config.debounce, Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = Config::from_lookup(lookup(&[("INGRESS_UPSTREAM_TIMEOUT_SECS", "-1")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "INGRESS_UPSTREAM_TIMEOUT_SECS",
                value: "-1".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_port() {
        let err = Config::from_lookup(lookup(&[("INGRESS_PORT", "eighty")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "INGRESS_PORT",
                value: "eighty".to_string()
            }
        );
    }
}
