//! Master configuration.

use anyhow::{bail, Context, Result};
use labwire_rpc::SslConfig;
use url::Url;

/// A host and port to listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port, 0 picks a free one
    pub port: u16,
}

impl Endpoint {
    /// Parse a `tcp://host:port` URL.
    ///
    /// # Errors
    ///
    /// Returns error for another scheme, a missing host or a missing port.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s).with_context(|| format!("Invalid endpoint URL: {s}"))?;
        if url.scheme() != "tcp" {
            bail!("Unsupported endpoint scheme `{}` in {s}", url.scheme());
        }
        let host = url
            .host_str()
            .with_context(|| format!("Endpoint {s} has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .with_context(|| format!("Endpoint {s} has no port"))?;
        Ok(Self { host, port })
    }

    /// `host:port`, bracketing IPv6 hosts.
    #[must_use]
    pub fn socket_addr(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// RPC endpoint; the other services listen on the same host
    pub listen: Endpoint,

    /// Port of the status publisher
    pub sync_port: u16,

    /// Port of the log broadcaster
    pub broadcast_port: u16,

    /// Port accepting log records forwarded by other processes
    pub log_port: u16,

    /// Description sent to RPC clients
    pub description: String,

    /// Mutual TLS for every service
    pub ssl: Option<SslConfig>,

    /// Offer the built-in `terminate` method
    pub allow_terminate: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 7000,
            },
            sync_port: 7001,
            broadcast_port: 7002,
            log_port: 7003,
            description: "labwire master".to_string(),
            ssl: None,
            allow_terminate: true,
        }
    }
}

impl MasterConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LABWIRE_LISTEN`: RPC endpoint, e.g. `tcp://0.0.0.0:7000`
    /// - `LABWIRE_SYNC_PORT`: status publisher port
    /// - `LABWIRE_BROADCAST_PORT`: log broadcaster port
    /// - `LABWIRE_LOG_PORT`: port receiving forwarded log records
    /// - `LABWIRE_DESCRIPTION`: server description
    /// - `LABWIRE_SSL`: JSON object with `local_cert`, `local_key`, `peer_cert`
    /// - `LABWIRE_ALLOW_TERMINATE`: `true` or `false`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is present but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(listen) = lookup("LABWIRE_LISTEN") {
            config.listen = Endpoint::parse(&listen).context("Invalid LABWIRE_LISTEN")?;
        }

        if let Some(port) = lookup("LABWIRE_SYNC_PORT") {
            config.sync_port = port.parse().context("Invalid LABWIRE_SYNC_PORT")?;
        }

        if let Some(port) = lookup("LABWIRE_BROADCAST_PORT") {
            config.broadcast_port = port.parse().context("Invalid LABWIRE_BROADCAST_PORT")?;
        }

        if let Some(port) = lookup("LABWIRE_LOG_PORT") {
            config.log_port = port.parse().context("Invalid LABWIRE_LOG_PORT")?;
        }

        if let Some(description) = lookup("LABWIRE_DESCRIPTION") {
            config.description = description;
        }

        if let Some(ssl_json) = lookup("LABWIRE_SSL") {
            config.ssl = Some(serde_json::from_str(&ssl_json).context("Invalid LABWIRE_SSL JSON")?);
        }

        if let Some(flag) = lookup("LABWIRE_ALLOW_TERMINATE") {
            config.allow_terminate = flag.parse().context("Invalid LABWIRE_ALLOW_TERMINATE")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = MasterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(Endpoint::parse("tcp://127.0.0.1:7000").unwrap(), config.listen);
        assert_eq!(config.sync_port, 7001);
        assert_eq!(config.log_port, 7003);
        assert!(config.ssl.is_none());
        assert!(config.allow_terminate);
    }

    #[test]
    fn environment_overrides() {
        let config = MasterConfig::from_lookup(lookup(&[
            ("LABWIRE_LISTEN", "tcp://[::1]:9000"),
            ("LABWIRE_SYNC_PORT", "9001"),
            ("LABWIRE_LOG_PORT", "9003"),
            ("LABWIRE_ALLOW_TERMINATE", "false"),
            (
                "LABWIRE_SSL",
                r#"{"local_cert":"a.pem","local_key":"a.key","peer_cert":"b.pem"}"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.listen.host, "::1");
        assert_eq!(config.listen.socket_addr(config.sync_port), "[::1]:9001");
        assert_eq!(config.log_port, 9003);
        assert!(!config.allow_terminate);
        assert_eq!(config.ssl, Some(SslConfig::new("a.pem", "a.key", "b.pem")));
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(Endpoint::parse("http://localhost:80").is_err());
        assert!(Endpoint::parse("tcp://localhost").is_err());
        let err = MasterConfig::from_lookup(lookup(&[("LABWIRE_SYNC_PORT", "lots")])).unwrap_err();
        assert!(err.to_string().contains("LABWIRE_SYNC_PORT"));
    }
}
