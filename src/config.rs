use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::ldap_protocol::START_TLS_OID;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tls: Option<TlsConfig>,
    /// Accepted simple-bind credentials as "name:password".
    #[serde(default = "default_credentials")]
    pub credentials: Vec<String>,
    /// Whether a bind with empty name and empty password succeeds.
    #[serde(default = "default_true")]
    pub anonymous_bind: bool,
    #[serde(default)]
    pub root_dse: RootDseConfig,
    pub telemetry: Option<TelemetryConfig>,
    /// Optional HTTP listen address for metrics and health (e.g. "127.0.0.1:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Plain listener; STARTTLS is offered when `tls` is configured.
    pub url: String,
    /// Optional implicit-TLS listener.
    pub ldaps_url: Option<String>,
}

/// PEM certificate and key. Without this section a self-signed certificate is generated at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Attributes advertised by the RootDSE entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootDseConfig {
    pub naming_contexts: Vec<String>,
    pub supported_ldap_version: Vec<String>,
    pub supported_extension: Vec<String>,
    pub vendor_name: Vec<String>,
    pub vendor_version: Vec<String>,
}

impl Default for RootDseConfig {
    fn default() -> Self {
        Self {
            naming_contexts: vec!["dc=example,dc=com".to_string()],
            supported_ldap_version: vec!["2".to_string(), "3".to_string()],
            supported_extension: vec![START_TLS_OID.to_string()],
            vendor_name: vec!["Jerry inc.".to_string()],
            vendor_version: vec!["Jerry's directory server v2.0.0".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Append events as JSON lines here instead of logging them.
    pub events_file: Option<String>,
}

fn default_credentials() -> Vec<String> {
    vec!["root:root".to_string()]
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for cred in &self.credentials {
            if !cred.contains(':') {
                bail!("Credential {:?} must have the form name:password", cred);
            }
        }
        if !self.listen.url.starts_with("ldap://") && !self.listen.url.starts_with("ldaps://") {
            bail!("Listen URL {:?} must start with ldap:// or ldaps://", self.listen.url);
        }
        if let Some(url) = &self.listen.ldaps_url {
            if !url.starts_with("ldaps://") {
                bail!("ldaps_url {:?} must start with ldaps://", url);
            }
        }
        Ok(())
    }

    pub fn events_file(&self) -> Option<&str> {
        self.telemetry.as_ref().and_then(|t| t.events_file.as_deref())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://0.0.0.0:389".to_string(),
                ldaps_url: None,
            },
            tls: None,
            credentials: default_credentials(),
            anonymous_bind: true,
            root_dse: RootDseConfig::default(),
            telemetry: None,
            metrics_listen: None,
        }
    }
}
