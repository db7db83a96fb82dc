//! Configuration model.
//!
//! The JSON document consumed at startup, nested under a top-level `"ssf"`
//! key. The CLI owns file loading and flag merging; this module owns the
//! typed model and its (de)serialization, which must round-trip exactly.
//!
//! Unknown sections are ignored and missing sections default, so old
//! configurations keep working when new sections appear.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// All funnel settings live under the `ssf` key.
    #[serde(default)]
    pub ssf: SsfConfig,
}

impl Config {
    /// Parse a configuration document from JSON text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed JSON or mistyped fields.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize back to JSON text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if serialization fails (it cannot for this
    /// model, but the signature keeps the boundary honest).
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The `ssf` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsfConfig {
    /// TLS context parameters
    #[serde(default)]
    pub tls: TlsConfig,
    /// HTTP proxy traversal; absent means direct connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxyConfig>,
    /// SOCKS proxy traversal; absent means direct connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_proxy: Option<SocksProxyConfig>,
    /// Ordered relay chain; each hop is a fiber relay
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub circuit: Vec<CircuitHop>,
    /// Per-service enablement and parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceEntry>,
}

/// TLS context parameters (`ssf.tls`).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the trusted CA certificate bundle (PEM)
    #[serde(default)]
    pub ca_cert_path: String,
    /// Path to this peer's certificate chain (PEM)
    #[serde(default)]
    pub cert_path: String,
    /// Path to this peer's private key (PEM)
    #[serde(default)]
    pub key_path: String,
    /// Password for an encrypted private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_password: String,
    /// Path to Diffie-Hellman parameters; accepted for compatibility,
    /// unused by the rustls backend
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dh_path: String,
    /// Cipher preference string; logged, the backend negotiates its own
    /// modern suites
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cipher_alg: String,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_path", &self.ca_cert_path)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("key_password", &redacted(&self.key_password))
            .field("dh_path", &self.dh_path)
            .field("cipher_alg", &self.cipher_alg)
            .finish()
    }
}

/// HTTP proxy parameters (`ssf.http_proxy`).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Credential user name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Credential domain (NTLM/Negotiate)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// Credential password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// `User-Agent` header sent with CONNECT requests
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    /// Reuse the session's default NTLM credentials
    #[serde(default)]
    pub reuse_ntlm_credentials: bool,
    /// Reuse the session's default Kerberos/Negotiate credentials
    #[serde(default)]
    pub reuse_kerberos_credentials: bool,
}

impl HttpProxyConfig {
    /// True when a proxy address is actually configured.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// True when explicit credentials are available.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

impl fmt::Debug for HttpProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &redacted(&self.password))
            .field("user_agent", &self.user_agent)
            .field("reuse_ntlm_credentials", &self.reuse_ntlm_credentials)
            .field("reuse_kerberos_credentials", &self.reuse_kerberos_credentials)
            .finish()
    }
}

/// SOCKS proxy parameters (`ssf.socks_proxy`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksProxyConfig {
    /// SOCKS protocol version (4 or 5)
    pub version: u8,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// One hop of the relay circuit (`ssf.circuit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitHop {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
}

/// One entry of `ssf.services`: an enable flag plus free-form parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Whether the service is requested at startup
    #[serde(default)]
    pub enabled: bool,
    /// Service-specific string parameters (addresses, ports, options)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl SsfConfig {
    /// Validate cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidArgument`] for out-of-range values (e.g. a
    /// SOCKS version other than 4 or 5),
    /// [`ConfigError::MissingField`] when an enabled feature lacks its
    /// required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(socks) = &self.socks_proxy {
            if socks.version != 4 && socks.version != 5 {
                return Err(ConfigError::InvalidArgument(format!(
                    "socks_proxy.version must be 4 or 5, got {}",
                    socks.version
                )));
            }
            if socks.host.is_empty() {
                return Err(ConfigError::MissingField("socks_proxy.host"));
            }
        }

        if let Some(proxy) = &self.http_proxy {
            if proxy.host.is_empty() {
                return Err(ConfigError::MissingField("http_proxy.host"));
            }
            if proxy.port == 0 {
                return Err(ConfigError::MissingField("http_proxy.port"));
            }
        }

        for hop in &self.circuit {
            if hop.host.is_empty() {
                return Err(ConfigError::MissingField("circuit.host"));
            }
        }

        Ok(())
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}
