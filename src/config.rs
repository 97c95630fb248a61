//! Pool configuration.


use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};


/// Workstation name sent when neither the configuration nor the environment provides one.
const FALLBACK_WORKSTATION: &str = "WORKSTATION";


/// The URL scheme, and thereby the transport, used to reach the server.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Which challenge responses the AUTHENTICATE message carries.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseVersion {
    /// LMv1/NTLMv1, or NTLMv1 with a client challenge if the server negotiated extended session
    /// security.
    #[default]
    NtlmV1,

    /// LMv2/NTLMv2 over the server's target information.
    NtlmV2,
}

/// Per-request policy of the pool.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RequestOptions {
    /// How many times a request is re-sent after a transport failure or redirect.
    pub retries: u32,

    /// Whether redirects are followed.
    pub redirect: bool,

    /// Whether absolute URLs must point at the pool's own scheme, host and port.
    pub assert_same_host: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            redirect: true,
            assert_same_host: true,
        }
    }
}

/// Configuration of an NTLM connection pool.
///
/// Every field has a default, so a configuration file only needs to name the host:
///
/// ```
/// let config: ntlmpool::PoolConfig = serde_json::from_str(r#"{
///     "host": "intranet.contoso.com",
///     "auth_path": "/ews/exchange.asmx",
///     "request": { "retries": 5 }
/// }"#).unwrap();
/// assert_eq!(config.port(), 443);
/// assert!(config.request.redirect);
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub scheme: Scheme,
    pub host: String,

    /// Defaults to the scheme's well-known port.
    pub port: Option<u16>,

    /// A path on the server that is protected by NTLM; the handshake is performed against it.
    pub auth_path: String,

    /// The NetBIOS name of this machine as announced to the server. Defaults to the host name.
    pub workstation: Option<String>,

    pub response_version: ResponseVersion,

    /// How many idle connections the pool keeps.
    pub maxsize: usize,

    pub request: RequestOptions,

    /// Bounds the TCP connect and the TLS handshake.
    pub connect_timeout: Option<Duration>,

    /// Bounds every individual socket read and write.
    pub read_timeout: Option<Duration>,

    /// Skips certificate validation. Only for servers with self-signed certificates on a
    /// trusted network.
    pub danger_accept_invalid_certs: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::default(),
            host: String::new(),
            port: None,
            auth_path: "/".to_owned(),
            workstation: None,
            response_version: ResponseVersion::default(),
            maxsize: 1,
            request: RequestOptions::default(),
            connect_timeout: None,
            read_timeout: None,
            danger_accept_invalid_certs: false,
        }
    }
}

impl PoolConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_auth_path(mut self, auth_path: impl Into<String>) -> Self {
        self.auth_path = auth_path.into();
        self
    }

    pub fn with_workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = Some(workstation.into());
        self
    }

    pub fn with_response_version(mut self, response_version: ResponseVersion) -> Self {
        self.response_version = response_version;
        self
    }

    pub fn with_maxsize(mut self, maxsize: usize) -> Self {
        self.maxsize = maxsize;
        self
    }

    pub fn with_request_options(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// The value of the `Host` header: the host name, with the port if it is not the default.
    pub fn authority(&self) -> String {
        if self.port() == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port())
        }
    }

    /// `scheme://authority`, the origin every request of the pool goes to.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    /// The upper-cased workstation name: configured, else taken from the environment.
    pub fn workstation_name(&self) -> String {
        self.workstation.clone()
            .or_else(|| env::var("COMPUTERNAME").ok())
            .or_else(|| env::var("HOSTNAME").ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_WORKSTATION.to_owned())
            .to_uppercase()
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host must not be empty"));
        }
        if !self.auth_path.starts_with('/') {
            return Err(Error::InvalidConfig("auth_path must start with '/'"));
        }
        if self.maxsize == 0 {
            return Err(Error::InvalidConfig("maxsize must be at least 1"));
        }
        Ok(())
    }
}
