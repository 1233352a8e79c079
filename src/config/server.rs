use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// HTTP server configuration for the sign-in host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path that answers 401 until the user has signed in.
    #[serde(default = "default_protected_path")]
    pub protected_path: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Mark the sign-in cookie `Secure`. Enable when the host is reached over
    /// TLS, including behind a TLS-terminating proxy.
    #[serde(default)]
    pub secure_cookies: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protected_path: default_protected_path(),
            timeout_secs: default_timeout(),
            secure_cookies: false,
        }
    }
}

impl ServerConfig {
    pub(super) fn validate(&self) -> Result<(), super::ConfigError> {
        if !self.protected_path.starts_with('/') {
            return Err(super::ConfigError::Validation(format!(
                "server.protected_path must start with '/': {}",
                self.protected_path
            )));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

fn default_protected_path() -> String {
    "/".to_string()
}

fn default_timeout() -> u64 {
    30
}
