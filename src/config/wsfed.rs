use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;
use crate::{
    auth::wsfed::{AuthenticationMode, DEFAULT_AUTHENTICATION_TYPE, DEFAULT_CALLBACK_PATH},
    validation::url::require_https,
};

/// Minimum length of the data protection secret, in bytes.
pub const MIN_SECRET_BYTES: usize = 32;

/// WS-Federation sign-in configuration.
///
/// ```toml
/// [wsfed]
/// metadata_address = "https://sts.contoso.com/FederationMetadata/2007-06/FederationMetadata.xml"
/// wtrealm = "urn:contoso:portal"
///
/// [wsfed.data_protection]
/// secret = "${WSFED_SECRET}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsFederationConfig {
    #[serde(default = "default_authentication_type")]
    pub authentication_type: String,

    /// Display name for sign-in pages.
    #[serde(default)]
    pub caption: Option<String>,

    #[serde(default)]
    pub authentication_mode: AuthenticationMode,

    /// Authentication type stamped on signed-in identities.
    #[serde(default)]
    pub sign_in_as_authentication_type: Option<String>,

    /// Federation metadata document. Signing keys, issuer name and passive
    /// endpoint are read from it when not configured here.
    #[serde(default)]
    pub metadata_address: Option<String>,

    #[serde(default = "default_true")]
    pub require_https_metadata: bool,

    /// Passive requestor endpoint. Overridden by metadata when the document
    /// publishes one.
    #[serde(default)]
    pub issuer_address: Option<String>,

    #[serde(default)]
    pub wtrealm: Option<String>,

    #[serde(default)]
    pub wreply: Option<String>,

    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    #[serde(default)]
    pub valid_issuer: Option<String>,

    #[serde(default)]
    pub valid_audiences: Vec<String>,

    #[serde(default)]
    pub backchannel: BackchannelConfig,

    #[serde(default)]
    pub data_protection: DataProtectionConfig,
}

impl Default for WsFederationConfig {
    fn default() -> Self {
        Self {
            authentication_type: default_authentication_type(),
            caption: None,
            authentication_mode: AuthenticationMode::default(),
            sign_in_as_authentication_type: None,
            metadata_address: None,
            require_https_metadata: true,
            issuer_address: None,
            wtrealm: None,
            wreply: None,
            callback_path: default_callback_path(),
            valid_issuer: None,
            valid_audiences: Vec::new(),
            backchannel: BackchannelConfig::default(),
            data_protection: DataProtectionConfig::default(),
        }
    }
}

impl WsFederationConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.authentication_type.trim().is_empty() {
            return Err(ConfigError::Validation(
                "wsfed.authentication_type must not be empty".into(),
            ));
        }
        if !self.callback_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "wsfed.callback_path must start with '/': {}",
                self.callback_path
            )));
        }
        if self.metadata_address.is_none() && self.issuer_address.is_none() {
            return Err(ConfigError::Validation(
                "wsfed requires metadata_address or issuer_address".into(),
            ));
        }
        if let Some(raw) = &self.metadata_address {
            let url = parse_url("metadata_address", raw)?;
            if self.require_https_metadata {
                require_https(&url).map_err(|e| {
                    ConfigError::Validation(format!(
                        "wsfed.metadata_address: {e} (set require_https_metadata = false to allow {raw})"
                    ))
                })?;
            }
        }
        if let Some(raw) = &self.issuer_address {
            parse_url("issuer_address", raw)?;
        }
        if self.data_protection.secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::Validation(format!(
                "wsfed.data_protection.secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        self.backchannel.validate()
    }
}

/// Outbound HTTP settings for federation metadata retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackchannelConfig {
    /// Overall timeout for one metadata fetch.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// SHA-256 thumbprints (hex, colons allowed). When set, the metadata
    /// server's chain must contain one of these certificates.
    #[serde(default)]
    pub pinned_certificate_thumbprints: Vec<String>,
}

impl Default for BackchannelConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
            pinned_certificate_thumbprints: Vec::new(),
        }
    }
}

impl BackchannelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "wsfed.backchannel.timeout_secs must be greater than 0".into(),
            ));
        }
        for thumbprint in &self.pinned_certificate_thumbprints {
            let digits: String = thumbprint.chars().filter(|c| *c != ':').collect();
            if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Validation(format!(
                    "wsfed.backchannel.pinned_certificate_thumbprints: '{thumbprint}' is not a SHA-256 hex digest"
                )));
            }
        }
        Ok(())
    }
}

/// Key material for protecting sign-in state.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataProtectionConfig {
    /// Shared secret. Every instance behind a load balancer needs the same value.
    #[serde(default)]
    pub secret: String,
}

impl std::fmt::Debug for DataProtectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProtectionConfig")
            .field("secret", &"****")
            .finish()
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw)
        .map_err(|e| ConfigError::Validation(format!("wsfed.{field} is not a valid URL: {e}")))
}

fn default_authentication_type() -> String {
    DEFAULT_AUTHENTICATION_TYPE.to_string()
}

fn default_callback_path() -> String {
    DEFAULT_CALLBACK_PATH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("wsfed/{}", env!("CARGO_PKG_VERSION"))
}
