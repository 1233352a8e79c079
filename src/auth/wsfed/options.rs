//! Runtime options for the WS-Federation middleware.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use super::{
    backchannel::{BackchannelHttpHandler, PlatformHandlerBuilder},
    certificate::{CertificateValidator, ThumbprintCertificateValidator},
    events::{DefaultEvents, WsFederationEvents},
    token::SecurityTokenValidator,
};
use crate::{
    auth::data_protection::{AuthenticationProperties, SecureDataFormat},
    config::{ConfigError, WsFederationConfig},
};

pub const DEFAULT_AUTHENTICATION_TYPE: &str = "Federation";
pub const DEFAULT_CALLBACK_PATH: &str = "/signin-wsfed";
pub const DEFAULT_BACKCHANNEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether the middleware turns downstream 401 responses into sign-in redirects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMode {
    /// Every 401 becomes a redirect to the identity provider.
    #[default]
    Active,
    /// Only explicit challenges naming this authentication type redirect.
    Passive,
}

/// An issuer signing key, kept as the DER-encoded X.509 certificate the
/// identity provider published.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SigningKey {
    key_id: Option<String>,
    certificate: Bytes,
}

impl SigningKey {
    pub fn from_der(certificate: impl Into<Bytes>) -> Self {
        Self {
            key_id: None,
            certificate: certificate.into(),
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Lowercase hex SHA-256 of the certificate.
    pub fn thumbprint(&self) -> String {
        hex::encode(Sha256::digest(&self.certificate))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// Parameters handed to security token validators.
///
/// Issuer and signing keys are filled in from federation metadata when they
/// are not configured up front.
#[derive(Debug, Clone, Default)]
pub struct TokenValidationParameters {
    pub valid_issuer: Option<String>,
    pub valid_audiences: Vec<String>,
    pub issuer_signing_keys: Vec<SigningKey>,
}

impl TokenValidationParameters {
    pub fn are_issuer_signing_keys_available(&self) -> bool {
        !self.issuer_signing_keys.is_empty()
    }
}

/// Options for [`super::WsFederationMiddleware`].
///
/// Owned by the middleware after construction. Metadata refreshes replace the
/// signing keys, issuer name and issuer address in place.
#[derive(Clone)]
pub struct WsFederationOptions {
    pub authentication_type: String,
    /// Display name for sign-in pages.
    pub caption: Option<String>,
    pub authentication_mode: AuthenticationMode,
    /// Authentication type stamped on identities produced by this middleware.
    /// Falls back to `authentication_type`.
    pub sign_in_as_authentication_type: Option<String>,
    pub metadata_address: Option<Url>,
    pub require_https_metadata: bool,
    /// Passive requestor endpoint of the identity provider.
    pub issuer_address: Option<Url>,
    pub wtrealm: Option<String>,
    pub wreply: Option<String>,
    pub callback_path: String,
    pub token_validation_parameters: TokenValidationParameters,
    pub backchannel_timeout: Duration,
    pub backchannel_http_handler: Option<BackchannelHttpHandler>,
    pub backchannel_certificate_validator: Option<Arc<dyn CertificateValidator>>,
    pub state_data_format: Option<Arc<dyn SecureDataFormat<AuthenticationProperties>>>,
    pub security_token_validators: Vec<Arc<dyn SecurityTokenValidator>>,
    pub events: Arc<dyn WsFederationEvents>,
}

impl WsFederationOptions {
    pub fn new(authentication_type: impl Into<String>) -> Self {
        Self {
            authentication_type: authentication_type.into(),
            caption: None,
            authentication_mode: AuthenticationMode::default(),
            sign_in_as_authentication_type: None,
            metadata_address: None,
            require_https_metadata: true,
            issuer_address: None,
            wtrealm: None,
            wreply: None,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            token_validation_parameters: TokenValidationParameters::default(),
            backchannel_timeout: DEFAULT_BACKCHANNEL_TIMEOUT,
            backchannel_http_handler: None,
            backchannel_certificate_validator: None,
            state_data_format: None,
            security_token_validators: Vec::new(),
            events: Arc::new(DefaultEvents),
        }
    }

    /// Build options from the `[wsfed]` config section.
    ///
    /// Token validators, events and custom transports are code-only and must be
    /// attached afterwards.
    pub fn from_config(config: &WsFederationConfig) -> Result<Self, ConfigError> {
        let mut options = Self::new(config.authentication_type.clone());
        options.caption = config.caption.clone();
        options.authentication_mode = config.authentication_mode;
        options.sign_in_as_authentication_type = config.sign_in_as_authentication_type.clone();
        options.metadata_address = parse_optional_url("metadata_address", &config.metadata_address)?;
        options.require_https_metadata = config.require_https_metadata;
        options.issuer_address = parse_optional_url("issuer_address", &config.issuer_address)?;
        options.wtrealm = config.wtrealm.clone();
        options.wreply = config.wreply.clone();
        options.callback_path = config.callback_path.clone();
        options.token_validation_parameters.valid_issuer = config.valid_issuer.clone();
        options.token_validation_parameters.valid_audiences = config.valid_audiences.clone();

        let backchannel = &config.backchannel;
        options.backchannel_timeout = Duration::from_secs(backchannel.timeout_secs);
        options.backchannel_http_handler = Some(BackchannelHttpHandler::Platform(
            PlatformHandlerBuilder::default()
                .connect_timeout(Duration::from_secs(backchannel.connect_timeout_secs))
                .user_agent(backchannel.user_agent.clone()),
        ));
        if !backchannel.pinned_certificate_thumbprints.is_empty() {
            options.backchannel_certificate_validator = Some(Arc::new(
                ThumbprintCertificateValidator::new(
                    backchannel.pinned_certificate_thumbprints.iter().cloned(),
                ),
            ));
        }

        Ok(options)
    }

    pub fn with_metadata_address(mut self, address: Url) -> Self {
        self.metadata_address = Some(address);
        self
    }

    pub fn with_security_token_validator(
        mut self,
        validator: Arc<dyn SecurityTokenValidator>,
    ) -> Self {
        self.security_token_validators.push(validator);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn WsFederationEvents>) -> Self {
        self.events = events;
        self
    }

    /// Authentication type identities are signed in as.
    pub fn sign_in_as(&self) -> &str {
        self.sign_in_as_authentication_type
            .as_deref()
            .unwrap_or(&self.authentication_type)
    }
}

impl Default for WsFederationOptions {
    fn default() -> Self {
        Self::new(DEFAULT_AUTHENTICATION_TYPE)
    }
}

impl fmt::Debug for WsFederationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsFederationOptions")
            .field("authentication_type", &self.authentication_type)
            .field("authentication_mode", &self.authentication_mode)
            .field("metadata_address", &self.metadata_address)
            .field("issuer_address", &self.issuer_address)
            .field("wtrealm", &self.wtrealm)
            .field("callback_path", &self.callback_path)
            .field("token_validation_parameters", &self.token_validation_parameters)
            .field("backchannel_timeout", &self.backchannel_timeout)
            .field("backchannel_http_handler", &self.backchannel_http_handler)
            .field(
                "backchannel_certificate_validator",
                &self.backchannel_certificate_validator.is_some(),
            )
            .field("state_data_format", &self.state_data_format.is_some())
            .field(
                "security_token_validators",
                &self.security_token_validators.len(),
            )
            .finish()
    }
}

fn parse_optional_url(field: &str, value: &Option<String>) -> Result<Option<Url>, ConfigError> {
    value
        .as_deref()
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                ConfigError::Validation(format!("wsfed.{field} is not a valid URL: {e}"))
            })
        })
        .transpose()
}
