//! Security token validation seam and the identities it produces.

use serde::{Deserialize, Serialize};

use super::options::TokenValidationParameters;
use crate::auth::data_protection::AuthenticationProperties;

pub const NAME_CLAIM_TYPE: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
    pub issuer: Option<String>,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
            issuer: None,
        }
    }
}

/// Identity asserted by a validated security token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub authentication_type: String,
    pub claims: Vec<Claim>,
}

impl Identity {
    pub fn new(claims: Vec<Claim>) -> Self {
        Self {
            authentication_type: String::new(),
            claims,
        }
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.claim_type == claim_type)
            .map(|c| c.value.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.find_first(NAME_CLAIM_TYPE)
    }
}

/// Result of a successful sign-in: who signed in, plus the state carried
/// through the identity provider round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationTicket {
    pub identity: Identity,
    pub properties: AuthenticationProperties,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenValidationError {
    #[error("No issuer signing keys are available")]
    NoSigningKeys,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token issuer '{0}' is not valid")]
    InvalidIssuer(String),

    #[error("Token audience is not valid")]
    InvalidAudience,

    #[error("Token has expired")]
    Expired,

    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Validates the security token carried in a sign-in response (`wresult`).
pub trait SecurityTokenValidator: Send + Sync {
    fn can_read_token(&self, token: &str) -> bool;

    fn validate_token(
        &self,
        token: &str,
        parameters: &TokenValidationParameters,
    ) -> Result<Identity, TokenValidationError>;
}
