//! WS-Federation passive sign-in.
//!
//! [`WsFederationMiddleware`] is built once per authentication type and owns
//! the options, the sign-in state format and the backchannel used for
//! federation metadata. Each request gets a [`WsFederationHandler`] bound to
//! a snapshot of the options; creating one refreshes metadata on a best-effort
//! basis when no issuer signing keys are configured yet.
//!
//! # Flow
//!
//! 1. A downstream 401 (active mode) or an explicit [`Challenge`] produces a
//!    302 to the identity provider carrying `wa=wsignin1.0`, `wtrealm` and the
//!    protected state in `wctx`.
//! 2. The identity provider posts `wresult` back to the callback path.
//! 3. The handler unprotects `wctx`, runs the first [`SecurityTokenValidator`]
//!    that can read the token and yields an [`AuthenticationTicket`].

pub mod backchannel;
pub mod certificate;
mod events;
mod handler;
mod message;
pub mod metadata;
mod middleware;
mod options;
mod token;

pub use backchannel::{
    BackchannelClient, BackchannelHttpHandler, HttpMessageHandler, MAX_RESPONSE_CONTENT_BUFFER_SIZE,
    PlatformHandlerBuilder,
};
pub use certificate::{
    CertificateValidationContext, CertificateValidator, ThumbprintCertificateValidator,
    certificate_validator_fn,
};
pub use events::{DefaultEvents, WsFederationEvents};
pub use handler::{AuthenticationHandler, CallbackOutcome, Challenge, WsFederationHandler};
pub use message::{WA_SIGN_IN, WA_SIGN_OUT, WsFederationMessage};
pub use metadata::{
    FederationData, HttpMetadataRetriever, MetadataError, MetadataParser, MetadataRefresh,
    MetadataRetriever, SkipReason,
};
pub use middleware::{ConfigurationError, WsFederationMiddleware};
pub use options::{
    AuthenticationMode, DEFAULT_AUTHENTICATION_TYPE, DEFAULT_BACKCHANNEL_TIMEOUT,
    DEFAULT_CALLBACK_PATH, SigningKey, TokenValidationParameters, WsFederationOptions,
};
pub use token::{
    AuthenticationTicket, Claim, Identity, NAME_CLAIM_TYPE, SecurityTokenValidator,
    TokenValidationError,
};
