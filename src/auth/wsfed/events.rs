//! Notification hooks raised while the middleware runs.

use async_trait::async_trait;
use url::Url;

use super::{message::WsFederationMessage, metadata::MetadataError, token::AuthenticationTicket};
use crate::auth::AuthError;

/// Callbacks for observing and adjusting the sign-in flow. Every method has a
/// default; implement only what you need.
#[async_trait]
pub trait WsFederationEvents: Send + Sync {
    /// A WS-Federation message arrived at the callback path.
    async fn message_received(&self, _message: &WsFederationMessage) {}

    /// A sign-in response carried a security token, before validation.
    async fn security_token_received(&self, _message: &WsFederationMessage) {}

    /// The token validated. The ticket may be amended (claims, properties).
    async fn security_token_validated(&self, _ticket: &mut AuthenticationTicket) {}

    async fn authentication_failed(&self, _error: &AuthError) {}

    /// About to redirect to the identity provider. Parameters may be added.
    async fn redirect_to_identity_provider(&self, _message: &mut WsFederationMessage) {}

    /// A best-effort metadata refresh failed. Handler creation continues.
    fn metadata_fetch_failed(&self, address: &Url, error: &MetadataError) {
        tracing::warn!(
            url = %address,
            error = %error,
            "Federation metadata refresh failed; continuing with configured signing keys"
        );
    }
}

/// Default hooks: log metadata failures, otherwise do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvents;

impl WsFederationEvents for DefaultEvents {}
