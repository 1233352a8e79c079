//! Per-request WS-Federation authentication handler.
//!
//! Handlers are produced by [`super::WsFederationMiddleware::create_handler`]
//! and bound to an options snapshot taken at creation time.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use tracing::Instrument;
use url::Url;

use super::{
    message::WsFederationMessage,
    options::{AuthenticationMode, WsFederationOptions},
    token::AuthenticationTicket,
};
use crate::auth::{
    AuthError,
    data_protection::{AuthenticationProperties, SecureDataFormat},
};

/// Largest sign-in form body read from the callback path. SAML tokens with
/// group claims can be large, but not this large.
const MAX_CALLBACK_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Property item recording when the sign-in round-trip started.
const STATE_CREATED_ITEM: &str = ".wsfed.state_created";

/// How long a sign-in round-trip may take before its state is rejected.
const STATE_LIFETIME_MINUTES: i64 = 10;

/// What a handler made of a request.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Not a sign-in response for this handler; pass the request on.
    NotHandled(Request),
    Authenticated(AuthenticationTicket),
}

/// Explicit challenge raised by downstream code through response extensions,
/// e.g. `(StatusCode::UNAUTHORIZED, Extension(Challenge::new(..)))`.
#[derive(Debug, Clone, Default)]
pub struct Challenge {
    /// Authentication types to challenge. Empty means every active handler.
    pub authentication_types: Vec<String>,
    pub properties: AuthenticationProperties,
}

impl Challenge {
    pub fn new(authentication_type: impl Into<String>, properties: AuthenticationProperties) -> Self {
        Self {
            authentication_types: vec![authentication_type.into()],
            properties,
        }
    }

    pub fn applies_to(&self, authentication_type: &str, mode: AuthenticationMode) -> bool {
        if self.authentication_types.is_empty() {
            return mode == AuthenticationMode::Active;
        }
        self.authentication_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(authentication_type))
    }
}

/// Contract between the pipeline and an authentication scheme.
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    fn authentication_type(&self) -> &str;

    fn authentication_mode(&self) -> AuthenticationMode;

    /// Authenticate the request if it is a sign-in response addressed to
    /// this handler.
    async fn handle_callback(&self, request: Request) -> Result<CallbackOutcome, AuthError>;

    /// Build the response that sends the browser to the identity provider.
    async fn challenge(&self, properties: AuthenticationProperties) -> Result<Response, AuthError>;
}

pub struct WsFederationHandler {
    options: Arc<WsFederationOptions>,
    span: tracing::Span,
}

impl WsFederationHandler {
    pub fn new(options: Arc<WsFederationOptions>, span: tracing::Span) -> Self {
        Self { options, span }
    }

    pub fn options(&self) -> &WsFederationOptions {
        &self.options
    }

    /// Issuer URL that signs the user out at the identity provider.
    pub fn sign_out_url(&self, wreply: Option<&str>) -> Result<Url, AuthError> {
        let issuer = self.issuer_address()?;
        let wreply = wreply.or(self.options.wreply.as_deref());
        Ok(WsFederationMessage::sign_out(self.options.wtrealm.as_deref(), wreply).create_url(issuer))
    }

    fn issuer_address(&self) -> Result<&Url, AuthError> {
        self.options.issuer_address.as_ref().ok_or_else(|| {
            AuthError::Internal(
                "No issuer address: configure issuer_address or a reachable metadata_address"
                    .to_string(),
            )
        })
    }

    fn state_data_format(
        &self,
    ) -> Result<&Arc<dyn SecureDataFormat<AuthenticationProperties>>, AuthError> {
        self.options
            .state_data_format
            .as_ref()
            .ok_or_else(|| AuthError::Internal("State data format is not configured".to_string()))
    }

    fn is_callback_request(&self, request: &Request) -> bool {
        if request.method() != Method::POST || request.uri().path() != self.options.callback_path {
            return false;
        }
        request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
    }

    async fn process_callback(&self, request: Request) -> Result<CallbackOutcome, AuthError> {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_CALLBACK_BODY_BYTES)
            .await
            .map_err(|e| AuthError::InvalidMessage(format!("unreadable form body: {e}")))?;

        let message = WsFederationMessage::from_form(&bytes);
        if !message.is_sign_in_message() {
            tracing::debug!(wa = ?message.wa(), "Callback post is not a sign-in response");
            return Ok(CallbackOutcome::NotHandled(Request::from_parts(
                parts,
                Body::from(bytes),
            )));
        }

        match self.authenticate(&message).await {
            Ok(ticket) => Ok(CallbackOutcome::Authenticated(ticket)),
            Err(error) => {
                self.options.events.authentication_failed(&error).await;
                Err(error)
            }
        }
    }

    async fn authenticate(
        &self,
        message: &WsFederationMessage,
    ) -> Result<AuthenticationTicket, AuthError> {
        let options = &self.options;
        options.events.message_received(message).await;

        let wctx = message.wctx().ok_or(AuthError::InvalidState)?;
        let mut properties = self.state_data_format()?.unprotect(wctx).map_err(|e| {
            tracing::warn!(error = %e, "Failed to unprotect wctx");
            AuthError::InvalidState
        })?;
        check_state_age(&mut properties)?;

        let token = message
            .wresult()
            .ok_or_else(|| AuthError::InvalidMessage("missing wresult".to_string()))?;
        options.events.security_token_received(message).await;

        let validator = options
            .security_token_validators
            .iter()
            .find(|v| v.can_read_token(token))
            .ok_or_else(|| {
                tracing::warn!("No security token validator can read the sign-in token");
                AuthError::InvalidToken
            })?;

        let mut identity = validator
            .validate_token(token, &options.token_validation_parameters)
            .map_err(|e| {
                tracing::warn!(error = %e, "Security token validation failed");
                AuthError::from(e)
            })?;
        identity.authentication_type = options.sign_in_as().to_string();

        let mut ticket = AuthenticationTicket {
            identity,
            properties,
        };
        options.events.security_token_validated(&mut ticket).await;

        tracing::info!(
            name = ticket.identity.name().unwrap_or("<unnamed>"),
            claims = ticket.identity.claims.len(),
            "WS-Federation sign-in succeeded"
        );

        Ok(ticket)
    }

    async fn build_challenge(
        &self,
        mut properties: AuthenticationProperties,
    ) -> Result<Response, AuthError> {
        let issuer = self.issuer_address()?;

        properties
            .items
            .insert(STATE_CREATED_ITEM.to_string(), Utc::now().to_rfc3339());
        let wctx = self
            .state_data_format()?
            .protect(&properties)
            .map_err(|e| AuthError::Internal(format!("Failed to protect sign-in state: {e}")))?;

        let mut message = WsFederationMessage::sign_in(
            self.options.wtrealm.as_deref(),
            &wctx,
            self.options.wreply.as_deref(),
        );
        self.options
            .events
            .redirect_to_identity_provider(&mut message)
            .await;

        let url = message.create_url(issuer);
        tracing::debug!(
            issuer = %issuer,
            caption = self.options.caption.as_deref().unwrap_or(&self.options.authentication_type),
            "Redirecting to identity provider"
        );

        Ok((StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response())
    }
}

#[async_trait]
impl AuthenticationHandler for WsFederationHandler {
    fn authentication_type(&self) -> &str {
        &self.options.authentication_type
    }

    fn authentication_mode(&self) -> AuthenticationMode {
        self.options.authentication_mode
    }

    async fn handle_callback(&self, request: Request) -> Result<CallbackOutcome, AuthError> {
        if !self.is_callback_request(&request) {
            return Ok(CallbackOutcome::NotHandled(request));
        }
        self.process_callback(request)
            .instrument(self.span.clone())
            .await
    }

    async fn challenge(&self, properties: AuthenticationProperties) -> Result<Response, AuthError> {
        self.build_challenge(properties)
            .instrument(self.span.clone())
            .await
    }
}

/// Reject round-trips older than the state lifetime and strip the marker.
fn check_state_age(properties: &mut AuthenticationProperties) -> Result<(), AuthError> {
    let created = properties
        .items
        .remove(STATE_CREATED_ITEM)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .ok_or(AuthError::InvalidState)?;

    if Utc::now() - created.with_timezone(&Utc) > Duration::minutes(STATE_LIFETIME_MINUTES) {
        tracing::warn!(created = %created, "Sign-in state has expired");
        return Err(AuthError::InvalidState);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::auth::{
        data_protection::{DataProtectionProvider, KeyedDataProtectionProvider, PropertiesDataFormat},
        wsfed::{
            message::WA_SIGN_OUT,
            options::TokenValidationParameters,
            token::{Claim, Identity, NAME_CLAIM_TYPE, SecurityTokenValidator, TokenValidationError},
        },
    };

    struct PrefixValidator;

    impl SecurityTokenValidator for PrefixValidator {
        fn can_read_token(&self, token: &str) -> bool {
            token.starts_with("token:")
        }

        fn validate_token(
            &self,
            token: &str,
            parameters: &TokenValidationParameters,
        ) -> Result<Identity, TokenValidationError> {
            if !parameters.are_issuer_signing_keys_available() {
                return Err(TokenValidationError::NoSigningKeys);
            }
            match token.trim_start_matches("token:") {
                "expired" => Err(TokenValidationError::Expired),
                user => Ok(Identity::new(vec![Claim::new(NAME_CLAIM_TYPE, user)])),
            }
        }
    }

    fn format() -> Arc<dyn SecureDataFormat<AuthenticationProperties>> {
        let provider = KeyedDataProtectionProvider::new("0123456789abcdef0123456789abcdef");
        Arc::new(PropertiesDataFormat::new(
            provider.create_protector(&["test", "Federation", "v1"]).unwrap(),
        ))
    }

    fn options() -> WsFederationOptions {
        let mut options = WsFederationOptions::default();
        options.issuer_address = Some(Url::parse("https://sts.example.com/adfs/ls/").unwrap());
        options.wtrealm = Some("urn:app".into());
        options.state_data_format = Some(format());
        options.sign_in_as_authentication_type = Some("Cookies".into());
        options.token_validation_parameters.issuer_signing_keys =
            vec![crate::auth::wsfed::SigningKey::from_der(b"key".to_vec())];
        options.security_token_validators.push(Arc::new(PrefixValidator));
        options
    }

    fn handler(options: WsFederationOptions) -> WsFederationHandler {
        WsFederationHandler::new(Arc::new(options), tracing::Span::none())
    }

    fn location_query(response: &Response) -> BTreeMap<String, String> {
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        Url::parse(location).unwrap().query_pairs().into_owned().collect()
    }

    fn callback(body: String) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/signin-wsfed")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    fn form(pairs: &[(&str, &str)]) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
    }

    async fn wctx_for(handler: &WsFederationHandler, redirect_uri: &str) -> String {
        let response = handler
            .challenge(AuthenticationProperties::with_redirect_uri(redirect_uri))
            .await
            .unwrap();
        location_query(&response)["wctx"].clone()
    }

    #[tokio::test]
    async fn test_challenge_redirects_to_issuer() {
        let handler = handler(options());
        let response = handler
            .challenge(AuthenticationProperties::with_redirect_uri("/reports"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://sts.example.com/adfs/ls/?"));

        let query = location_query(&response);
        assert_eq!(query["wa"], "wsignin1.0");
        assert_eq!(query["wtrealm"], "urn:app");
        assert!(!query["wctx"].contains("reports"));
        assert!(!query.contains_key("wreply"));
    }

    #[tokio::test]
    async fn test_challenge_without_issuer_is_internal_error() {
        let mut options = options();
        options.issuer_address = None;

        let err = handler(options)
            .challenge(AuthenticationProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
    }

    #[tokio::test]
    async fn test_callback_produces_ticket() {
        let handler = handler(options());
        let wctx = wctx_for(&handler, "/reports").await;

        let body = form(&[("wa", "wsignin1.0"), ("wresult", "token:alice"), ("wctx", &wctx)]);
        let outcome = handler.handle_callback(callback(body)).await.unwrap();

        let CallbackOutcome::Authenticated(ticket) = outcome else {
            panic!("expected ticket");
        };
        assert_eq!(ticket.identity.name(), Some("alice"));
        assert_eq!(ticket.identity.authentication_type, "Cookies");
        assert_eq!(ticket.properties.redirect_uri.as_deref(), Some("/reports"));
        assert!(!ticket.properties.items.contains_key(STATE_CREATED_ITEM));
    }

    #[tokio::test]
    async fn test_callback_rejects_tampered_state() {
        let handler = handler(options());
        let body = form(&[("wa", "wsignin1.0"), ("wresult", "token:alice"), ("wctx", "forged")]);

        let err = handler.handle_callback(callback(body)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
    }

    #[tokio::test]
    async fn test_callback_rejects_stale_state() {
        let handler = handler(options());
        let mut properties = AuthenticationProperties::default();
        properties.items.insert(
            STATE_CREATED_ITEM.into(),
            (Utc::now() - Duration::minutes(30)).to_rfc3339(),
        );
        let wctx = format().protect(&properties).unwrap();

        let body = form(&[("wa", "wsignin1.0"), ("wresult", "token:alice"), ("wctx", &wctx)]);
        let err = handler.handle_callback(callback(body)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
    }

    #[tokio::test]
    async fn test_callback_with_unreadable_token() {
        let handler = handler(options());
        let wctx = wctx_for(&handler, "/").await;

        let body = form(&[("wa", "wsignin1.0"), ("wresult", "<saml/>"), ("wctx", &wctx)]);
        let err = handler.handle_callback(callback(body)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_callback_maps_expired_token() {
        let handler = handler(options());
        let wctx = wctx_for(&handler, "/").await;

        let body = form(&[("wa", "wsignin1.0"), ("wresult", "token:expired"), ("wctx", &wctx)]);
        let err = handler.handle_callback(callback(body)).await.unwrap_err();
        assert!(matches!(err, AuthError::ExpiredToken));
    }

    #[tokio::test]
    async fn test_non_callback_requests_pass_through() {
        let handler = handler(options());

        let get = Request::builder()
            .uri("/signin-wsfed")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            handler.handle_callback(get).await.unwrap(),
            CallbackOutcome::NotHandled(_)
        ));

        let other_path = Request::builder()
            .method(Method::POST)
            .uri("/api/items")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("wa=wsignin1.0"))
            .unwrap();
        assert!(matches!(
            handler.handle_callback(other_path).await.unwrap(),
            CallbackOutcome::NotHandled(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_out_post_is_passed_on_with_body() {
        let handler = handler(options());
        let outcome = handler
            .handle_callback(callback(form(&[("wa", WA_SIGN_OUT)])))
            .await
            .unwrap();

        let CallbackOutcome::NotHandled(request) = outcome else {
            panic!("expected pass-through");
        };
        let body = axum::body::to_bytes(request.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"wa=wsignout1.0");
    }

    #[test]
    fn test_sign_out_url() {
        let handler = handler(options());
        let url = handler.sign_out_url(Some("https://app.example.com/")).unwrap();
        let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["wa"], WA_SIGN_OUT);
        assert_eq!(query["wtrealm"], "urn:app");
        assert_eq!(query["wreply"], "https://app.example.com/");
    }

    #[test]
    fn test_challenge_applicability() {
        let explicit = Challenge::new("federation", AuthenticationProperties::default());
        assert!(explicit.applies_to("Federation", AuthenticationMode::Passive));
        assert!(!explicit.applies_to("Other", AuthenticationMode::Active));

        let any = Challenge::default();
        assert!(any.applies_to("Federation", AuthenticationMode::Active));
        assert!(!any.applies_to("Federation", AuthenticationMode::Passive));
    }
}
