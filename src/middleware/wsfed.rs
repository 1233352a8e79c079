//! Pipeline glue for WS-Federation sign-in.
//!
//! Runs the callback before the rest of the stack and turns challenges coming
//! back out of it into redirects to the identity provider.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{
    data_protection::AuthenticationProperties,
    wsfed::{
        AuthenticationHandler, AuthenticationMode, AuthenticationTicket, CallbackOutcome,
        Challenge, WsFederationMiddleware,
    },
};

/// WS-Federation middleware for `axum::middleware::from_fn_with_state`.
///
/// A successful sign-in answers with a 302 to the round-tripped
/// `redirect_uri` and carries the [`AuthenticationTicket`] in the response
/// extensions for an outer session layer to persist.
pub async fn wsfed_middleware(
    State(middleware): State<Arc<WsFederationMiddleware>>,
    request: Request,
    next: Next,
) -> Response {
    let handler = middleware.create_handler().await;

    let request = match handler.handle_callback(request).await {
        Ok(CallbackOutcome::NotHandled(request)) => request,
        Ok(CallbackOutcome::Authenticated(ticket)) => return sign_in_response(ticket),
        Err(error) => return error.into_response(),
    };

    let return_to = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut response = next.run(request).await;

    let properties = if let Some(challenge) = response.extensions_mut().remove::<Challenge>() {
        if !challenge.applies_to(handler.authentication_type(), handler.authentication_mode()) {
            return response;
        }
        let mut properties = challenge.properties;
        properties.redirect_uri.get_or_insert(return_to);
        properties
    } else if response.status() == StatusCode::UNAUTHORIZED
        && handler.authentication_mode() == AuthenticationMode::Active
    {
        AuthenticationProperties::with_redirect_uri(return_to)
    } else {
        return response;
    };

    handler
        .challenge(properties)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

fn sign_in_response(ticket: AuthenticationTicket) -> Response {
    let location = ticket
        .properties
        .redirect_uri
        .clone()
        .unwrap_or_else(|| "/".to_string());
    let mut response = (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    response.extensions_mut().insert(ticket);
    response
}
