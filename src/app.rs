//! Sign-in host: a protected page behind the WS-Federation middleware.
//!
//! Signed-in users are remembered in a protected cookie written when the
//! middleware hands back an [`AuthenticationTicket`].

use std::{sync::Arc, time::Duration};

use axum::{
    Extension, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use tower_cookies::{Cookie, CookieManagerLayer, Cookies, cookie::SameSite};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    auth::{
        data_protection::{
            AuthenticationProperties, DataProtectionError, DataProtectionProvider, DataProtector,
        },
        wsfed::{AuthenticationTicket, Challenge, WsFederationMiddleware},
    },
    config::AppConfig,
    middleware::wsfed_middleware,
};

pub const SIGN_IN_COOKIE: &str = "wsfed_user";
pub const SIGN_OUT_PATH: &str = "/signout";

const COOKIE_PURPOSE: &str = "wsfed::host::identity";

#[derive(Clone)]
pub struct AppState {
    pub wsfed: Arc<WsFederationMiddleware>,
    pub authentication_type: String,
    cookie_protector: Arc<dyn DataProtector>,
    secure_cookies: bool,
}

impl AppState {
    pub fn new(
        wsfed: Arc<WsFederationMiddleware>,
        authentication_type: impl Into<String>,
        data_protection: &dyn DataProtectionProvider,
    ) -> Result<Self, DataProtectionError> {
        Ok(Self {
            wsfed,
            authentication_type: authentication_type.into(),
            cookie_protector: data_protection.create_protector(&[COOKIE_PURPOSE, "v1"])?,
            secure_cookies: false,
        })
    }

    fn signed_in_user(&self, cookies: &Cookies) -> Option<String> {
        let cookie = cookies.get(SIGN_IN_COOKIE)?;
        let protected = URL_SAFE_NO_PAD.decode(cookie.value()).ok()?;
        let name = self.cookie_protector.unprotect(&protected).ok()?;
        String::from_utf8(name).ok()
    }
}

pub fn build_app(config: &AppConfig, state: AppState) -> Router {
    let state = AppState {
        secure_cookies: config.server.secure_cookies,
        ..state
    };

    Router::new()
        .route(&config.server.protected_path, get(protected_page))
        .route(SIGN_OUT_PATH, get(sign_out))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(from_fn_with_state(state.wsfed.clone(), wsfed_middleware))
        .layer(from_fn_with_state(state.clone(), remember_sign_in))
        .layer(CookieManagerLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn protected_page(State(state): State<AppState>, cookies: Cookies) -> Response {
    match state.signed_in_user(&cookies) {
        Some(name) => format!("Signed in as {name}\n").into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Extension(Challenge::new(
                state.authentication_type.clone(),
                AuthenticationProperties::default(),
            )),
        )
            .into_response(),
    }
}

async fn sign_out(State(state): State<AppState>, cookies: Cookies) -> Response {
    cookies.remove(Cookie::build(SIGN_IN_COOKIE).path("/").build());

    match state.wsfed.create_handler().await.sign_out_url(None) {
        Ok(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Persist a fresh sign-in as a protected cookie.
async fn remember_sign_in(
    State(state): State<AppState>,
    cookies: Cookies,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;

    let Some(ticket) = response.extensions().get::<AuthenticationTicket>() else {
        return response;
    };
    let name = ticket.identity.name().unwrap_or("unknown");

    match state.cookie_protector.protect(name.as_bytes()) {
        Ok(protected) => {
            let cookie: Cookie<'static> =
                Cookie::build((SIGN_IN_COOKIE, URL_SAFE_NO_PAD.encode(protected)))
                    .path("/")
                    .http_only(true)
                    .secure(state.secure_cookies)
                    .same_site(SameSite::Lax)
                    .build();
            cookies.add(cookie);
            tracing::info!(user = name, "Signed in");
        }
        Err(error) => tracing::error!(error = %error, "Failed to protect sign-in cookie"),
    }

    response
}
