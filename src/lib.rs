//! WS-Federation passive sign-in for axum/tower pipelines.
//!
//! Build a [`auth::wsfed::WsFederationMiddleware`] once from
//! [`auth::wsfed::WsFederationOptions`], then mount
//! [`middleware::wsfed_middleware`] with `axum::middleware::from_fn_with_state`.

pub mod app;
pub mod auth;
pub mod config;
pub mod middleware;
pub mod observability;
pub mod validation;

#[cfg(test)]
mod tests;
