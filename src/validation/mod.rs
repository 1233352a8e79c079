//! Validation of URLs the middleware makes outbound requests to.

pub mod url;
