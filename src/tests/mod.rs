//! End-to-end tests across the host app, middleware and backchannel.
