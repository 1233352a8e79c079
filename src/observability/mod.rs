//! Structured logging setup (pretty, compact or JSON).

mod tracing_init;

pub use tracing_init::*;
