pub mod data_protection;
mod error;
pub mod wsfed;

pub use error::AuthError;
