mod auth;
pub mod error;
mod forward;
mod models;
mod relay;
mod request;
mod router;

#[cfg(test)]
mod tests;

pub use auth::{authenticate_request, parse_token_from_request, ApiKeyPosition};
pub use error::{RelayError, SATURATED_MESSAGE};
pub use router::create_relay_router;
