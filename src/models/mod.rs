mod api;

pub use api::{HealthResponse, TokenRequest, TokenResponse, WhoAmIResponse};
