mod auth;
mod health;

pub use auth::{issue_token, whoami};
pub use health::health_check;
