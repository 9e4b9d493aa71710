//! Token issuance and validation.
//!
//! - [`TokenCodec`] - HS256 token issue / validate
//! - [`CredentialStore`] - application key / secret verification for `POST /auth`
//!
//! The bearer-token middleware lives in `crate::middleware::auth`.

pub mod codec;
pub mod credentials;

pub use codec::{AuthClaims, IssuedToken, TokenCodec, hash_hex};
pub use credentials::{CredentialStore, StaticCredentials};
