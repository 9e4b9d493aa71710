//! Application credential lookup for token issuance.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type SecretDigest = [u8; 32];

fn digest(secret: &str) -> SecretDigest {
    Sha256::digest(secret.as_bytes()).into()
}

/// Verifies an application key / secret pair.
///
/// Implementations must compare secrets in constant time.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, app_key: &str, app_secret: &str) -> bool;
}

/// In-memory credential store loaded from configuration.
///
/// Only SHA-256 digests of the secrets are kept. Comparing fixed-length
/// digests keeps the comparison time independent of the secret's length.
#[derive(Default)]
pub struct StaticCredentials {
    clients: HashMap<String, SecretDigest>,
}

impl StaticCredentials {
    pub fn new<I, K, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: Into<String>,
    {
        Self {
            clients: clients
                .into_iter()
                .map(|(k, s)| {
                    let secret: String = s.into();
                    (k.into(), digest(&secret))
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, app_key: &str, app_secret: &str) -> bool {
        let presented = digest(app_secret);
        match self.clients.get(app_key) {
            Some(expected) => expected.as_slice().ct_eq(presented.as_slice()).into(),
            None => false,
        }
    }
}
