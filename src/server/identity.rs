//! Requester identity verification, supplied by an external credential
//! service.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::server::Guid;

use bytes::Bytes;

/// Checks that a request really comes from the identity it names.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, requester: &str, proof: Option<&Bytes>) -> bool;
}

/// Trusts every requester.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl IdentityVerifier for AcceptAll {
    fn verify(&self, _requester: &str, _proof: Option<&Bytes>) -> bool {
        true
    }
}

/// Accepts a requester only if the proof matches the token enrolled for it.
#[derive(Debug, Default)]
pub struct TokenVerifier {
    tokens: RwLock<HashMap<Guid, Bytes>>,
}

impl TokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrolls (or replaces) the token of `guid`.
    pub fn enroll(&self, guid: impl Into<Guid>, token: Bytes) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(guid.into(), token);
        }
    }

    pub fn revoke(&self, guid: &str) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.remove(guid);
        }
    }
}

impl IdentityVerifier for TokenVerifier {
    fn verify(&self, requester: &str, proof: Option<&Bytes>) -> bool {
        let tokens = match self.tokens.read() {
            Ok(tokens) => tokens,
            Err(_) => return false,
        };
        match (tokens.get(requester), proof) {
            (Some(token), Some(proof)) => token == proof,
            _ => false,
        }
    }
}
