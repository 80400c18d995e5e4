//! The HTTP-01 challenge token table.
//!
//! Purely in-memory: a token only needs to survive the few seconds between
//! publication and the CA's validation request, so there is nothing here
//! worth persisting to disk.

use crate::acme::ChallengeHandler;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Maps challenge tokens to their key authorization for the duration of one
/// authorization exchange.
#[derive(Default)]
pub struct ChallengeTable {
    tokens: RwLock<HashMap<String, String>>,
}

impl ChallengeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the key authorization for a token, as served at
    /// `/.well-known/acme-challenge/{token}`.
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}

impl ChallengeHandler for ChallengeTable {
    fn publish(&self, token: &str, key_authorization: &str) {
        self.tokens
            .write()
            .insert(token.to_string(), key_authorization.to_string());
    }

    fn retire(&self, token: &str) {
        self.tokens.write().remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_retire_round_trips() {
        let table = ChallengeTable::new();
        table.publish("tok", "tok.thumbprint");
        assert_eq!(table.get("tok").as_deref(), Some("tok.thumbprint"));
        table.retire("tok");
        assert!(table.get("tok").is_none());
    }

    #[test]
    fn unknown_token_returns_none() {
        let table = ChallengeTable::new();
        assert!(table.get("missing").is_none());
    }
}
