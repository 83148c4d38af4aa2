//! Bearer-token verification at the transport boundary.
//!
//! Identity resolution proper lives in an external collaborator; the
//! core only checks that the presented token is one the deployment
//! accepts. An empty token set means an open instance (development).

use std::collections::HashSet;

use easygrid_core::{Error, Result};

/// Accepted bearer tokens.
pub struct AuthProvider {
    tokens: HashSet<String>,
}

impl AuthProvider {
    /// Creates a provider over the configured token set.
    pub fn new(tokens: HashSet<String>) -> Self {
        Self { tokens }
    }

    /// Verifies a presented token.
    pub fn verify(&self, token: Option<&str>) -> Result<()> {
        if self.tokens.is_empty() {
            return Ok(());
        }
        match token {
            Some(token) if self.tokens.contains(token) => Ok(()),
            Some(_) => Err(Error::unauthorized("unknown bearer token")),
            None => Err(Error::unauthorized("missing bearer token")),
        }
    }
}

/// Extracts a bearer token from an `Authorization` header value.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_instance_accepts_anything() {
        let auth = AuthProvider::new(HashSet::new());
        assert!(auth.verify(None).is_ok());
        assert!(auth.verify(Some("whatever")).is_ok());
    }

    #[test]
    fn test_token_check() {
        let auth = AuthProvider::new(["sekrit".to_string()].into());
        assert!(auth.verify(Some("sekrit")).is_ok());
        assert!(auth.verify(Some("wrong")).is_err());
        assert!(auth.verify(None).is_err());
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_from_header("Bearer abc"), Some("abc"));
        assert_eq!(bearer_from_header("bearer abc"), Some("abc"));
        assert_eq!(bearer_from_header("Basic abc"), None);
    }
}
