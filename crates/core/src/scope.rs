//! Authorization scopes.
//!
//! Every pooled handle and every cached result belongs to exactly one scope.
//! The service scope authenticates with the backend service key; a user scope
//! authenticates with the caller's JWT and is subject to row-level security on
//! the backend, so results must never cross between scopes.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

#[derive(Clone, Debug)]
pub enum Scope {
    Service,
    User { user_id: String, token: SecretString },
}

/// Identity part of a [`Scope`], without the credential.
///
/// This is what pools and cache entries are keyed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Service,
    User(String),
}

impl Scope {
    pub fn user(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::User { user_id: user_id.into(), token: SecretString::from(token.into()) }
    }

    pub fn key(&self) -> ScopeKey {
        match self {
            Self::Service => ScopeKey::Service,
            Self::User { user_id, .. } => ScopeKey::User(user_id.clone()),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Service => None,
            Self::User { user_id, .. } => Some(user_id),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Self::Service)
    }

    /// Bearer token for user scopes; `None` means "use the service key".
    pub fn token(&self) -> Option<&SecretString> {
        match self {
            Self::Service => None,
            Self::User { token, .. } => Some(token),
        }
    }

    /// Stable fingerprint of the credential, safe to log and compare.
    ///
    /// Handles opened with one token are never handed to a request carrying a
    /// different token for the same user (e.g. after a JWT refresh).
    pub fn credential_fingerprint(&self) -> String {
        match self {
            Self::Service => "service".to_string(),
            Self::User { token, .. } => {
                let digest = blake3::hash(token.expose_secret().as_bytes()); // ubs:ignore
                digest.to_hex()[..16].to_string()
            }
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::User(user_id) => write!(f, "user:{user_id}"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}
