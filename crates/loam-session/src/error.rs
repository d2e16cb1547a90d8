//! Error type for authentication and authorization.

use thiserror::Error;

use loam_core::CoreError;

/// Failures across token handling, the keystore, and scope checks.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Neither the authorization header nor the query parameter carried a
    /// token.
    #[error("no bearer token in request")]
    MissingToken,
    /// The token failed signature, expiry, or structural checks.
    #[error("token rejected: {0}")]
    InvalidToken(String),
    /// A mandatory claim is absent or empty.
    #[error("token missing required claim {0:?}")]
    MissingClaim(&'static str),
    /// The user has no grant for the requested organization or farm.
    #[error("user {user_id} is not a member of {resource}")]
    NotMember {
        /// User the token resolved to.
        user_id: u64,
        /// Scope that was requested.
        resource: String,
    },
    /// Login credentials did not match.
    #[error("credentials rejected")]
    BadCredentials,
    /// A stored password hash could not be parsed or produced.
    #[error("password hash invalid: {0}")]
    Password(String),
    /// No key material for the subject in the keystore.
    #[error("no certificate for subject {0:?}")]
    CertNotFound(String),
    /// The subject's key material has been revoked.
    #[error("certificate for subject {0:?} is revoked")]
    CertRevoked(String),
    /// Key material exists but is not a usable RSA PEM.
    #[error("key material unusable: {0}")]
    InvalidKey(String),
    /// Keystore file access failed for a reason other than absence.
    #[error("keystore i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A DAO traversal behind login or scope resolution failed.
    #[error(transparent)]
    Dao(#[from] CoreError),
}
