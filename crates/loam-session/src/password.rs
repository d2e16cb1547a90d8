//! Argon2 password hashing and verification.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

use crate::error::AuthError;

/// Hashes a password with a fresh random salt. The result embeds the salt
/// and parameters, so [`verify`] needs nothing else.
pub fn hash(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Password(e.to_string()))?
        .to_string())
}

/// Checks a password against a stored hash. A malformed stored hash is an
/// error, not a mismatch.
pub fn verify(stored_hash: &str, password: &str) -> Result<bool, AuthError> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|e| AuthError::Password(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_then_verify() {
        let hashed = hash("$ecret").unwrap();
        assert!(hashed.starts_with("$argon2"));
        assert!(verify(&hashed, "$ecret").unwrap());
        assert!(!verify(&hashed, "wrong").unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash("$ecret").unwrap(), hash("$ecret").unwrap());
    }

    #[test]
    fn test_malformed_stored_hash_is_an_error() {
        assert!(matches!(
            verify("not-a-phc-string", "pw"),
            Err(AuthError::Password(_))
        ));
    }
}
