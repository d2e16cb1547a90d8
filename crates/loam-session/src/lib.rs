#![warn(missing_docs)]

//! Loam session layer: RS256 bearer tokens signed with a keystore-held RSA
//! keypair, argon2 credential checks, and tenant-scoped authorization that
//! resolves organization and farm membership through the DAO.

pub mod error;
pub mod keystore;
pub mod password;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testkeys;

pub use error::AuthError;
pub use keystore::{DirKeystore, Keystore};
pub use session::{bearer_token, Session, SessionConfig, SessionManager, SessionRequest};
pub use token::{Claims, FarmClaim, OrgClaim, TokenCodec};
