//! PEM keystore over a certificate directory.
//!
//! The store keeps one file per subject with well-known extensions: `.crt`
//! for the public half, `.key` (or `.key.pkcs8`) for the private key, and
//! `.csr` for pending signing requests. Moving a subject's files into the
//! `revoked/` subdirectory revokes it without touching the rest of the tree.
//! Certificate issuance and signing live outside this crate; tokens only
//! need the PEM bytes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::AuthError;

/// Subject of the certificate-authority identity.
pub const CA_SUBJECT: &str = "ca";

/// Extension of the public half.
pub const CERT_EXT: &str = "crt";
/// Extension of the private key.
pub const KEY_EXT: &str = "key";
/// Extension of the PKCS#8 private key, preferred when present.
pub const PKCS8_EXT: &str = "key.pkcs8";
/// Extension of a pending signing request.
pub const CSR_EXT: &str = "csr";
/// Subdirectory holding revoked subjects.
pub const REVOKED_DIR: &str = "revoked";

/// Source of PEM key material by subject name.
pub trait Keystore: Send + Sync {
    /// PEM bytes of the subject's public half.
    fn public_key_pem(&self, subject: &str) -> Result<Vec<u8>, AuthError>;
    /// PEM bytes of the subject's private key.
    fn private_key_pem(&self, subject: &str) -> Result<Vec<u8>, AuthError>;
    /// Raw PEM bytes of the subject's certificate, or its signing request
    /// when no certificate exists yet.
    fn pem(&self, subject: &str) -> Result<Vec<u8>, AuthError>;
}

/// Keystore reading from a flat directory of PEM files.
#[derive(Debug, Clone)]
pub struct DirKeystore {
    dir: PathBuf,
}

impl DirKeystore {
    /// Opens the store rooted at `dir`. The directory is read lazily; a
    /// missing directory surfaces as [`AuthError::CertNotFound`] on first
    /// access.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        DirKeystore { dir: dir.into() }
    }

    /// Directory this store reads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn subject_path(&self, subject: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", subject, ext))
    }

    fn check_revoked(&self, subject: &str) -> Result<(), AuthError> {
        let revoked = self.dir.join(REVOKED_DIR);
        for ext in [CERT_EXT, KEY_EXT, PKCS8_EXT, CSR_EXT] {
            if revoked.join(format!("{}.{}", subject, ext)).exists() {
                return Err(AuthError::CertRevoked(subject.to_string()));
            }
        }
        Ok(())
    }

    fn read(&self, subject: &str, ext: &str) -> Result<Vec<u8>, AuthError> {
        match std::fs::read(self.subject_path(subject, ext)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AuthError::CertNotFound(subject.to_string()))
            }
            Err(e) => Err(AuthError::Io(e)),
        }
    }
}

impl Keystore for DirKeystore {
    fn public_key_pem(&self, subject: &str) -> Result<Vec<u8>, AuthError> {
        self.check_revoked(subject)?;
        self.read(subject, CERT_EXT)
    }

    fn private_key_pem(&self, subject: &str) -> Result<Vec<u8>, AuthError> {
        self.check_revoked(subject)?;
        match self.read(subject, PKCS8_EXT) {
            Ok(bytes) => Ok(bytes),
            Err(AuthError::CertNotFound(_)) => self.read(subject, KEY_EXT),
            Err(e) => Err(e),
        }
    }

    fn pem(&self, subject: &str) -> Result<Vec<u8>, AuthError> {
        self.check_revoked(subject)?;
        match self.read(subject, CERT_EXT) {
            Ok(bytes) => Ok(bytes),
            Err(AuthError::CertNotFound(_)) => self.read(subject, CSR_EXT),
            Err(e) => Err(e),
        }
    }
}
