//! RS256 session tokens.
//!
//! A token is a signed JSON claim set. The tenant grants ride along as two
//! embedded JSON strings, `organizations` and `farms`, each encoding a list
//! of named grants with capitalized keys; transports that only inspect the
//! outer claims never have to parse them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use loam_model::user::User;

use crate::error::AuthError;
use crate::keystore::Keystore;

/// Farm grant embedded in a token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FarmClaim {
    /// Farm identifier.
    #[serde(rename = "ID")]
    pub id: u64,
    /// Farm display name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Role names granted for this farm.
    #[serde(rename = "Roles", default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Organization grant embedded in a token, with the farms shared through it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgClaim {
    /// Organization identifier.
    #[serde(rename = "ID")]
    pub id: u64,
    /// Organization display name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Farms reachable through this organization.
    #[serde(rename = "Farms", default, skip_serializing_if = "Vec::is_empty")]
    pub farms: Vec<FarmClaim>,
    /// Role names granted for the organization as a whole.
    #[serde(rename = "Roles", default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Claim set carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Deployment (server) identifier.
    pub sid: u64,
    /// User identifier. Zero is rejected.
    pub uid: u64,
    /// Login email. Empty is rejected.
    pub email: String,
    /// JSON-encoded list of [`OrgClaim`] grants.
    #[serde(default)]
    pub organizations: String,
    /// JSON-encoded list of [`FarmClaim`] grants.
    #[serde(default)]
    pub farms: String,
    /// Issuer name the verifier insists on.
    pub iss: String,
    /// Issued-at, seconds since the epoch.
    pub iat: u64,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

impl Claims {
    /// Organization grants decoded from the embedded JSON.
    pub fn organization_claims(&self) -> Result<Vec<OrgClaim>, AuthError> {
        if self.organizations.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.organizations)
            .map_err(|e| AuthError::InvalidToken(format!("organizations claim: {}", e)))
    }

    /// Farm grants decoded from the embedded JSON.
    pub fn farm_claims(&self) -> Result<Vec<FarmClaim>, AuthError> {
        if self.farms.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.farms)
            .map_err(|e| AuthError::InvalidToken(format!("farms claim: {}", e)))
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.uid == 0 {
            return Err(AuthError::MissingClaim("uid"));
        }
        if self.email.is_empty() {
            return Err(AuthError::MissingClaim("email"));
        }
        Ok(())
    }
}

/// Signs and verifies session tokens with one RSA keypair.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl TokenCodec {
    /// Builds the codec from the subject's keypair in a keystore.
    pub fn from_keystore(
        store: &dyn Keystore,
        subject: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Self, AuthError> {
        let private = store.private_key_pem(subject)?;
        let public = store.public_key_pem(subject)?;
        Self::from_pems(&private, &public, issuer, ttl)
    }

    /// Builds the codec from raw PEM key material.
    pub fn from_pems(
        private_pem: &[u8],
        public_pem: &[u8],
        issuer: &str,
        ttl: Duration,
    ) -> Result<Self, AuthError> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        Ok(TokenCodec {
            encoding,
            decoding,
            validation,
            issuer: issuer.to_string(),
            ttl,
        })
    }

    /// Token lifetime stamped at issue.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Builds and signs a claim set for a user with the given grants.
    pub fn issue(
        &self,
        sid: u64,
        user: &User,
        orgs: &[OrgClaim],
        farms: &[FarmClaim],
    ) -> Result<String, AuthError> {
        let now = now_epoch_seconds();
        let claims = Claims {
            sid,
            uid: user.id.as_u64(),
            email: user.email.clone(),
            organizations: serde_json::to_string(orgs)
                .map_err(|e| AuthError::InvalidToken(e.to_string()))?,
            farms: serde_json::to_string(farms)
                .map_err(|e| AuthError::InvalidToken(e.to_string()))?,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        claims.validate()?;
        self.sign(&claims)
    }

    /// Signs an already-built claim set.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.encoding)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))
    }

    /// Verifies signature, expiry, and issuer, then the mandatory claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthError::InvalidToken("expired".to_string())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            })?;
        data.claims.validate()?;
        Ok(data.claims)
    }
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
