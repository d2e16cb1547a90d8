//! Session derivation: from a raw bearer token to an authorized,
//! tenant-scoped request context.
//!
//! The manager owns the token codec and a DAO handle. Issuance traverses the
//! persisted user's references at local consistency to build the grant
//! claims; authorization walks the other direction, resolving the requested
//! organization and farm scope against what the token carries and what the
//! farm records say. Every rejection is logged with the user and the scope
//! that was refused.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use loam_core::dao::Dao;
use loam_model::farm::Farm;
use loam_model::ids::{FarmId, OrgId};
use loam_model::server::Server;
use loam_model::user::{User, ADMIN_ROLE};
use loam_model::ConsistencyLevel;

use crate::error::AuthError;
use crate::keystore::Keystore;
use crate::password;
use crate::token::{Claims, FarmClaim, OrgClaim, TokenCodec};

/// Tunables for issuance and scope resolution.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keystore subject whose keypair signs and verifies tokens.
    pub key_subject: String,
    /// Issuer stamped into and required from every token.
    pub issuer: String,
    /// Token lifetime.
    pub token_ttl: Duration,
    /// Account granted the admin role when it carries no explicit grants.
    pub default_admin_email: String,
    /// Role assigned when neither grants nor the admin default apply.
    pub default_role: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            key_subject: "server".to_string(),
            issuer: "loam".to_string(),
            token_ttl: Duration::from_secs(24 * 60 * 60),
            default_admin_email: "root@localhost".to_string(),
            default_role: "viewer".to_string(),
        }
    }
}

/// Raw request inputs a transport hands to [`SessionManager::authorize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionRequest<'a> {
    /// Authorization header value, if the request carried one.
    pub authorization: Option<&'a str>,
    /// Token query-parameter value, if present.
    pub query_token: Option<&'a str>,
    /// Organization scope from the request path.
    pub org_id: Option<OrgId>,
    /// Farm scope from the request path.
    pub farm_id: Option<FarmId>,
}

/// An authorized request scope. Plain data; dropping it at the end of the
/// request releases everything it holds.
#[derive(Debug, Clone)]
pub struct Session {
    /// Snapshot of the user the token resolved to.
    pub user: User,
    /// Organization scope, when the request named one.
    pub org_id: Option<OrgId>,
    /// Farm scope, when the request named one.
    pub farm_id: Option<FarmId>,
    /// Resolved farm configuration, when a farm scope was named.
    pub farm: Option<Farm>,
    /// Effective role names for this request.
    pub roles: Vec<String>,
    /// Read consistency for this request, taken from the resolved farm.
    pub consistency: ConsistencyLevel,
    /// Tracing span carrying the session identity.
    pub span: tracing::Span,
}

impl Session {
    /// True if the session carries the named role.
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r == name)
    }

    /// True if the session carries the admin role.
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// Pulls the bearer token out of an Authorization header value or a query
/// parameter, header first.
pub fn bearer_token<'a>(
    authorization: Option<&'a str>,
    query_token: Option<&'a str>,
) -> Result<&'a str, AuthError> {
    if let Some(header) = authorization {
        if let Some(token) = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Ok(token);
            }
        }
    }
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    Err(AuthError::MissingToken)
}

/// Issues, refreshes, and verifies sessions against one deployment.
pub struct SessionManager {
    dao: Arc<Dao>,
    codec: TokenCodec,
    config: SessionConfig,
    server_id: u64,
}

impl SessionManager {
    /// Builds the manager, loading the signing keypair from the keystore.
    pub fn new(
        dao: Arc<Dao>,
        keystore: &dyn Keystore,
        config: SessionConfig,
    ) -> Result<Self, AuthError> {
        let codec = TokenCodec::from_keystore(
            keystore,
            &config.key_subject,
            &config.issuer,
            config.token_ttl,
        )?;
        Ok(SessionManager {
            dao,
            codec,
            config,
            server_id: Server::singleton_id(),
        })
    }

    /// Authenticates credentials and issues a signed token carrying the
    /// user's current grants.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let id = User::id_for_email(email).as_u64();
        let user = match self.dao.users.try_get(id, ConsistencyLevel::Local).await? {
            Some(user) => user,
            None => {
                warn!(email = %email, "login for unknown user");
                return Err(AuthError::BadCredentials);
            }
        };
        if !password::verify(&user.password_hash, password)? {
            warn!(email = %email, "login with wrong password");
            return Err(AuthError::BadCredentials);
        }
        let token = self.issue(&user).await?;
        info!(email = %email, user_id = %user.id, "login succeeded");
        Ok(token)
    }

    /// Re-issues a token for the user named by a still-valid token,
    /// re-materializing the grants from current state.
    pub async fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let claims = self.codec.verify(token)?;
        let user = match self
            .dao
            .users
            .try_get(claims.uid, ConsistencyLevel::Local)
            .await?
        {
            Some(user) => user,
            None => {
                warn!(uid = claims.uid, "refresh for a user that no longer exists");
                return Err(AuthError::InvalidToken("unknown user".to_string()));
            }
        };
        self.issue(&user).await
    }

    /// Verifies a raw token and returns its claims. Transports use this when
    /// they only need identity, not scope resolution.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.codec.verify(token)
    }

    /// Derives an authorized session from raw request inputs: extract the
    /// bearer token, verify it, resolve the requested organization and farm
    /// scope, and settle effective roles and read consistency.
    pub async fn authorize(&self, request: SessionRequest<'_>) -> Result<Session, AuthError> {
        let token = bearer_token(request.authorization, request.query_token)?;
        let claims = self.codec.verify(token)?;
        let user = match self
            .dao
            .users
            .try_get(claims.uid, ConsistencyLevel::Local)
            .await?
        {
            Some(user) => user,
            None => {
                warn!(uid = claims.uid, "token names a user that no longer exists");
                return Err(AuthError::InvalidToken("unknown user".to_string()));
            }
        };

        let mut roles: Vec<String> = Vec::new();
        let mut org_grant: Option<OrgClaim> = None;
        if let Some(org_id) = request.org_id {
            let grants = claims.organization_claims()?;
            match grants.into_iter().find(|g| g.id == org_id.as_u64()) {
                Some(grant) => {
                    roles.clone_from(&grant.roles);
                    org_grant = Some(grant);
                }
                None => {
                    warn!(user_id = %user.id, org_id = %org_id, "organization scope rejected");
                    return Err(AuthError::NotMember {
                        user_id: user.id.as_u64(),
                        resource: format!("organization {}", org_id),
                    });
                }
            }
        }

        let mut farm = None;
        if let Some(farm_id) = request.farm_id {
            if let Some(grant) = &org_grant {
                // Farm reached through the requested organization: the grant
                // decides membership and may refine the roles.
                match grant.farms.iter().find(|f| f.id == farm_id.as_u64()) {
                    Some(f) => {
                        if !f.roles.is_empty() {
                            roles.clone_from(&f.roles);
                        }
                    }
                    None => {
                        warn!(user_id = %user.id, farm_id = %farm_id, "farm scope rejected");
                        return Err(AuthError::NotMember {
                            user_id: user.id.as_u64(),
                            resource: format!("farm {}", farm_id),
                        });
                    }
                }
                farm = self
                    .dao
                    .farms
                    .try_get(farm_id, ConsistencyLevel::Local)
                    .await?;
            } else {
                // No organization requested: the farm record's member list
                // decides, and the persisted user supplies the roles.
                match self
                    .dao
                    .farms
                    .try_get(farm_id, ConsistencyLevel::Local)
                    .await?
                {
                    Some(stored) if stored.has_user(user.id) => {
                        roles = user.roles.iter().map(|r| r.name.clone()).collect();
                        farm = Some(stored);
                    }
                    _ => {
                        warn!(user_id = %user.id, farm_id = %farm_id, "farm scope rejected");
                        return Err(AuthError::NotMember {
                            user_id: user.id.as_u64(),
                            resource: format!("farm {}", farm_id),
                        });
                    }
                }
            }
        }

        if roles.is_empty() {
            roles = if user.email == self.config.default_admin_email {
                vec![ADMIN_ROLE.to_string()]
            } else {
                vec![self.config.default_role.clone()]
            };
        }

        let consistency = farm
            .as_ref()
            .map(|f| f.consistency_level)
            .unwrap_or_default();
        let span = tracing::info_span!("session", user_id = %user.id, email = %user.email);
        debug!(user_id = %user.id, roles = ?roles, "session opened");

        Ok(Session {
            user,
            org_id: request.org_id,
            farm_id: request.farm_id,
            farm,
            roles,
            consistency,
            span,
        })
    }

    /// Builds the grant claims from the user's persisted references and
    /// signs a fresh token. Dangling references are logged and skipped.
    async fn issue(&self, user: &User) -> Result<String, AuthError> {
        let role_names: Vec<String> = user.roles.iter().map(|r| r.name.clone()).collect();

        let mut org_claims = Vec::new();
        for org_id in &user.organization_refs {
            match self
                .dao
                .orgs
                .try_get(org_id.as_u64(), ConsistencyLevel::Local)
                .await?
            {
                Some(org) => org_claims.push(OrgClaim {
                    id: org.id.as_u64(),
                    name: org.name.clone(),
                    farms: org
                        .farms
                        .iter()
                        .map(|f| FarmClaim {
                            id: f.id.as_u64(),
                            name: f.name.clone(),
                            roles: role_names.clone(),
                        })
                        .collect(),
                    roles: role_names.clone(),
                }),
                None => warn!(org_id = %org_id, "user references a missing organization"),
            }
        }

        let mut farm_claims = Vec::new();
        for farm_id in &user.farm_refs {
            match self
                .dao
                .farms
                .try_get(*farm_id, ConsistencyLevel::Local)
                .await?
            {
                Some(f) => farm_claims.push(FarmClaim {
                    id: f.id.as_u64(),
                    name: f.name.clone(),
                    roles: role_names.clone(),
                }),
                None => warn!(farm_id = %farm_id, "user references a missing farm"),
            }
        }

        self.codec
            .issue(self.server_id, user, &org_claims, &farm_claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::config::NodeConfig;
    use loam_core::dao::GroupTopology;
    use loam_core::host::GroupHost;
    use loam_core::permissions::Permission;
    use loam_core::transport::LoopbackTransport;
    use loam_model::org::Organization;

    use crate::keystore::{DirKeystore, REVOKED_DIR};
    use crate::testkeys;

    async fn manager() -> (tempfile::TempDir, Arc<Dao>, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        testkeys::write_keypair(dir.path(), "server");
        let host = GroupHost::new(NodeConfig::default(), Arc::new(LoopbackTransport::new()))
            .unwrap();
        let dao = Arc::new(Dao::open(host, GroupTopology::default()).unwrap());
        let keystore = DirKeystore::open(dir.path());
        let manager =
            SessionManager::new(Arc::clone(&dao), &keystore, SessionConfig::default()).unwrap();
        (dir, dao, manager)
    }

    async fn seed_member(dao: &Dao, email: &str, password: &str, farm_name: &str) -> (User, Farm) {
        let mut user = User::with_email(email);
        user.password_hash = crate::password::hash(password).unwrap();
        dao.users.save(&mut user).await.unwrap();

        let mut farm = Farm {
            name: farm_name.to_string(),
            consistency_level: ConsistencyLevel::Quorum,
            ..Farm::default()
        };
        dao.farms.save(&mut farm).await.unwrap();

        let permission = Permission {
            farm_id: farm.id,
            user_id: user.id,
            ..Permission::default()
        };
        dao.permissions.save(&permission).await.unwrap();

        let user = dao
            .users
            .get(user.id.as_u64(), ConsistencyLevel::Quorum)
            .await
            .unwrap();
        let farm = dao.farms.get(farm.id, ConsistencyLevel::Quorum).await.unwrap();
        (user, farm)
    }

    #[test]
    fn test_bearer_token_prefers_header() {
        assert_eq!(bearer_token(Some("Bearer abc"), Some("xyz")).unwrap(), "abc");
        assert_eq!(bearer_token(None, Some("xyz")).unwrap(), "xyz");
        // An unparseable header falls through to the query parameter.
        assert_eq!(bearer_token(Some("Basic zzz"), Some("xyz")).unwrap(), "xyz");
        assert!(matches!(
            bearer_token(Some("Bearer "), None),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(bearer_token(None, None), Err(AuthError::MissingToken)));
    }

    #[tokio::test]
    async fn test_login_issues_token_with_farm_grants() {
        let (_dir, dao, manager) = manager().await;
        let (user, farm) = seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;

        let token = manager.login("grower@localhost", "$ecret").await.unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.uid, user.id.as_u64());
        assert_eq!(claims.email, "grower@localhost");

        let farms = claims.farm_claims().unwrap();
        assert_eq!(farms.len(), 1);
        assert_eq!(farms[0].id, farm.id.as_u64());
        assert_eq!(farms[0].name, "Test Farm");
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let (_dir, dao, manager) = manager().await;
        seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;

        assert!(matches!(
            manager.login("grower@localhost", "wrong").await,
            Err(AuthError::BadCredentials)
        ));
        assert!(matches!(
            manager.login("nobody@localhost", "$ecret").await,
            Err(AuthError::BadCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_grants() {
        let (_dir, dao, manager) = manager().await;
        let (user, _farm) = seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;
        let token = manager.login("grower@localhost", "$ecret").await.unwrap();

        let mut second = Farm {
            name: "South Farm".to_string(),
            ..Farm::default()
        };
        dao.farms.save(&mut second).await.unwrap();
        let permission = Permission {
            farm_id: second.id,
            user_id: user.id,
            ..Permission::default()
        };
        dao.permissions.save(&permission).await.unwrap();

        let refreshed = manager.refresh(&token).await.unwrap();
        let claims = manager.verify(&refreshed).unwrap();
        assert_eq!(claims.farm_claims().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_authorize_scopes_to_member_farm() {
        let (_dir, dao, manager) = manager().await;
        let (user, farm) = seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;
        let token = manager.login("grower@localhost", "$ecret").await.unwrap();
        let header = format!("Bearer {}", token);

        let session = manager
            .authorize(SessionRequest {
                authorization: Some(&header),
                farm_id: Some(farm.id),
                ..SessionRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(session.user.id, user.id);
        assert_eq!(session.farm_id, Some(farm.id));
        assert_eq!(session.farm.as_ref().map(|f| f.id), Some(farm.id));
        // The member carries no explicit roles, so the configured default
        // applies, and consistency follows the farm record.
        assert_eq!(session.roles, vec!["viewer".to_string()]);
        assert_eq!(session.consistency, ConsistencyLevel::Quorum);
    }

    #[tokio::test]
    async fn test_token_for_one_farm_rejected_on_another() {
        let (_dir, dao, manager) = manager().await;
        let (_user, _f1) = seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;
        let (_other, f2) = seed_member(&dao, "other@localhost", "pw", "South Farm").await;

        let token = manager.login("grower@localhost", "$ecret").await.unwrap();
        let header = format!("Bearer {}", token);

        let err = manager
            .authorize(SessionRequest {
                authorization: Some(&header),
                farm_id: Some(f2.id),
                ..SessionRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::NotMember { resource, .. } if resource.contains("farm")
        ));
    }

    #[tokio::test]
    async fn test_authorize_org_scope() {
        let (_dir, dao, manager) = manager().await;
        let (user, _farm) = seed_member(&dao, "grower@localhost", "$ecret", "Test Farm").await;

        let mut org = Organization {
            name: "Acme Growers".to_string(),
            ..Organization::default()
        };
        dao.orgs.save(&mut org).await.unwrap();
        let permission = Permission {
            org_id: org.id,
            user_id: user.id,
            ..Permission::default()
        };
        dao.permissions.save(&permission).await.unwrap();

        let token = manager.login("grower@localhost", "$ecret").await.unwrap();
        let header = format!("Bearer {}", token);

        let session = manager
            .authorize(SessionRequest {
                authorization: Some(&header),
                org_id: Some(org.id),
                ..SessionRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(session.org_id, Some(org.id));
        assert_eq!(session.consistency, ConsistencyLevel::Local);

        let err = manager
            .authorize(SessionRequest {
                authorization: Some(&header),
                org_id: Some(OrgId::new(999)),
                ..SessionRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::NotMember { resource, .. } if resource.contains("organization")
        ));
    }

    #[tokio::test]
    async fn test_default_admin_gets_admin_role() {
        let (_dir, dao, manager) = manager().await;
        let mut root = User::with_email("root@localhost");
        root.password_hash = crate::password::hash("$ecret").unwrap();
        dao.users.save(&mut root).await.unwrap();

        let token = manager.login("root@localhost", "$ecret").await.unwrap();
        let header = format!("Bearer {}", token);
        let session = manager
            .authorize(SessionRequest {
                authorization: Some(&header),
                ..SessionRequest::default()
            })
            .await
            .unwrap();

        assert!(session.is_admin());
        assert_eq!(session.consistency, ConsistencyLevel::Local);
        assert!(session.farm.is_none());
    }

    #[tokio::test]
    async fn test_revoked_signing_subject_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        testkeys::write_keypair(dir.path(), "server");
        std::fs::create_dir(dir.path().join(REVOKED_DIR)).unwrap();
        std::fs::write(dir.path().join(REVOKED_DIR).join("server.crt"), "x").unwrap();

        let host = GroupHost::new(NodeConfig::default(), Arc::new(LoopbackTransport::new()))
            .unwrap();
        let dao = Arc::new(Dao::open(host, GroupTopology::default()).unwrap());
        let keystore = DirKeystore::open(dir.path());
        assert!(matches!(
            SessionManager::new(dao, &keystore, SessionConfig::default()),
            Err(AuthError::CertRevoked(_))
        ));
    }
}
