//! Login sessions bound to one tenant.
//!
//! A session is created by [`SessionAuthenticator::login`]: the credentials
//! are checked by a [`CredentialVerifier`], the principal's tenant is looked
//! up in a [`TenantDirectory`], and the tenant context is probed once. A
//! failed probe does not fail the login; the session is marked degraded.
//!
//! Sessions never hold a connection. Every unit of work routed through
//! [`SessionAuthenticator::with_session`] checks one out and releases it.
//!
//! Expired sessions are removed when they are resumed. Sessions that are
//! never resumed stay in memory until [`SessionAuthenticator::purge_expired`]
//! runs, either called by the owner or from
//! [`SessionAuthenticator::spawn_purger`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MAX_SESSION_TTL_SECS;
use crate::connection::ConnectionManager;
use crate::error::{AuthError, RouterError, SessionError};
use crate::router::{BoxFuture, SchemaRouter, TenantHandle};
use crate::tenant::TenantId;

/// Login credentials.
#[derive(Clone)]
pub struct Credentials {
    principal: String,
    secret: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    /// The claimed principal.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    /// Stable principal identifier.
    pub id: String,
}

impl Principal {
    /// Create a principal.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Checks credentials.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify credentials and return the principal they belong to.
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError>;
}

/// Maps principals to tenants.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// The tenant a principal belongs to, if any.
    async fn tenant_for(&self, principal: &Principal) -> Result<Option<TenantId>, AuthError>;
}

/// A directory backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Arc<RwLock<HashMap<String, TenantId>>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a principal to a tenant.
    pub fn assign(&self, principal: impl Into<String>, tenant: impl Into<TenantId>) -> &Self {
        self.entries.write().insert(principal.into(), tenant.into());
        self
    }

    /// Remove a principal.
    pub fn remove(&self, principal: &str) -> Option<TenantId> {
        self.entries.write().remove(principal)
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn tenant_for(&self, principal: &Principal) -> Result<Option<TenantId>, AuthError> {
        Ok(self.entries.read().get(&principal.id).cloned())
    }
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Opaque session token.
    pub token: Uuid,
    /// The authenticated principal.
    pub principal: Principal,
    /// The tenant every unit of work of this session is routed to.
    pub tenant: TenantId,
    /// Set when the login-time probe of the tenant context failed.
    pub degraded: bool,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    expires_at: Instant,
}

impl SessionHandle {
    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

type SessionMap = RwLock<HashMap<Uuid, SessionHandle>>;

/// Creates and validates sessions.
pub struct SessionAuthenticator<C: ConnectionManager> {
    router: SchemaRouter<C>,
    verifier: Arc<dyn CredentialVerifier>,
    directory: Arc<dyn TenantDirectory>,
    sessions: Arc<SessionMap>,
    ttl: Duration,
}

impl<C: ConnectionManager> Clone for SessionAuthenticator<C> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            verifier: Arc::clone(&self.verifier),
            directory: Arc::clone(&self.directory),
            sessions: Arc::clone(&self.sessions),
            ttl: self.ttl,
        }
    }
}

impl<C: ConnectionManager> SessionAuthenticator<C> {
    /// Create an authenticator. Lifetimes above ten years are capped.
    pub fn new(
        router: SchemaRouter<C>,
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn TenantDirectory>,
        ttl: Duration,
    ) -> Self {
        Self {
            router,
            verifier,
            directory,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl: ttl.min(Duration::from_secs(MAX_SESSION_TTL_SECS)),
        }
    }

    fn expiry(&self) -> Instant {
        let now = Instant::now();
        // A deadline the clock cannot represent expires at once.
        now.checked_add(self.ttl).unwrap_or(now)
    }

    /// Authenticate and open a session.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionHandle, AuthError> {
        let principal = match self.verifier.verify(credentials).await {
            Ok(principal) => principal,
            Err(e) => {
                debug!(principal = %credentials.principal(), error = %e, "Login rejected");
                return Err(e);
            }
        };

        let tenant = self
            .directory
            .tenant_for(&principal)
            .await?
            .ok_or_else(|| AuthError::NoTenant {
                principal: principal.id.clone(),
            })?;

        let degraded = match self.router.probe(tenant.clone()).await {
            Ok(schema) => {
                debug!(tenant = %tenant, schema = %schema, "Login probe succeeded");
                false
            }
            Err(e) => {
                warn!(
                    principal = %principal,
                    tenant = %tenant,
                    error = %e,
                    "Login probe failed; session is degraded"
                );
                true
            }
        };

        let handle = SessionHandle {
            token: Uuid::new_v4(),
            principal,
            tenant,
            degraded,
            created_at: Utc::now(),
            expires_at: self.expiry(),
        };
        self.sessions.write().insert(handle.token, handle.clone());

        info!(
            principal = %handle.principal,
            tenant = %handle.tenant,
            degraded = handle.degraded,
            "Session opened"
        );
        Ok(handle)
    }

    /// Look a session up by token. Expired sessions are removed.
    pub fn resume(&self, token: Uuid) -> Result<SessionHandle, AuthError> {
        let handle = self
            .sessions
            .read()
            .get(&token)
            .cloned()
            .ok_or(AuthError::SessionNotFound)?;

        if handle.is_expired() {
            self.sessions.write().remove(&token);
            debug!(tenant = %handle.tenant, "Session expired");
            return Err(AuthError::SessionExpired);
        }
        Ok(handle)
    }

    /// End a session. Returns `false` if it was not open.
    pub fn logout(&self, handle: &SessionHandle) -> bool {
        let removed = self.sessions.write().remove(&handle.token).is_some();
        if removed {
            info!(principal = %handle.principal, tenant = %handle.tenant, "Session closed");
        }
        removed
    }

    /// Run a unit of work for the session's tenant.
    pub async fn with_session<R, E, F>(&self, token: Uuid, work: F) -> Result<R, SessionError<E>>
    where
        F: for<'h> FnOnce(&'h mut TenantHandle<C>) -> BoxFuture<'h, Result<R, E>> + Send,
        R: Send,
        E: Send,
    {
        let handle = self.resume(token)?;
        self.router
            .with_tenant(handle.tenant, work)
            .await
            .map_err(|e: RouterError<E>| SessionError::Router(e))
    }

    /// Remove expired sessions and return how many were removed.
    ///
    /// Nothing calls this on its own. Owners that do not use
    /// [`spawn_purger`](Self::spawn_purger) must call it periodically, or
    /// sessions that are never resumed again accumulate.
    pub fn purge_expired(&self) -> usize {
        purge(&self.sessions)
    }

    /// Purge expired sessions every `every` on the current tokio runtime.
    ///
    /// The task holds no strong reference to the sessions and exits once the
    /// authenticator and all its clones are dropped.
    pub fn spawn_purger(&self, every: Duration) -> JoinHandle<()> {
        let sessions: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        let every = every.clamp(Duration::from_millis(1), Duration::from_secs(MAX_SESSION_TTL_SECS));
        tokio::spawn(async move {
            let start = Instant::now().checked_add(every).unwrap_or_else(Instant::now);
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(sessions) = sessions.upgrade() else {
                    debug!("Session purger stopped");
                    return;
                };
                purge(&sessions);
            }
        })
    }

    /// Number of open sessions, expired or not.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// The router sessions route through.
    pub fn router(&self) -> &SchemaRouter<C> {
        &self.router
    }
}

fn purge(sessions: &SessionMap) -> usize {
    let mut sessions = sessions.write();
    let before = sessions.len();
    sessions.retain(|_, handle| !handle.is_expired());
    let purged = before - sessions.len();
    if purged > 0 {
        debug!(purged, "Purged expired sessions");
    }
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolSettings, TenancySettings};
    use crate::error::DbError;
    use crate::memory::{FaultPoint, MemoryDatabase, MemoryManager};
    use crate::pool::TenantPool;
    use crate::provision::{SchemaProvisioner, SchemaTemplate};
    use crate::registry::TenantRegistry;
    use crate::tenant::SchemaName;

    struct FixedVerifier;

    #[async_trait]
    impl CredentialVerifier for FixedVerifier {
        async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
            if credentials.secret() == "hunter2" {
                Ok(Principal::new(credentials.principal()))
            } else {
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    async fn authenticator(db: &MemoryDatabase, ttl: Duration) -> SessionAuthenticator<MemoryManager> {
        let settings = TenancySettings::default();
        let pool = TenantPool::new(
            MemoryManager::new(db.clone()),
            &PoolSettings::default(),
            SchemaName::public(),
        )
        .unwrap();
        let registry = TenantRegistry::new();
        let template = SchemaTemplate::new(&settings.assert_procedure).unwrap();
        SchemaProvisioner::new(pool.clone(), registry.clone(), template, &settings)
            .provision(1_i64)
            .await
            .unwrap();

        let directory = StaticDirectory::new();
        directory.assign("agent@one", 1_i64).assign("agent@ghost", 404_i64);

        SessionAuthenticator::new(
            SchemaRouter::new(pool, registry, &settings),
            Arc::new(FixedVerifier),
            Arc::new(directory),
            ttl,
        )
    }

    #[tokio::test]
    async fn test_login_and_route() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(60)).await;

        let session = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        assert!(!session.degraded);
        assert_eq!(session.tenant, TenantId::from(1_i64));

        let schema = auth
            .with_session(session.token, |tx| {
                Box::pin(async move { Ok::<_, DbError>(tx.tenant().schema.to_string()) })
            })
            .await
            .unwrap();
        assert_eq!(schema, "client_1");
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(60)).await;

        let err = auth
            .login(&Credentials::new("agent@one", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);

        let err = auth
            .login(&Credentials::new("nobody", "hunter2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoTenant { .. }));
        assert_eq!(auth.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_degrades_session() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(60)).await;

        db.fail(FaultPoint::AssertProcedure);
        db.fail(FaultPoint::DirectAssert);
        let session = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        assert!(session.degraded);

        let ghost = auth
            .login(&Credentials::new("agent@ghost", "hunter2"))
            .await
            .unwrap();
        assert!(ghost.degraded);
    }

    #[tokio::test]
    async fn test_logout_and_unknown_token() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(60)).await;

        let session = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        assert!(auth.logout(&session));
        assert!(!auth.logout(&session));

        let err = auth
            .with_session(session.token, |_tx| Box::pin(async move { Ok::<_, DbError>(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Auth(AuthError::SessionNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_purge() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(30)).await;

        let first = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        let second = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(auth.resume(first.token).unwrap_err(), AuthError::SessionExpired);
        assert_eq!(auth.active_sessions(), 1);
        assert_eq!(auth.purge_expired(), 1);
        assert_eq!(auth.resume(second.token).unwrap_err(), AuthError::SessionNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_purge() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::from_secs(30)).await;
        let purger = auth.spawn_purger(Duration::from_secs(10));

        auth.login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        auth.login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(auth.active_sessions(), 2);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(auth.active_sessions(), 0);

        drop(auth);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(purger.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_is_capped() {
        let db = MemoryDatabase::new();
        let auth = authenticator(&db, Duration::MAX).await;

        let session = auth
            .login(&Credentials::new("agent@one", "hunter2"))
            .await
            .unwrap();
        assert!(!session.is_expired());
        assert!(session.remaining() > Duration::from_secs(MAX_SESSION_TTL_SECS - 60));
        assert!(session.remaining() <= Duration::from_secs(MAX_SESSION_TTL_SECS));
        assert_eq!(auth.resume(session.token).unwrap().token, session.token);

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(auth.resume(session.token).is_ok());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let text = format!("{:?}", Credentials::new("agent@one", "hunter2"));
        assert!(text.contains("agent@one"));
        assert!(!text.contains("hunter2"));
    }
}
