//! Integration tests for login sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tenantry::memory::{FaultPoint, MemoryDatabase, MemoryManager};
use tenantry::prelude::*;
use tenantry::{AuthError, CredentialVerifier, Principal, SessionError, StaticDirectory};

/// Accepts a fixed set of principal/secret pairs.
struct FixedVerifier {
    accounts: HashMap<String, String>,
}

impl FixedVerifier {
    fn new(accounts: &[(&str, &str)]) -> Self {
        Self {
            accounts: accounts
                .iter()
                .map(|(p, s)| (p.to_string(), s.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for FixedVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        match self.accounts.get(credentials.principal()) {
            Some(secret) if secret == credentials.secret() => {
                Ok(Principal::new(credentials.principal()))
            }
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

async fn setup(db: &MemoryDatabase) -> (Tenancy<MemoryManager>, SessionAuthenticator<MemoryManager>) {
    let config = TenancyConfig::builder()
        .max_connections(2)
        .session_ttl(Duration::from_secs(60))
        .build()
        .expect("valid config");
    let template = SchemaTemplate::new("assert_environment")
        .and_then(|t| t.table("listings", "id bigint, title text"))
        .expect("valid template");
    let tenancy =
        Tenancy::with_template(MemoryManager::new(db.clone()), config, template).expect("tenancy");
    tenancy.provisioner().provision(1_i64).await.unwrap();
    tenancy.provisioner().provision(2_i64).await.unwrap();

    let directory = StaticDirectory::new();
    directory
        .assign("alice@agency-one", 1_i64)
        .assign("bob@agency-two", 2_i64)
        .assign("carol@nowhere", 99_i64);

    let verifier = FixedVerifier::new(&[
        ("alice@agency-one", "hunter2"),
        ("bob@agency-two", "correct horse"),
        ("carol@nowhere", "pw"),
        ("dave@unassigned", "pw"),
    ]);
    let auth = tenancy.authenticator(Arc::new(verifier), Arc::new(directory));
    (tenancy, auth)
}

#[tokio::test]
async fn test_sessions_route_to_their_tenant() {
    let db = MemoryDatabase::new();
    let (_tenancy, auth) = setup(&db).await;

    let alice = auth
        .login(&Credentials::new("alice@agency-one", "hunter2"))
        .await
        .unwrap();
    let bob = auth
        .login(&Credentials::new("bob@agency-two", "correct horse"))
        .await
        .unwrap();
    assert!(!alice.degraded);
    assert_eq!(alice.tenant, TenantId::from(1_i64));

    for session in [&alice, &alice, &bob] {
        auth.with_session(session.token, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO listings VALUES (1, 'Loft')", &[])
                    .await
            })
        })
        .await
        .unwrap();
    }

    assert_eq!(db.table_rows("client_1", "listings"), 2);
    assert_eq!(db.table_rows("client_2", "listings"), 1);
}

#[tokio::test]
async fn test_login_rejections() {
    let db = MemoryDatabase::new();
    let (_tenancy, auth) = setup(&db).await;

    let err = auth
        .login(&Credentials::new("alice@agency-one", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));

    let err = auth
        .login(&Credentials::new("dave@unassigned", "pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NoTenant { .. }));
    assert_eq!(auth.active_sessions(), 0);
}

/// A failed login probe does not fail the login.
#[tokio::test]
async fn test_failed_probe_degrades_session() {
    let db = MemoryDatabase::new();
    let (tenancy, auth) = setup(&db).await;

    db.fail(FaultPoint::AssertProcedure);
    db.fail(FaultPoint::DirectAssert);
    let session = auth
        .login(&Credentials::new("alice@agency-one", "hunter2"))
        .await
        .unwrap();
    assert!(session.degraded);

    db.clear_faults();
    let schema = auth
        .with_session(session.token, |tx| {
            Box::pin(async move { tx.current_schema().await })
        })
        .await
        .unwrap();
    assert_eq!(schema.as_deref(), Some("client_1"));

    let stats = tenancy.pool().stats();
    assert_eq!(
        stats.connections_acquired,
        stats.connections_released + stats.connections_discarded
    );
}

/// A principal mapped to a tenant that was never provisioned still logs in,
/// degraded; its units of work are rejected.
#[tokio::test]
async fn test_unprovisioned_tenant_session() {
    let db = MemoryDatabase::new();
    let (_tenancy, auth) = setup(&db).await;

    let session = auth
        .login(&Credentials::new("carol@nowhere", "pw"))
        .await
        .unwrap();
    assert!(session.degraded);

    let err = auth
        .with_session(session.token, |tx| {
            Box::pin(async move { tx.query("SELECT * FROM listings", &[]).await })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Router(RouterError::UnknownTenant(_))));
}

#[tokio::test]
async fn test_logout_ends_session() {
    let db = MemoryDatabase::new();
    let (tenancy, auth) = setup(&db).await;

    let session = auth
        .login(&Credentials::new("bob@agency-two", "correct horse"))
        .await
        .unwrap();
    let available = tenancy.pool().status().available;

    assert!(auth.logout(&session));
    assert!(!auth.logout(&session));
    assert!(matches!(auth.resume(session.token), Err(AuthError::SessionNotFound)));

    let err = auth
        .with_session(session.token, |tx| {
            Box::pin(async move { tx.current_schema().await })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Auth(AuthError::SessionNotFound)));

    // Logout never touches pooled connections.
    assert_eq!(tenancy.pool().status().available, available);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_expire() {
    let db = MemoryDatabase::new();
    let (_tenancy, auth) = setup(&db).await;

    let session = auth
        .login(&Credentials::new("alice@agency-one", "hunter2"))
        .await
        .unwrap();
    assert!(auth.resume(session.token).is_ok());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(session.is_expired());
    assert!(matches!(auth.resume(session.token), Err(AuthError::SessionExpired)));
    assert_eq!(auth.active_sessions(), 0);

    auth.login(&Credentials::new("bob@agency-two", "correct horse"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(auth.purge_expired(), 1);
}
