//! Integration tests for connection release.
//!
//! Every checkout must end with the connection back in the pool in the
//! neutral context, or closed. Nothing else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tenantry::memory::{FaultPoint, MemoryDatabase, MemoryManager};
use tenantry::prelude::*;
use tenantry::{AssertScope, ReleaseOutcome};

fn tenancy(db: &MemoryDatabase, max_connections: usize, scope: AssertScope) -> Tenancy<MemoryManager> {
    let config = TenancyConfig::builder()
        .max_connections(max_connections)
        .wait_timeout(Duration::from_secs(5))
        .assert_scope(scope)
        .build()
        .expect("valid config");
    let template = SchemaTemplate::new("assert_environment")
        .and_then(|t| t.table("listings", "id bigint, title text"))
        .expect("valid template");
    Tenancy::with_template(MemoryManager::new(db.clone()), config, template).expect("tenancy")
}

fn assert_balanced(tenancy: &Tenancy<MemoryManager>) {
    let stats = tenancy.pool().stats();
    assert_eq!(
        stats.connections_acquired,
        stats.connections_released + stats.connections_discarded,
        "every checkout ends in a release or a discard: {:?}",
        stats
    );
}

/// With one connection, the connection a tenant used comes back neutral.
async fn check_no_residue(scope: AssertScope) {
    let db = MemoryDatabase::new();
    db.create_table(&SchemaName::public(), "listings", "id bigint, title text")
        .unwrap();
    let tenancy = tenancy(&db, 1, scope);
    tenancy.provisioner().provision(1_i64).await.unwrap();

    let used = tenancy
        .router()
        .with_tenant(1_i64, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO listings VALUES (1, 'Loft')", &[])
                    .await?;
                Ok::<_, DbError>(tx.connection_id())
            })
        })
        .await
        .unwrap();

    let mut conn = tenancy.pool().checkout().await.unwrap();
    assert_eq!(conn.id(), used, "pool of one hands out the same connection");
    assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("public"));
    assert_eq!(conn.search_path().await.unwrap(), vec!["public".to_string()]);
    assert_eq!(tenancy.pool().release(conn).await, ReleaseOutcome::Returned);

    assert_eq!(db.table_rows("client_1", "listings"), 1);
    assert_eq!(db.table_rows("public", "listings"), 0);
}

#[tokio::test]
async fn test_no_residue_transaction_scope() {
    check_no_residue(AssertScope::Transaction).await;
}

#[tokio::test]
async fn test_no_residue_session_scope() {
    check_no_residue(AssertScope::Session).await;
}

/// Units of work that fail leave the pool as they found it.
#[tokio::test]
async fn test_failed_units_leave_pool_unchanged() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 2, AssertScope::Session);
    tenancy.provisioner().provision(1_i64).await.unwrap();
    tenancy.router().probe(1_i64).await.unwrap();
    let before = tenancy.pool().status();

    for n in 0..25_i64 {
        let err = tenancy
            .router()
            .with_tenant(1_i64, move |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO listings VALUES ($1, 'draft')", &[n.into()])
                        .await?;
                    Err::<(), _>(DbError::other("rejected by business rule"))
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::WorkFailed(_)));
    }

    for _ in 0..5 {
        let err = tenancy
            .router()
            .with_tenant(1_i64, |tx| {
                Box::pin(async move { tx.execute("SELECT * FROM missing", &[]).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::WorkFailed(_)));
    }

    assert_eq!(tenancy.pool().status().available, before.available);
    assert_eq!(tenancy.pool().stats().connections_discarded, 0);
    assert_eq!(db.table_rows("client_1", "listings"), 0);
    assert_balanced(&tenancy);
}

/// A panicking unit of work releases its connection before the panic
/// reaches the caller.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_units_release() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 1, AssertScope::Session);
    tenancy.provisioner().provision(1_i64).await.unwrap();

    for _ in 0..10 {
        let router = tenancy.router().clone();
        let joined = tokio::spawn(async move {
            router
                .with_tenant(1_i64, |tx| {
                    Box::pin(async move {
                        tx.execute("INSERT INTO listings VALUES (1, 'x')", &[])
                            .await?;
                        if tx.connection_id() > 0 {
                            panic!("unit of work blew up");
                        }
                        Ok::<_, DbError>(())
                    })
                })
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
    }

    assert_eq!(tenancy.pool().stats().connections_discarded, 0);
    assert_eq!(db.table_rows("client_1", "listings"), 0);
    assert_balanced(&tenancy);

    let mut conn = tenancy.pool().checkout().await.unwrap();
    assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("public"));
    tenancy.pool().release(conn).await;
}

/// A cancelled unit of work closes its connection instead of returning it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_unit_discards_connection() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 1, AssertScope::Session);
    tenancy.provisioner().provision(1_i64).await.unwrap();
    tenancy.provisioner().provision(2_i64).await.unwrap();

    let router = tenancy.router().clone();
    let task = tokio::spawn(async move {
        router
            .with_tenant(1_i64, |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO listings VALUES (1, 'x')", &[])
                        .await?;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, DbError>(())
                })
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(tenancy.pool().stats().connections_discarded, 1);
    assert_eq!(db.open_connections(), 0);
    assert_eq!(db.table_rows("client_1", "listings"), 0);

    // The replacement connection starts neutral.
    assert_eq!(tenancy.router().probe(2_i64).await.unwrap(), "client_2");
    assert_balanced(&tenancy);
}

/// A connection whose reset fails is closed rather than reused.
#[tokio::test]
async fn test_failed_reset_discards_connection() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 1, AssertScope::Session);
    tenancy.provisioner().provision(1_i64).await.unwrap();
    tenancy.provisioner().provision(2_i64).await.unwrap();
    let opened = db.connections_opened();

    db.fail_times(FaultPoint::Reset, 1);
    assert_eq!(tenancy.router().probe(1_i64).await.unwrap(), "client_1");
    assert_eq!(tenancy.pool().stats().connections_discarded, 1);

    assert_eq!(tenancy.router().probe(2_i64).await.unwrap(), "client_2");
    assert_eq!(db.connections_opened(), opened + 1);
    assert_balanced(&tenancy);
}

/// Unknown tenants never reach the pool and never run the unit of work.
#[tokio::test]
async fn test_unknown_tenant_never_checks_out() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 2, AssertScope::Transaction);
    tenancy.provisioner().provision(1_i64).await.unwrap();
    let acquired = tenancy.pool().stats().connections_acquired;
    let opened = db.connections_opened();

    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    let err = tenancy
        .router()
        .with_tenant("never-provisioned", move |_tx| {
            flag.store(true, Ordering::SeqCst);
            Box::pin(async move { Ok::<_, DbError>(()) })
        })
        .await
        .unwrap_err();

    assert!(err.is_unknown_tenant());
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(tenancy.pool().stats().connections_acquired, acquired);
    assert_eq!(db.connections_opened(), opened);
}

/// Shutdown closes the pool; later units of work fail without running.
#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 2, AssertScope::Transaction);
    tenancy.provisioner().provision(1_i64).await.unwrap();
    tenancy.router().probe(1_i64).await.unwrap();

    tenancy.shutdown();
    let err = tenancy.router().probe(1_i64).await.unwrap_err();
    assert!(matches!(err, RouterError::Database(ref e) if e.kind == tenantry::DbErrorKind::Closed));
}
