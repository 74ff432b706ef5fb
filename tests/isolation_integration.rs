//! Integration tests for tenant isolation over a shared pool.
//!
//! These tests run against the in-memory backend, which keeps a real
//! per-connection search path, so a context leak between units of work
//! shows up as a row written to the wrong schema.

use std::time::Duration;

use futures::future::join_all;
use proptest::prelude::*;
use tenantry::memory::{MemoryDatabase, MemoryManager};
use tenantry::prelude::*;
use tenantry::AssertScope;

fn tenancy(db: &MemoryDatabase, max_connections: usize, scope: AssertScope) -> Tenancy<MemoryManager> {
    let config = TenancyConfig::builder()
        .max_connections(max_connections)
        .wait_timeout(Duration::from_secs(10))
        .assert_scope(scope)
        .build()
        .expect("valid config");
    let template = SchemaTemplate::new("assert_environment")
        .and_then(|t| t.table("counter", "tenant text, seq bigint"))
        .expect("valid template");
    Tenancy::with_template(MemoryManager::new(db.clone()), config, template).expect("tenancy")
}

async fn tenant_rows(tenancy: &Tenancy<MemoryManager>, tenant: &str) -> Vec<String> {
    tenancy
        .router()
        .with_tenant(tenant, |tx| {
            Box::pin(async move {
                let rows = tx.query("SELECT * FROM counter", &[]).await?;
                rows.iter()
                    .map(|row| row.try_get::<String>("tenant"))
                    .collect::<DbResult<Vec<_>>>()
            })
        })
        .await
        .expect("read counter")
}

async fn run_counter_scenario(scope: AssertScope) {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 2, scope);
    tenancy.provisioner().provision("a").await.unwrap();
    tenancy.provisioner().provision("b").await.unwrap();

    let tasks = ["a", "b"].map(|tag| {
        let router = tenancy.router().clone();
        tokio::spawn(async move {
            for seq in 0..1000_i64 {
                router
                    .with_tenant(tag, move |tx| {
                        Box::pin(async move {
                            tx.execute(
                                "INSERT INTO counter VALUES ($1, $2)",
                                &[tag.into(), seq.into()],
                            )
                            .await
                        })
                    })
                    .await
                    .expect("unit of work");
            }
        })
    });
    for task in tasks {
        task.await.expect("task");
    }

    assert_eq!(db.table_rows("client_a", "counter"), 1000);
    assert_eq!(db.table_rows("client_b", "counter"), 1000);

    let a = tenant_rows(&tenancy, "a").await;
    let b = tenant_rows(&tenancy, "b").await;
    assert!(a.iter().all(|tag| tag == "a"), "cross-write into client_a");
    assert!(b.iter().all(|tag| tag == "b"), "cross-write into client_b");

    let stats = tenancy.pool().stats();
    assert_eq!(stats.connections_discarded, 0);
    assert!(tenancy.pool().status().size <= 2);
}

/// Two tenants, 1000 units of work each, pool of two connections.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_scenario_transaction_scope() {
    run_counter_scenario(AssertScope::Transaction).await;
}

/// The same scenario with a session-scoped context.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_scenario_session_scope() {
    run_counter_scenario(AssertScope::Session).await;
}

/// A unit of work sees only its own tenant's objects, even while another
/// tenant's unit of work holds the other connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_units_see_own_schema() {
    let db = MemoryDatabase::new();
    let tenancy = tenancy(&db, 2, AssertScope::Transaction);
    for id in 1..=4_i64 {
        tenancy.provisioner().provision(id).await.unwrap();
    }

    let probes = (1..=4_i64).cycle().take(40).map(|id| {
        let router = tenancy.router().clone();
        async move { (id, router.probe(id).await) }
    });
    for (id, schema) in join_all(probes).await {
        assert_eq!(schema.unwrap(), format!("client_{}", id));
    }
}

/// One unit of work in a randomized schedule.
#[derive(Debug, Clone)]
struct Step {
    tenant: usize,
    yields: u8,
}

fn schedule() -> impl Strategy<Value = (usize, usize, Vec<Step>)> {
    (3_usize..7).prop_flat_map(|tenants| {
        let steps = prop::collection::vec(
            (0..tenants, 0_u8..4).prop_map(|(tenant, yields)| Step { tenant, yields }),
            1..48,
        );
        (Just(tenants), 1..tenants, steps)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// N tenants over a pool of K < N connections, in random interleavings,
    /// never write into or read from another tenant's schema.
    #[test]
    fn prop_random_interleavings_never_cross(
        (tenants, pool_size, steps) in schedule(),
        session_scope in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("tokio runtime");

        let scope = if session_scope { AssertScope::Session } else { AssertScope::Transaction };
        let ((expected, counts), observed_clean) = runtime.block_on(async {
            let db = MemoryDatabase::new();
            let tenancy = tenancy(&db, pool_size, scope);
            for t in 0..tenants {
                tenancy.provisioner().provision(format!("t{}", t)).await.unwrap();
            }

            let units = steps.iter().enumerate().map(|(seq, step)| {
                let router = tenancy.router().clone();
                let tag = format!("t{}", step.tenant);
                let yields = step.yields;
                tokio::spawn(async move {
                    router
                        .with_tenant(tag.clone(), move |tx| {
                            Box::pin(async move {
                                tx.execute(
                                    "INSERT INTO counter VALUES ($1, $2)",
                                    &[tag.as_str().into(), (seq as i64).into()],
                                )
                                .await?;
                                for _ in 0..yields {
                                    tokio::task::yield_now().await;
                                }
                                let rows = tx.query("SELECT * FROM counter", &[]).await?;
                                let mut clean = true;
                                for row in &rows {
                                    clean &= row.try_get::<String>("tenant")? == tag;
                                }
                                Ok::<_, DbError>(clean)
                            })
                        })
                        .await
                })
            });
            let results = join_all(units).await;

            let mut expected = vec![0_usize; tenants];
            for step in &steps {
                expected[step.tenant] += 1;
            }
            let clean = results
                .into_iter()
                .all(|r| matches!(r, Ok(Ok(true))));
            let counts: Vec<usize> = (0..tenants)
                .map(|t| db.table_rows(&format!("client_t{}", t), "counter"))
                .collect();
            ((expected, counts), clean)
        });

        prop_assert!(observed_clean, "a unit of work observed another tenant's rows");
        prop_assert_eq!(expected, counts);
    }
}
