//! Tenant scoping of every generated query.

use serde_json::json;

use clinic_kernel::identity::Role;
use clinic_kernel::query::{row_id, ScopedQuery};
use clinic_kernel::KernelError;

use crate::support::{admin, count, field, insert_patient, kernel, principal, tenant};

#[tokio::test]
async fn select_never_returns_other_tenant_rows() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    insert_patient(&kernel, &t1, "Ana").await;
    insert_patient(&kernel, &t1, "Ben").await;

    let rows = kernel
        .scoped_query(&t2, &ScopedQuery::select(&t2, "patients"))
        .await
        .expect("select should succeed");
    assert!(rows.is_empty(), "tenant 2 must not see tenant 1 patients");

    let rows = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients"))
        .await
        .expect("select should succeed");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| field(r, "tenant_id") == &json!(1)));
}

#[tokio::test]
async fn insert_stamps_principal_tenant() {
    let kernel = kernel().await;
    let t3 = admin(3);
    let query = ScopedQuery::insert(&t3, "patients")
        .set("first_name", "Cleo")
        .set("last_name", "Park");
    let outcome = kernel.mutate(&t3, &query, &[]).await.expect("insert should succeed");
    assert_eq!(field(&outcome.rows[0], "tenant_id"), &json!(3));
    assert_eq!(field(&outcome.rows[0], "first_name"), &json!("Cleo"));
}

#[tokio::test]
async fn tenant_override_in_values_is_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let query = ScopedQuery::insert(&t1, "patients")
        .set("first_name", "Eve")
        .set("last_name", "Intruder")
        .set("tenant_id", 2);
    let err = kernel.mutate(&t1, &query, &[]).await.expect_err("override must fail");
    assert!(matches!(err, KernelError::TenantMismatch { .. }));
    assert!(err.is_security_event());
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM patients").await, 0);
}

#[tokio::test]
async fn restating_own_tenant_in_filter_is_allowed() {
    let kernel = kernel().await;
    let t1 = admin(1);
    insert_patient(&kernel, &t1, "Ana").await;
    let rows = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients").filter("tenant_id", 1))
        .await
        .expect("own tenant filter is fine");
    assert_eq!(rows.len(), 1);

    let err = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients").filter("tenant_id", 2))
        .await
        .expect_err("foreign tenant filter must fail");
    assert!(matches!(err, KernelError::TenantMismatch { .. }));
}

#[tokio::test]
async fn update_by_id_cannot_reach_other_tenant() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    let id = insert_patient(&kernel, &t1, "Ana").await;

    let query = ScopedQuery::update(&t2, "patients")
        .filter("id", id)
        .set("notes", "tampered");
    let outcome = kernel.mutate(&t2, &query, &[]).await.expect("update runs");
    assert!(outcome.rows.is_empty());
    assert!(outcome.audit_ids.is_empty(), "no rows changed, nothing audited");

    let rows = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients").filter("id", id))
        .await
        .expect("select should succeed");
    assert_eq!(field(&rows[0], "notes"), &serde_json::Value::Null);
}

#[tokio::test]
async fn delete_by_id_cannot_reach_other_tenant() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    let id = insert_patient(&kernel, &t1, "Ana").await;

    let outcome = kernel
        .mutate(&t2, &ScopedQuery::delete(&t2, "patients").filter("id", id), &[])
        .await
        .expect("delete runs");
    assert!(outcome.rows.is_empty());
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM patients").await, 1);
}

#[tokio::test]
async fn unbounded_mutations_are_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);
    insert_patient(&kernel, &t1, "Ana").await;

    let err = kernel
        .mutate(&t1, &ScopedQuery::delete(&t1, "patients"), &[])
        .await
        .expect_err("delete without filter must fail");
    assert!(matches!(err, KernelError::UnboundedMutation { .. }));

    // A tenant filter alone does not bound the mutation.
    let err = kernel
        .mutate(
            &t1,
            &ScopedQuery::update(&t1, "patients")
                .filter("tenant_id", 1)
                .set("notes", "all"),
            &[],
        )
        .await
        .expect_err("update without filter must fail");
    assert!(matches!(err, KernelError::UnboundedMutation { .. }));
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM patients").await, 1);
}

#[tokio::test]
async fn query_built_for_one_principal_cannot_run_for_another() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    let query = ScopedQuery::select(&t1, "patients");
    let err = kernel
        .scoped_query(&t2, &query)
        .await
        .expect_err("scope mismatch must fail");
    assert!(matches!(
        err,
        KernelError::TenantMismatch { expected, .. } if expected == tenant(2)
    ));
}

#[tokio::test]
async fn unknown_entity_and_column_are_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);

    let err = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "sqlite_master"))
        .await
        .expect_err("unregistered table must fail");
    assert!(matches!(err, KernelError::UnknownEntity(_)));

    let err = kernel
        .scoped_query(
            &t1,
            &ScopedQuery::select(&t1, "patients").filter("1=1 OR first_name", "x"),
        )
        .await
        .expect_err("unregistered column must fail");
    assert!(matches!(err, KernelError::UnknownColumn { .. }));
}

#[tokio::test]
async fn assigning_row_id_is_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let query = ScopedQuery::insert(&t1, "patients")
        .set("id", 100)
        .set("first_name", "Ana")
        .set("last_name", "Li");
    let err = kernel.mutate(&t1, &query, &[]).await.expect_err("id is store-assigned");
    assert!(matches!(err, KernelError::InvalidValue { .. }));
}

#[tokio::test]
async fn update_returns_rows_after_change() {
    let kernel = kernel().await;
    let doctor = principal(4, 40, Role::Doctor);
    let id = insert_patient(&kernel, &doctor, "Ana").await;

    let outcome = kernel
        .mutate(
            &doctor,
            &ScopedQuery::update(&doctor, "patients")
                .filter("id", id)
                .set("phone", "555-0100"),
            &[],
        )
        .await
        .expect("update should succeed");
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(row_id(&outcome.rows[0]), Some(id));
    assert_eq!(field(&outcome.rows[0], "phone"), &json!("555-0100"));
}

#[tokio::test]
async fn select_paginates_in_id_order() {
    let kernel = kernel().await;
    let t1 = admin(1);
    for name in ["A", "B", "C", "D"] {
        insert_patient(&kernel, &t1, name).await;
    }
    let rows = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients").limit(2).offset(1))
        .await
        .expect("select should succeed");
    let names: Vec<_> = rows.iter().map(|r| field(r, "first_name").clone()).collect();
    assert_eq!(names, vec![json!("B"), json!("C")]);
}

#[tokio::test]
async fn concurrent_tenants_stay_isolated() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);

    let k1 = kernel.clone();
    let p1 = t1.clone();
    let first = tokio::spawn(async move {
        for i in 0..5 {
            insert_patient(&k1, &p1, &format!("one-{i}")).await;
        }
    });
    let k2 = kernel.clone();
    let p2 = t2.clone();
    let second = tokio::spawn(async move {
        for i in 0..3 {
            insert_patient(&k2, &p2, &format!("two-{i}")).await;
        }
    });
    first.await.expect("task one should finish");
    second.await.expect("task two should finish");

    let rows1 = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "patients"))
        .await
        .expect("select should succeed");
    let rows2 = kernel
        .scoped_query(&t2, &ScopedQuery::select(&t2, "patients"))
        .await
        .expect("select should succeed");
    assert_eq!(rows1.len(), 5);
    assert_eq!(rows2.len(), 3);
    assert!(rows2
        .iter()
        .all(|r| field(r, "first_name").as_str().is_some_and(|n| n.starts_with("two-"))));
}
