//! Cross-reference validation on the write path.

use serde_json::json;

use clinic_kernel::identity::Role;
use clinic_kernel::query::ScopedQuery;
use clinic_kernel::references::ResourceRef;
use clinic_kernel::KernelError;

use crate::support::{admin, count, field, insert_patient, insert_staff, kernel, principal};

#[tokio::test]
async fn visit_linking_other_tenant_patient_is_rejected() {
    let kernel = kernel().await;
    sqlx::query("INSERT INTO patients (id, tenant_id, first_name, last_name) VALUES (100, 7, 'Ada', 'Byron')")
        .execute(kernel.pool())
        .await
        .expect("seed patient");

    let staff = principal(5, 50, Role::Staff);
    let query = ScopedQuery::insert(&staff, "visits")
        .set("patient_id", 100)
        .set("scheduled_at", "2026-03-02T10:00:00Z");
    let err = kernel.mutate(&staff, &query, &[]).await.expect_err("cross-tenant link must fail");

    assert!(matches!(
        &err,
        KernelError::CrossTenantReference { entity, id } if entity == "patients" && *id == 100
    ));
    assert!(err.is_security_event());
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM visits").await, 0);
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM audit_log").await, 0);
}

#[tokio::test]
async fn missing_reference_is_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let query = ScopedQuery::insert(&t1, "visits")
        .set("patient_id", 12345)
        .set("scheduled_at", "2026-03-02T10:00:00Z");
    let err = kernel.mutate(&t1, &query, &[]).await.expect_err("missing patient must fail");
    assert!(matches!(
        err,
        KernelError::ReferenceNotFound { ref entity, id } if entity == "patients" && id == 12345
    ));
    assert!(!err.is_security_event());
}

#[tokio::test]
async fn same_tenant_references_are_accepted() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let patient = insert_patient(&kernel, &t1, "Ana").await;
    let doctor = insert_staff(&kernel, &t1, "Dr. Reyes").await;

    let query = ScopedQuery::insert(&t1, "visits")
        .set("patient_id", patient)
        .set("doctor_id", doctor)
        .set("scheduled_at", "2026-03-02T10:00:00Z");
    let outcome = kernel.mutate(&t1, &query, &[]).await.expect("valid visit");
    assert_eq!(field(&outcome.rows[0], "patient_id"), &json!(patient));
    assert_eq!(field(&outcome.rows[0], "status"), &json!("scheduled"));
    assert_eq!(outcome.audit_ids.len(), 1);
}

#[tokio::test]
async fn null_foreign_key_is_skipped() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let patient = insert_patient(&kernel, &t1, "Ana").await;
    let query = ScopedQuery::insert(&t1, "visits")
        .set("patient_id", patient)
        .set("doctor_id", serde_json::Value::Null)
        .set("scheduled_at", "2026-03-02T10:00:00Z");
    kernel.mutate(&t1, &query, &[]).await.expect("null doctor is allowed");
}

#[tokio::test]
async fn non_integer_foreign_key_is_invalid() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let query = ScopedQuery::insert(&t1, "visits")
        .set("patient_id", "100")
        .set("scheduled_at", "2026-03-02T10:00:00Z");
    let err = kernel.mutate(&t1, &query, &[]).await.expect_err("string id must fail");
    assert!(matches!(err, KernelError::InvalidValue { .. }));
}

#[tokio::test]
async fn update_re_pointing_to_other_tenant_is_rejected() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    let own = insert_patient(&kernel, &t1, "Ana").await;
    let foreign = insert_patient(&kernel, &t2, "Zed").await;
    let visit = kernel
        .mutate(
            &t1,
            &ScopedQuery::insert(&t1, "visits")
                .set("patient_id", own)
                .set("scheduled_at", "2026-03-02T10:00:00Z"),
            &[],
        )
        .await
        .expect("valid visit");
    let visit_id = clinic_kernel::query::row_id(&visit.rows[0]).expect("visit id");

    let err = kernel
        .mutate(
            &t1,
            &ScopedQuery::update(&t1, "visits")
                .filter("id", visit_id)
                .set("patient_id", foreign),
            &[],
        )
        .await
        .expect_err("re-pointing across tenants must fail");
    assert!(matches!(err, KernelError::CrossTenantReference { .. }));

    let rows = kernel
        .scoped_query(&t1, &ScopedQuery::select(&t1, "visits"))
        .await
        .expect("select should succeed");
    assert_eq!(field(&rows[0], "patient_id"), &json!(own));
}

#[tokio::test]
async fn extra_references_are_validated_all_or_nothing() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let t2 = admin(2);
    let own = insert_patient(&kernel, &t1, "Ana").await;
    let foreign = insert_patient(&kernel, &t2, "Zed").await;

    kernel
        .validate_references(&t1, &[ResourceRef::new("patients", own)])
        .await
        .expect("own reference is valid");

    let err = kernel
        .validate_references(
            &t1,
            &[
                ResourceRef::new("patients", own),
                ResourceRef::new("patients", foreign),
            ],
        )
        .await
        .expect_err("one foreign reference rejects the set");
    assert!(matches!(err, KernelError::CrossTenantReference { id, .. } if id == foreign));

    let err = kernel
        .validate_references(&t1, &[ResourceRef::new("spaceships", 1)])
        .await
        .expect_err("unknown entity must fail");
    assert!(matches!(err, KernelError::UnknownEntity(_)));

    // Extra references passed to a mutation are checked on the same transaction.
    let err = kernel
        .mutate(
            &t1,
            &ScopedQuery::update(&t1, "patients")
                .filter("id", own)
                .set("notes", "see other chart"),
            &[ResourceRef::new("patients", foreign)],
        )
        .await
        .expect_err("extra foreign reference must fail");
    assert!(matches!(err, KernelError::CrossTenantReference { .. }));
}

#[tokio::test]
async fn empty_reference_set_is_valid() {
    let kernel = kernel().await;
    kernel
        .validate_references(&admin(1), &[])
        .await
        .expect("nothing to check");
}

#[tokio::test]
async fn deleting_a_referenced_patient_is_refused() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let patient = insert_patient(&kernel, &t1, "Ana").await;
    kernel
        .mutate(
            &t1,
            &ScopedQuery::insert(&t1, "visits")
                .set("patient_id", patient)
                .set("scheduled_at", "2026-03-02T10:00:00Z"),
            &[],
        )
        .await
        .expect("visit");
    let audited = count(kernel.pool(), "SELECT COUNT(*) FROM audit_log").await;

    let err = kernel
        .mutate(&t1, &ScopedQuery::delete(&t1, "patients").filter("id", patient), &[])
        .await
        .expect_err("patient with visits must stay");
    assert!(matches!(
        &err,
        KernelError::ReferencedByOtherRows { entity, id, relationship }
            if entity == "patients" && *id == patient && relationship == "visits.patient_id -> patients"
    ));
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM patients").await, 1);
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM audit_log").await, audited);

    let sweep = kernel
        .run_integrity_sweep(crate::support::tenant(1), &kernel.full_sweep_plan())
        .await
        .expect("sweep");
    assert!(sweep.is_clean(), "unexpected findings: {:?}", sweep.findings);
}

#[tokio::test]
async fn delete_succeeds_once_referencing_rows_are_gone() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let patient = insert_patient(&kernel, &t1, "Ana").await;
    let visit = kernel
        .mutate(
            &t1,
            &ScopedQuery::insert(&t1, "visits")
                .set("patient_id", patient)
                .set("scheduled_at", "2026-03-02T10:00:00Z"),
            &[],
        )
        .await
        .expect("visit");
    let visit_id = clinic_kernel::query::row_id(&visit.rows[0]).expect("visit id");

    kernel
        .mutate(&t1, &ScopedQuery::delete(&t1, "visits").filter("id", visit_id), &[])
        .await
        .expect("visit delete");
    let outcome = kernel
        .mutate(&t1, &ScopedQuery::delete(&t1, "patients").filter("id", patient), &[])
        .await
        .expect("unreferenced patient delete");
    assert_eq!(outcome.rows.len(), 1);
}

#[tokio::test]
async fn references_from_other_tenants_do_not_block_delete() {
    let kernel = kernel().await;
    let t1 = admin(1);
    let patient = insert_patient(&kernel, &t1, "Ana").await;
    // A stray cross-tenant row is the integrity monitor's concern, not the delete's.
    sqlx::query(&format!(
        "INSERT INTO visits (id, tenant_id, patient_id, scheduled_at) VALUES (90, 2, {patient}, '2026-03-02')"
    ))
    .execute(kernel.pool())
    .await
    .expect("seed foreign visit");

    kernel
        .mutate(&t1, &ScopedQuery::delete(&t1, "patients").filter("id", patient), &[])
        .await
        .expect("delete within tenant 1");
    assert_eq!(count(kernel.pool(), "SELECT COUNT(*) FROM patients").await, 0);
}
