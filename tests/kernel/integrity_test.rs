//! Integrity monitor sweeps over rows written around the kernel.

use std::time::Duration;

use clinic_kernel::config::Config;
use clinic_kernel::integrity::{FindingKind, SweepPlan};
use clinic_kernel::query::ScopedQuery;
use clinic_kernel::schema::Relationship;
use clinic_kernel::KernelError;

use crate::support::{admin, insert_patient, kernel, kernel_with, tenant};

const VISIT_PATIENT: Relationship = Relationship {
    child: "visits",
    column: "patient_id",
    parent: "patients",
};

async fn raw(kernel: &clinic_kernel::Kernel, sql: &str) {
    sqlx::query(sql)
        .execute(kernel.pool())
        .await
        .expect("raw statement should run");
}

#[tokio::test]
async fn kernel_written_data_sweeps_clean() {
    let kernel = kernel().await;
    let actor = admin(1);
    let patient = insert_patient(&kernel, &actor, "Ana").await;
    kernel
        .mutate(
            &actor,
            &ScopedQuery::insert(&actor, "visits")
                .set("patient_id", patient)
                .set("scheduled_at", "2026-03-02T10:00:00Z"),
            &[],
        )
        .await
        .expect("visit");

    let report = kernel
        .run_integrity_sweep(tenant(1), &kernel.full_sweep_plan())
        .await
        .expect("sweep");
    assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
    assert_eq!(report.relationships_checked, 9);
    assert_eq!(report.entities_checked, 6);
}

#[tokio::test]
async fn orphaned_reference_is_reported() {
    let kernel = kernel().await;
    raw(
        &kernel,
        "INSERT INTO visits (id, tenant_id, patient_id, scheduled_at) VALUES (31, 1, 999, '2026-03-02')",
    )
    .await;

    let report = kernel
        .run_integrity_sweep(tenant(1), &SweepPlan::relationships(vec![VISIT_PATIENT]))
        .await
        .expect("sweep");
    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.kind, FindingKind::Orphaned);
    assert_eq!(finding.relationship, "visits.patient_id -> patients");
    assert_eq!(finding.offending_rows, 1);
    assert_eq!(finding.sample_ids, vec![31]);
}

#[tokio::test]
async fn cross_tenant_reference_is_reported() {
    let kernel = kernel().await;
    let foreign = insert_patient(&kernel, &admin(2), "Zed").await;
    raw(
        &kernel,
        &format!(
            "INSERT INTO visits (id, tenant_id, patient_id, scheduled_at) VALUES (40, 1, {foreign}, '2026-03-02')"
        ),
    )
    .await;

    let report = kernel
        .run_integrity_sweep(tenant(1), &SweepPlan::relationships(vec![VISIT_PATIENT]))
        .await
        .expect("sweep");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, FindingKind::CrossTenant);
    assert_eq!(report.findings[0].sample_ids, vec![40]);

    // The other tenant's own data is clean.
    let report = kernel
        .run_integrity_sweep(tenant(2), &SweepPlan::relationships(vec![VISIT_PATIENT]))
        .await
        .expect("sweep");
    assert!(report.is_clean());
}

#[tokio::test]
async fn rows_without_create_entry_are_unaudited() {
    let kernel = kernel().await;
    insert_patient(&kernel, &admin(1), "Ana").await;
    raw(
        &kernel,
        "INSERT INTO patients (id, tenant_id, first_name, last_name) VALUES (77, 1, 'Ghost', 'Row')",
    )
    .await;

    let plan = SweepPlan {
        relationships: Vec::new(),
        audited_entities: vec!["patients"],
    };
    let report = kernel.run_integrity_sweep(tenant(1), &plan).await.expect("sweep");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, FindingKind::Unaudited);
    assert_eq!(report.findings[0].relationship, "patients");
    assert_eq!(report.findings[0].sample_ids, vec![77]);
}

#[tokio::test]
async fn sample_ids_are_capped() {
    let mut config = Config::default();
    config.integrity.sample_size = 2;
    let kernel = kernel_with(config).await;
    for id in [11, 12, 13] {
        raw(
            &kernel,
            &format!(
                "INSERT INTO visits (id, tenant_id, patient_id, scheduled_at) VALUES ({id}, 1, 5000, '2026-03-02')"
            ),
        )
        .await;
    }

    let report = kernel
        .run_integrity_sweep(tenant(1), &SweepPlan::relationships(vec![VISIT_PATIENT]))
        .await
        .expect("sweep");
    assert_eq!(report.findings[0].offending_rows, 3);
    assert_eq!(report.findings[0].sample_ids, vec![11, 12]);
}

#[tokio::test]
async fn unregistered_relationship_is_an_error() {
    let kernel = kernel().await;
    let plan = SweepPlan::relationships(vec![Relationship {
        child: "sqlite_master",
        column: "name",
        parent: "patients",
    }]);
    let err = kernel
        .run_integrity_sweep(tenant(1), &plan)
        .await
        .expect_err("unknown child must fail");
    assert!(matches!(err, KernelError::UnknownEntity(_)));
}

#[tokio::test]
async fn periodic_sweeps_deliver_reports_until_receiver_drops() {
    let kernel = kernel().await;
    raw(
        &kernel,
        "INSERT INTO visits (id, tenant_id, patient_id, scheduled_at) VALUES (5, 3, 404, '2026-03-02')",
    )
    .await;

    let (handle, mut reports) = kernel.integrity().spawn_periodic(
        vec![tenant(3), tenant(4)],
        SweepPlan::relationships(vec![VISIT_PATIENT]),
        Duration::from_millis(20),
    );

    let first = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("first report in time")
        .expect("channel open");
    assert_eq!(first.tenant_id, tenant(3));
    assert!(!first.is_clean());

    let second = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("second report in time")
        .expect("channel open");
    assert_eq!(second.tenant_id, tenant(4));
    assert!(second.is_clean());

    drop(reports);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("task should stop after receiver drops")
        .expect("task should not panic");
}
