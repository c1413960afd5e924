//! Shared fixtures for kernel integration tests.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use clinic_kernel::audit::FixedClock;
use clinic_kernel::config::Config;
use clinic_kernel::db;
use clinic_kernel::identity::{Principal, Role, TenantId, UserId};
use clinic_kernel::query::{row_id, ScopedQuery};
use clinic_kernel::schema::EntityRegistry;
use clinic_kernel::Kernel;

pub fn tenant(raw: i64) -> TenantId {
    TenantId::new(raw).expect("valid tenant id")
}

pub fn principal(tenant_raw: i64, user: i64, role: Role) -> Principal {
    Principal::new(tenant(tenant_raw), UserId::new(user), [role])
}

pub fn admin(tenant_raw: i64) -> Principal {
    principal(tenant_raw, 1, Role::Admin)
}

pub async fn kernel() -> Kernel {
    kernel_with(Config::default()).await
}

/// Kernel over a fresh in-memory database with a frozen clock, so audit
/// ordering falls back to insertion order.
pub async fn kernel_with(config: Config) -> Kernel {
    let pool = db::open_in_memory().await.expect("in-memory db should open");
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().expect("valid date"));
    Kernel::with_parts(pool, &config, EntityRegistry::clinic(), Arc::new(clock))
}

pub async fn enable(kernel: &Kernel, tenant_raw: i64, feature: &str) {
    let operator = principal(tenant_raw, 999, Role::Operator);
    kernel
        .set_feature(&operator, tenant(tenant_raw), feature, true)
        .await
        .expect("operator should set feature");
}

pub async fn insert_patient(kernel: &Kernel, actor: &Principal, first_name: &str) -> i64 {
    let query = ScopedQuery::insert(actor, "patients")
        .set("first_name", first_name)
        .set("last_name", "Tester");
    let outcome = kernel
        .mutate(actor, &query, &[])
        .await
        .expect("patient insert should succeed");
    row_id(&outcome.rows[0]).expect("inserted row has an id")
}

pub async fn insert_staff(kernel: &Kernel, actor: &Principal, name: &str) -> i64 {
    let query = ScopedQuery::insert(actor, "staff")
        .set("full_name", name)
        .set("role", "doctor");
    let outcome = kernel
        .mutate(actor, &query, &[])
        .await
        .expect("staff insert should succeed");
    row_id(&outcome.rows[0]).expect("inserted row has an id")
}

/// Count rows with raw SQL, bypassing the kernel.
pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql)
        .fetch_one(pool)
        .await
        .expect("count query should run");
    n
}

pub fn field<'a>(row: &'a serde_json::Map<String, Value>, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}
