//! Scoped query executor.
//!
//! A [`ScopedQuery`] can only be created from a [`Principal`], and the
//! principal's tenant becomes a mandatory conjunct of every generated
//! `WHERE` clause (select/update/delete) or the tenant column value (insert).
//! Table and column identifiers come from the [`EntityRegistry`]; values are
//! always bound parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row as _, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::identity::{Principal, TenantId};
use crate::schema::{ColumnType, EntityDef, EntityRegistry, ID_COLUMN, TENANT_COLUMN};

/// A decoded row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Column name to value, used for both filters and assignments.
pub type Fields = BTreeMap<String, Value>;

/// Data access operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read rows.
    Select,
    /// Create one row.
    Insert,
    /// Modify matching rows.
    Update,
    /// Remove matching rows.
    Delete,
}

impl Operation {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Whether the operation changes state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Select)
    }
}

/// A tenant-scoped data access request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedQuery {
    tenant_id: TenantId,
    operation: Operation,
    entity: String,
    filters: Fields,
    values: Fields,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl ScopedQuery {
    /// Start a query of `operation` on `entity`, scoped to the principal's tenant.
    pub fn new(principal: &Principal, operation: Operation, entity: impl Into<String>) -> Self {
        Self {
            tenant_id: principal.tenant_id(),
            operation,
            entity: entity.into(),
            filters: Fields::new(),
            values: Fields::new(),
            limit: None,
            offset: None,
        }
    }

    /// Select rows of `entity`.
    pub fn select(principal: &Principal, entity: impl Into<String>) -> Self {
        Self::new(principal, Operation::Select, entity)
    }

    /// Insert one row into `entity`.
    pub fn insert(principal: &Principal, entity: impl Into<String>) -> Self {
        Self::new(principal, Operation::Insert, entity)
    }

    /// Update rows of `entity`.
    pub fn update(principal: &Principal, entity: impl Into<String>) -> Self {
        Self::new(principal, Operation::Update, entity)
    }

    /// Delete rows of `entity`.
    pub fn delete(principal: &Principal, entity: impl Into<String>) -> Self {
        Self::new(principal, Operation::Delete, entity)
    }

    /// Add an equality filter. A `null` value matches `IS NULL`.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(column.into(), value.into());
        self
    }

    /// Add several equality filters.
    pub fn filters(mut self, fields: Fields) -> Self {
        self.filters.extend(fields);
        self
    }

    /// Assign a column value (insert/update).
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Assign several column values.
    pub fn values(mut self, fields: Fields) -> Self {
        self.values.extend(fields);
        self
    }

    /// Cap the number of selected rows.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip selected rows.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Tenant the query is scoped to.
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Operation kind.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Target entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Caller-supplied filters.
    pub fn filter_fields(&self) -> &Fields {
        &self.filters
    }

    /// Caller-supplied assignments.
    pub fn value_fields(&self) -> &Fields {
        &self.values
    }

    /// The same filters as a select, used to capture rows before a mutation.
    pub fn as_select(&self) -> Self {
        Self {
            tenant_id: self.tenant_id,
            operation: Operation::Select,
            entity: self.entity.clone(),
            filters: self.filters.clone(),
            values: Fields::new(),
            limit: None,
            offset: None,
        }
    }
}

/// Bindable SQL value after type checking against the column.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

/// A query validated against the registry, ready to run.
#[derive(Debug)]
struct Prepared<'r> {
    entity: &'r EntityDef,
    tenant_id: TenantId,
    filters: Vec<(&'static str, SqlValue)>,
    values: Vec<(&'static str, SqlValue)>,
}

/// Executes [`ScopedQuery`] values against the shared pool.
#[derive(Debug, Clone)]
pub struct ScopedExecutor {
    registry: Arc<EntityRegistry>,
}

impl ScopedExecutor {
    /// Build an executor over the given entity registry.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// The entity registry.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Run a query on a pooled connection.
    ///
    /// # Errors
    ///
    /// See [`ScopedExecutor::execute`].
    pub async fn run(&self, pool: &SqlitePool, query: &ScopedQuery) -> KernelResult<Vec<Row>> {
        let mut conn = pool.acquire().await?;
        self.execute(&mut conn, query).await
    }

    /// Run a query on an existing connection or transaction.
    ///
    /// Returns the selected rows, the inserted row, the rows as they are
    /// after an update, or the rows as they were before a delete.
    ///
    /// # Errors
    ///
    /// [`KernelError::TenantMismatch`] if a filter or value names another
    /// tenant, [`KernelError::UnboundedMutation`] for update/delete without
    /// filters, schema errors for unknown names, and storage errors unchanged.
    pub async fn execute(
        &self,
        conn: &mut SqliteConnection,
        query: &ScopedQuery,
    ) -> KernelResult<Vec<Row>> {
        let prepared = self.prepare(query)?;
        debug!(
            tenant_id = %query.tenant_id,
            entity = prepared.entity.name,
            operation = query.operation.as_str(),
            "executing scoped query"
        );
        match query.operation {
            Operation::Select => select(conn, &prepared, query.limit, query.offset).await,
            Operation::Insert => insert(conn, &prepared).await,
            Operation::Update => update(conn, &prepared).await,
            Operation::Delete => delete(conn, &prepared).await,
        }
    }

    /// Validate a query's shape without running it.
    ///
    /// # Errors
    ///
    /// The same shape errors [`ScopedExecutor::execute`] would report.
    pub fn check(&self, query: &ScopedQuery) -> KernelResult<()> {
        self.prepare(query).map(|_| ())
    }

    fn prepare(&self, query: &ScopedQuery) -> KernelResult<Prepared<'_>> {
        let entity = self.registry.get(&query.entity)?;
        let tenant_id = query.tenant_id;

        let mut filters = Vec::with_capacity(query.filters.len());
        for (column, value) in &query.filters {
            let (name, kind) = resolve_column(entity, column)?;
            if name == TENANT_COLUMN {
                check_tenant(tenant_id, value)?;
                continue;
            }
            filters.push((name, to_sql(column, kind, value)?));
        }

        let mut values = Vec::with_capacity(query.values.len());
        if !query.values.is_empty() && !matches!(query.operation, Operation::Insert | Operation::Update) {
            return Err(KernelError::InvalidValue {
                column: query.values.keys().next().cloned().unwrap_or_default(),
                reason: format!("assignments are not valid for {}", query.operation.as_str()),
            });
        }
        for (column, value) in &query.values {
            let (name, kind) = resolve_column(entity, column)?;
            if name == TENANT_COLUMN {
                check_tenant(tenant_id, value)?;
                continue;
            }
            if name == ID_COLUMN {
                return Err(KernelError::InvalidValue {
                    column: column.clone(),
                    reason: "row ids are assigned by the store".to_owned(),
                });
            }
            values.push((name, to_sql(column, kind, value)?));
        }

        match query.operation {
            Operation::Update | Operation::Delete if filters.is_empty() => {
                warn!(
                    tenant_id = %tenant_id,
                    entity = entity.name,
                    operation = query.operation.as_str(),
                    "rejected unbounded mutation"
                );
                return Err(KernelError::UnboundedMutation {
                    operation: query.operation.as_str(),
                    entity: entity.name.to_owned(),
                });
            }
            Operation::Update if values.is_empty() => {
                return Err(KernelError::InvalidValue {
                    column: "*".to_owned(),
                    reason: "update without assignments".to_owned(),
                });
            }
            _ => {}
        }

        Ok(Prepared {
            entity,
            tenant_id,
            filters,
            values,
        })
    }
}

/// Map a caller column name to the registry's static name and type.
fn resolve_column(entity: &EntityDef, column: &str) -> KernelResult<(&'static str, ColumnType)> {
    let kind = entity.column(column)?;
    let name = entity
        .column_names()
        .find(|name| *name == column)
        .ok_or_else(|| KernelError::UnknownColumn {
            entity: entity.name.to_owned(),
            column: column.to_owned(),
        })?;
    Ok((name, kind))
}

/// A caller may restate its own tenant; naming any other value is rejected.
fn check_tenant(expected: TenantId, supplied: &Value) -> KernelResult<()> {
    if supplied.as_i64() == Some(expected.get()) {
        return Ok(());
    }
    warn!(
        tenant_id = %expected,
        supplied = %supplied,
        security_event = true,
        "caller attempted to override tenant scope"
    );
    Err(KernelError::TenantMismatch {
        expected,
        supplied: supplied.to_string(),
    })
}

fn to_sql(column: &str, kind: ColumnType, value: &Value) -> KernelResult<SqlValue> {
    let invalid = |reason: &str| KernelError::InvalidValue {
        column: column.to_owned(),
        reason: reason.to_owned(),
    };
    match (kind, value) {
        (_, Value::Null) => Ok(SqlValue::Null),
        (ColumnType::Integer, Value::Number(n)) => n
            .as_i64()
            .map(SqlValue::Int)
            .ok_or_else(|| invalid("expected an integer")),
        (ColumnType::Real, Value::Number(n)) => n
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| invalid("expected a number")),
        (ColumnType::Text, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (ColumnType::Bool, Value::Bool(b)) => Ok(SqlValue::Int(i64::from(*b))),
        (ColumnType::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(SqlValue::Int(0)),
            Some(1) => Ok(SqlValue::Int(1)),
            _ => Err(invalid("expected a boolean")),
        },
        (ColumnType::Integer, _) => Err(invalid("expected an integer")),
        (ColumnType::Real, _) => Err(invalid("expected a number")),
        (ColumnType::Text, _) => Err(invalid("expected a string")),
        (ColumnType::Bool, _) => Err(invalid("expected a boolean")),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            qb.push_bind(Option::<i64>::None);
        }
        SqlValue::Int(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Real(v) => {
            qb.push_bind(*v);
        }
        SqlValue::Text(v) => {
            qb.push_bind(v.clone());
        }
    }
}

/// Append `WHERE tenant_id = ? AND col = ? ...`.
fn push_scope(
    qb: &mut QueryBuilder<'_, Sqlite>,
    tenant_id: TenantId,
    filters: &[(&'static str, SqlValue)],
) {
    qb.push(" WHERE ");
    qb.push(TENANT_COLUMN);
    qb.push(" = ");
    qb.push_bind(tenant_id.get());
    for (column, value) in filters {
        qb.push(" AND ");
        qb.push(*column);
        if *value == SqlValue::Null {
            qb.push(" IS NULL");
        } else {
            qb.push(" = ");
            push_value(qb, value);
        }
    }
}

fn select_list(entity: &EntityDef) -> String {
    entity.column_names().collect::<Vec<_>>().join(", ")
}

async fn select(
    conn: &mut SqliteConnection,
    prepared: &Prepared<'_>,
    limit: Option<u32>,
    offset: Option<u32>,
) -> KernelResult<Vec<Row>> {
    let entity = prepared.entity;
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
    qb.push(select_list(entity));
    qb.push(" FROM ");
    qb.push(entity.name);
    push_scope(&mut qb, prepared.tenant_id, &prepared.filters);
    qb.push(" ORDER BY ");
    qb.push(ID_COLUMN);
    if limit.is_some() || offset.is_some() {
        // SQLite requires LIMIT before OFFSET; -1 means unbounded.
        qb.push(" LIMIT ");
        qb.push_bind(limit.map_or(-1, i64::from));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(offset.unwrap_or(0)));
    }
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(|row| decode_row(entity, row)).collect()
}

async fn select_by_id(
    conn: &mut SqliteConnection,
    entity: &EntityDef,
    tenant_id: TenantId,
    id: i64,
) -> KernelResult<Option<Row>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
    qb.push(select_list(entity));
    qb.push(" FROM ");
    qb.push(entity.name);
    push_scope(&mut qb, tenant_id, &[(ID_COLUMN, SqlValue::Int(id))]);
    let row = qb.build().fetch_optional(&mut *conn).await?;
    row.map(|r| decode_row(entity, &r)).transpose()
}

async fn insert(conn: &mut SqliteConnection, prepared: &Prepared<'_>) -> KernelResult<Vec<Row>> {
    let entity = prepared.entity;
    let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
    qb.push(entity.name);
    qb.push(" (");
    qb.push(TENANT_COLUMN);
    for (column, _) in &prepared.values {
        qb.push(", ");
        qb.push(*column);
    }
    qb.push(") VALUES (");
    qb.push_bind(prepared.tenant_id.get());
    for (_, value) in &prepared.values {
        qb.push(", ");
        push_value(&mut qb, value);
    }
    qb.push(")");
    let result = qb.build().execute(&mut *conn).await?;
    let id = result.last_insert_rowid();
    Ok(select_by_id(conn, entity, prepared.tenant_id, id)
        .await?
        .into_iter()
        .collect())
}

async fn matching_ids(conn: &mut SqliteConnection, prepared: &Prepared<'_>) -> KernelResult<Vec<i64>> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
    qb.push(ID_COLUMN);
    qb.push(" FROM ");
    qb.push(prepared.entity.name);
    push_scope(&mut qb, prepared.tenant_id, &prepared.filters);
    qb.push(" ORDER BY ");
    qb.push(ID_COLUMN);
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| row.try_get::<i64, _>(0).map_err(KernelError::from))
        .collect()
}

async fn update(conn: &mut SqliteConnection, prepared: &Prepared<'_>) -> KernelResult<Vec<Row>> {
    let entity = prepared.entity;
    let ids = matching_ids(conn, prepared).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
    qb.push(entity.name);
    qb.push(" SET ");
    for (i, (column, value)) in prepared.values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(*column);
        qb.push(" = ");
        push_value(&mut qb, value);
    }
    push_scope(&mut qb, prepared.tenant_id, &prepared.filters);
    qb.build().execute(&mut *conn).await?;

    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = select_by_id(conn, entity, prepared.tenant_id, id).await? {
            rows.push(row);
        }
    }
    Ok(rows)
}

async fn delete(conn: &mut SqliteConnection, prepared: &Prepared<'_>) -> KernelResult<Vec<Row>> {
    let entity = prepared.entity;
    let before = select(conn, prepared, None, None).await?;
    if before.is_empty() {
        return Ok(before);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
    qb.push(entity.name);
    push_scope(&mut qb, prepared.tenant_id, &prepared.filters);
    qb.build().execute(&mut *conn).await?;
    Ok(before)
}

fn decode_row(entity: &EntityDef, row: &SqliteRow) -> KernelResult<Row> {
    let mut out = Row::new();
    for name in entity.column_names() {
        let kind = entity.column(name)?;
        let value = match kind {
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(name)?
                .map_or(Value::Null, Value::from),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(name)?
                .map_or(Value::Null, Value::from),
            ColumnType::Text => row
                .try_get::<Option<String>, _>(name)?
                .map_or(Value::Null, Value::from),
            ColumnType::Bool => row
                .try_get::<Option<i64>, _>(name)?
                .map_or(Value::Null, |v| Value::Bool(v != 0)),
        };
        out.insert(name.to_owned(), value);
    }
    Ok(out)
}

/// Row id of a decoded row.
pub fn row_id(row: &Row) -> Option<i64> {
    row.get(ID_COLUMN).and_then(Value::as_i64)
}
