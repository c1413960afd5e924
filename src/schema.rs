//! Registered entity classes.
//!
//! The scoped executor only ever touches tables and columns listed here, so
//! identifiers in generated SQL never come from caller input.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{KernelError, KernelResult};
use crate::permission::{
    BILLING_READ, BILLING_WRITE, LAB_RESULTS_READ, LAB_RESULTS_WRITE, PATIENTS_READ,
    PATIENTS_WRITE, PRESCRIPTIONS_READ, PRESCRIPTIONS_WRITE, STAFF_READ, STAFF_WRITE, VISITS_READ,
    VISITS_WRITE,
};

/// Primary key column of every entity table.
pub const ID_COLUMN: &str = "id";
/// Tenant column of every entity table.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Real,
    /// UTF-8 text.
    Text,
    /// Stored as 0/1.
    Bool,
}

/// One column of an entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// Storage type.
    pub kind: ColumnType,
}

/// A foreign key from one entity to another entity's `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing column on the child entity.
    pub column: &'static str,
    /// Referenced entity.
    pub target: &'static str,
}

/// A tenant-scoped entity class backed by one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    /// Entity name, also the table name.
    pub name: &'static str,
    /// Data columns, excluding `id` and `tenant_id`.
    pub columns: Vec<ColumnDef>,
    /// Outgoing references validated before every write.
    pub foreign_keys: Vec<ForeignKey>,
    /// Permission required to read rows.
    pub read_permission: &'static str,
    /// Permission required to create, update or delete rows.
    pub write_permission: &'static str,
}

impl EntityDef {
    /// Look up a column by name. `id` and `tenant_id` are always present.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnknownColumn`] for unregistered names.
    pub fn column(&self, name: &str) -> KernelResult<ColumnType> {
        if name == ID_COLUMN || name == TENANT_COLUMN {
            return Ok(ColumnType::Integer);
        }
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.kind)
            .ok_or_else(|| KernelError::UnknownColumn {
                entity: self.name.to_owned(),
                column: name.to_owned(),
            })
    }

    /// All column names in table order, `id` and `tenant_id` first.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        [ID_COLUMN, TENANT_COLUMN]
            .into_iter()
            .chain(self.columns.iter().map(|c| c.name))
    }

    /// Foreign key declared on `column`, if any.
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

/// A child-to-parent relationship checked by the integrity monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    /// Referencing entity.
    pub child: &'static str,
    /// Referencing column.
    pub column: &'static str,
    /// Referenced entity.
    pub parent: &'static str,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.child, self.column, self.parent)
    }
}

/// Set of entity classes the kernel may touch.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<&'static str, EntityDef>,
}

impl EntityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity, replacing any previous definition of the same name.
    pub fn register(&mut self, entity: EntityDef) {
        self.entities.insert(entity.name, entity);
    }

    /// Look up an entity class.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnknownEntity`] for unregistered names.
    pub fn get(&self, name: &str) -> KernelResult<&EntityDef> {
        self.entities
            .get(name)
            .ok_or_else(|| KernelError::UnknownEntity(name.to_owned()))
    }

    /// Registered entities in name order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Every declared foreign key as a relationship.
    pub fn relationships(&self) -> Vec<Relationship> {
        self.entities
            .values()
            .flat_map(|entity| {
                entity.foreign_keys.iter().map(move |fk| Relationship {
                    child: entity.name,
                    column: fk.column,
                    parent: fk.target,
                })
            })
            .collect()
    }

    /// The clinic tables created by the kernel migration.
    pub fn clinic() -> Self {
        use ColumnType::{Bool, Integer, Text};

        fn col(name: &'static str, kind: ColumnType) -> ColumnDef {
            ColumnDef { name, kind }
        }
        fn fk(column: &'static str, target: &'static str) -> ForeignKey {
            ForeignKey { column, target }
        }

        let mut registry = Self::new();
        registry.register(EntityDef {
            name: "patients",
            columns: vec![
                col("first_name", Text),
                col("last_name", Text),
                col("date_of_birth", Text),
                col("phone", Text),
                col("email", Text),
                col("notes", Text),
            ],
            foreign_keys: vec![],
            read_permission: PATIENTS_READ,
            write_permission: PATIENTS_WRITE,
        });
        registry.register(EntityDef {
            name: "staff",
            columns: vec![
                col("user_id", Integer),
                col("full_name", Text),
                col("role", Text),
                col("active", Bool),
            ],
            foreign_keys: vec![],
            read_permission: STAFF_READ,
            write_permission: STAFF_WRITE,
        });
        registry.register(EntityDef {
            name: "visits",
            columns: vec![
                col("patient_id", Integer),
                col("doctor_id", Integer),
                col("scheduled_at", Text),
                col("status", Text),
                col("reason", Text),
            ],
            foreign_keys: vec![fk("patient_id", "patients"), fk("doctor_id", "staff")],
            read_permission: VISITS_READ,
            write_permission: VISITS_WRITE,
        });
        registry.register(EntityDef {
            name: "lab_results",
            columns: vec![
                col("patient_id", Integer),
                col("visit_id", Integer),
                col("test_name", Text),
                col("result", Text),
                col("recorded_at", Text),
            ],
            foreign_keys: vec![fk("patient_id", "patients"), fk("visit_id", "visits")],
            read_permission: LAB_RESULTS_READ,
            write_permission: LAB_RESULTS_WRITE,
        });
        registry.register(EntityDef {
            name: "invoices",
            columns: vec![
                col("patient_id", Integer),
                col("visit_id", Integer),
                col("amount_cents", Integer),
                col("paid", Bool),
                col("issued_at", Text),
            ],
            foreign_keys: vec![fk("patient_id", "patients"), fk("visit_id", "visits")],
            read_permission: BILLING_READ,
            write_permission: BILLING_WRITE,
        });
        registry.register(EntityDef {
            name: "prescriptions",
            columns: vec![
                col("patient_id", Integer),
                col("visit_id", Integer),
                col("prescriber_id", Integer),
                col("medication", Text),
                col("dosage", Text),
            ],
            foreign_keys: vec![
                fk("patient_id", "patients"),
                fk("visit_id", "visits"),
                fk("prescriber_id", "staff"),
            ],
            read_permission: PRESCRIPTIONS_READ,
            write_permission: PRESCRIPTIONS_WRITE,
        });
        registry
    }
}
