//! Clinic kernel: tenant isolation, permissions, cross-reference validation
//! and audit for a multi-tenant clinic backend.
//!
//! Every data access flows through [`Kernel`]. Queries are built from a
//! [`identity::Principal`] and always carry its tenant filter; mutations run
//! permission gate -> reference validator -> scoped executor -> audit
//! recorder in one SQLite transaction. Any failure denies.
//!
//! See `DESIGN.md` for the module map and the decisions behind it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod db;
pub mod error;
pub mod logging;

pub mod identity;
pub mod permission;
pub mod schema;

pub mod audit;
pub mod features;
pub mod grants;
pub mod query;
pub mod references;

pub mod integrity;
pub mod kernel;

pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, MutationOutcome};
