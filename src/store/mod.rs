/// Relational store
///
/// - `database`: pool, catalog schema and the `BEGIN IMMEDIATE` write lock
/// - `naming`: deterministic run/job table and directory names
/// - `job_tables`: per-job task tables, archival and streaming
/// - `rows`: text-typed row access for dynamically shaped run tables

pub mod database;
pub mod job_tables;
pub mod naming;
pub mod rows;

pub use database::{Database, LockedTx};
pub use naming::{quote_ident, JobNamespace, JobTables, RunNamespace};
