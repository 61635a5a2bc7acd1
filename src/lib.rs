/// Cymphony: human-computation workflow engine
///
/// A workflow is a small DSL program over tables. Compiling it yields a DAG of
/// operators; automatic operators run inline, human operators become jobs
/// whose rows are farmed out to workers and settled by k-of-n consensus.

// Core configuration and errors
pub mod config;
pub mod error;

// CSV in and out of run tables
pub mod tabular;

// DSL compiler: preprocess, parse, validate, build and order the DAG
pub mod compiler;

// SQLite store: catalog, write lock, run- and job-scoped tables
pub mod store;

// Workflows, runs, jobs and their state machines
pub mod workflow;

// Task assignment and vote aggregation
pub mod protocol;

// External crowd provider adapter and polling
pub mod provider;

// Run-completion webhook
pub mod notify;

// DAG engine, run lifecycle, pipelining and the abandonment monitor
pub mod runtime;

// The facade every caller goes through
pub mod service;

// HTTP API layer and server setup
pub mod api;
pub mod server;

pub use config::Config;
pub use error::{CymphonyError, Result};
pub use protocol::{AssignOutcome, TaskSnapshot};
pub use service::{Cymphony, DriveByVote, Submission};
pub use server::start_server;
pub use workflow::{Job, NewWorkflow, Run, RunOptions, WorkerContext, Workflow, WorkflowArtifacts};
