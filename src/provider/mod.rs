/// Crowd-work provider integration
///
/// `label_amt` jobs are not served by the in-house assignment protocol. Their
/// tasks are grouped into batches, published as HITs through a
/// `ProviderAdapter`, and the provider's results are polled back and replayed
/// into the job's `amt_` tables.

pub mod http;
pub mod poller;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use http::HttpProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("no provider configured")]
    NotConfigured,
}

/// Presentation and payment settings shared by every HIT of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitSpec {
    pub job_id: i64,
    pub title: String,
    /// Instruction HTML.
    pub instructions: String,
    /// Optional layout HTML.
    pub layout: Option<String>,
    pub labels: Vec<String>,
    /// Distinct workers requested per HIT (the job's `n`).
    pub assignments_per_hit: u32,
    pub reward: Option<String>,
    pub timeout_secs: i64,
}

/// Tasks published together as one HIT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitBatch {
    pub task_ids: Vec<i64>,
    /// Input rows keyed by column name, parallel to `task_ids`.
    pub rows: Vec<Map<String, Value>>,
}

/// Provider-side identity of a published batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub hit_id: String,
    pub task_ids: Vec<i64>,
}

/// One worker answer collected by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderVote {
    pub task_id: i64,
    pub worker_id: String,
    pub annotation: String,
    /// Epoch milliseconds
    pub submitted_at: i64,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Publish batches; one handle per batch, in order.
    async fn publish(&self, batches: &[HitBatch], spec: &HitSpec) -> Result<Vec<ProviderHandle>, ProviderError>;

    /// Every vote collected so far for the given HITs. May repeat votes
    /// returned by earlier polls.
    async fn poll(&self, handles: &[ProviderHandle]) -> Result<Vec<ProviderVote>, ProviderError>;
}
