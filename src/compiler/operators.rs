/// Operator vocabulary of the workflow DSL and the typed parameters each
/// operator carries after validation.

use crate::workflow::state::JobKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel label committed when a task exhausts its vote budget without consensus.
pub const UNDECIDED: &str = "undecided";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Load an uploaded CSV into a table. Every program starts with one.
    ReadTable,
    /// Export a table to a CSV file in the run directory.
    WriteTable,
    /// Uniform random sample without replacement.
    SampleRandom,
    /// Black-box SQL over the tables bound to its input variables.
    ExecSql,
    /// Human labeling served by the in-house assignment protocol.
    Label,
    /// Human labeling published to the external crowd-work provider.
    LabelAmt,
}

impl Operator {
    pub const ALL: [Operator; 6] = [
        Operator::ReadTable,
        Operator::WriteTable,
        Operator::SampleRandom,
        Operator::ExecSql,
        Operator::Label,
        Operator::LabelAmt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operator::ReadTable => "read_table",
            Operator::WriteTable => "write_table",
            Operator::SampleRandom => "sample_random",
            Operator::ExecSql => "exec_sql",
            Operator::Label => "label",
            Operator::LabelAmt => "label_amt",
        }
    }

    pub fn from_name(name: &str) -> Option<Operator> {
        Operator::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn kind(self) -> JobKind {
        match self {
            Operator::Label | Operator::LabelAmt => JobKind::Human,
            _ => JobKind::Automatic,
        }
    }

    pub fn is_human(self) -> bool {
        self.kind() == JobKind::Human
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated, typed parameters of one operator statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum OperatorParams {
    ReadTable { file: String },
    WriteTable { file: String },
    SampleRandom { size: u64 },
    ExecSql { query: String },
    Label(LabelParams),
}

impl OperatorParams {
    pub fn label(&self) -> Option<&LabelParams> {
        match self {
            OperatorParams::Label(params) => Some(params),
            _ => None,
        }
    }
}

/// Consensus and presentation settings of a human labeling operator.
///
/// Regular workers reach consensus at `k` agreeing votes out of a budget of `n`;
/// stewards use their own `l`-of-`m`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelParams {
    pub labels: Vec<String>,
    pub k: u32,
    pub n: u32,
    pub l: u32,
    pub m: u32,
    /// Assignment timeout; `None` falls back to the configured default.
    pub timeout_secs: Option<i64>,
    pub instructions: String,
    pub layout: Option<String>,
    /// Published through the provider adapter instead of the assignment protocol.
    pub provider: bool,
    /// Tasks per provider HIT.
    pub batch_size: u32,
    pub reward: Option<String>,
}

impl LabelParams {
    pub fn accepts(&self, answer: &str) -> bool {
        self.labels.iter().any(|l| l == answer)
    }
}
