/// Workflow DSL compiler
///
/// Source text goes through comment stripping, literal masking, statement
/// parsing and validation, then becomes a `Graph` of operator and data nodes
/// with a topological operator schedule:
/// - `preprocess`: comments and literal placeholders
/// - `parser`: statements and arguments
/// - `validate`: program and operator checks
/// - `graph`: the node arena
/// - `schedule`: Kahn's algorithm

pub mod graph;
pub mod operators;
pub mod parser;
pub mod preprocess;
pub mod schedule;
pub mod validate;

pub use graph::{Graph, Node, NodeId, NodeKind, OperatorNode};
pub use operators::{LabelParams, Operator, OperatorParams, UNDECIDED};

use std::collections::BTreeMap;
use thiserror::Error;

/// Uploaded workflow files by name.
pub type Uploads = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("program is empty")]
    EmptyProgram,

    #[error("lexical error: {0}")]
    Lexical(String),

    #[error("syntax error in statement {statement}: {message}")]
    Syntax { statement: usize, message: String },

    #[error("program must start with read_table, found '{found}'")]
    MissingLoad { found: String },

    #[error("unknown operator '{name}' in statement {statement}")]
    UnknownOperator { statement: usize, name: String },

    #[error("variable '{name}' used before definition in statement {statement}")]
    Undefined { statement: usize, name: String },

    #[error("invalid variable name '{name}' in statement {statement}")]
    InvalidName { statement: usize, name: String },

    #[error("variable '{name}' in statement {statement} collides with job table names")]
    ReservedName { statement: usize, name: String },

    #[error("statement {statement} ({operator}): {message}")]
    Operator {
        statement: usize,
        operator: String,
        message: String,
    },

    #[error("statement {statement} references '{file}', which was not uploaded")]
    MissingUpload { statement: usize, file: String },

    #[error("data file '{file}': {message}")]
    InvalidData { file: String, message: String },

    #[error("workflow graph has a cycle through {nodes:?}")]
    Cycle { nodes: Vec<String> },
}

/// Ceilings and defaults applied during validation.
#[derive(Debug, Clone)]
pub struct CompileLimits {
    pub max_headers: usize,
    pub max_rows: usize,
    pub default_timeout_secs: i64,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            max_headers: 64,
            max_rows: 100_000,
            default_timeout_secs: 600,
        }
    }
}

/// A compiled program: the graph plus operator node ids in execution order.
#[derive(Debug, Clone)]
pub struct Program {
    pub graph: Graph,
    pub schedule: Vec<NodeId>,
}

impl Program {
    pub fn operator_at(&self, position: usize) -> Option<(NodeId, &OperatorNode)> {
        let id = *self.schedule.get(position)?;
        self.graph.node(id)?.as_operator().map(|op| (id, op))
    }

    pub fn position_of(&self, node_id: NodeId) -> Option<usize> {
        self.schedule.iter().position(|&id| id == node_id)
    }
}

/// Compile DSL source against the workflow's uploads.
pub fn compile(source: &str, uploads: &Uploads, limits: &CompileLimits) -> Result<Program, CompileError> {
    let stripped = preprocess::strip_comments(source)?;
    let masked = preprocess::mask_literals(&stripped)?;
    let statements = parser::parse_program(&masked)?;
    let operators = validate::validate_program(&statements, uploads, limits)?;

    let mut graph = Graph::new();
    for op in operators {
        let inputs = op.inputs.clone();
        let outputs = op.outputs.clone();
        let op_id = graph.add_operator(op);
        for var in &inputs {
            let data = graph.data_node(var);
            graph.add_edge(data, op_id);
        }
        for var in &outputs {
            let data = graph.data_node(var);
            graph.add_edge(op_id, data);
        }
    }

    let schedule = schedule::operator_schedule(&graph)?;
    tracing::debug!(
        nodes = graph.node_count(),
        operators = schedule.len(),
        "compiled workflow program"
    );
    Ok(Program { graph, schedule })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploads() -> Uploads {
        let mut u = Uploads::new();
        u.insert("data.csv".into(), "_id,text\n1,a\n2,b\n3,c\n".into());
        u.insert("inst.html".into(), "<p>Is it spam?</p>".into());
        u.insert("layout.html".into(), "<div></div>".into());
        u
    }

    fn compile_ok(src: &str) -> Program {
        compile(src, &uploads(), &CompileLimits::default()).unwrap()
    }

    fn compile_err(src: &str) -> CompileError {
        compile(src, &uploads(), &CompileLimits::default()).unwrap_err()
    }

    #[test]
    fn compiles_a_labeling_pipeline() {
        let p = compile_ok(
            "/* spam filter */
             A = read_table('data.csv');
             B = sample_random(A, size=2);
             L, V = label(B, 'inst.html', labels=[Yes, No], k=2, n=3, layout='layout.html');
             C = exec_sql(\"SELECT * FROM L WHERE label = 'Yes'\", L);
             write_table(C, 'spam.csv');",
        );
        let names: Vec<&str> = p
            .schedule
            .iter()
            .map(|&id| p.graph.node(id).unwrap().name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["read_table_1", "sample_random_2", "label_3", "exec_sql_4", "write_table_5"]
        );
        let (_, label) = p.operator_at(2).unwrap();
        let params = label.params.label().unwrap();
        assert_eq!((params.k, params.n, params.l, params.m), (2, 3, 1, 1));
        assert_eq!(params.timeout_secs, Some(600));
        assert_eq!(params.layout.as_deref(), Some("layout.html"));
        assert_eq!(label.outputs, vec!["L", "V"]);
    }

    #[test]
    fn program_level_errors() {
        assert_eq!(compile_err("  /* nothing */ "), CompileError::EmptyProgram);
        assert!(matches!(
            compile_err("B = sample_random(A, size=1);"),
            CompileError::MissingLoad { .. }
        ));
        assert!(matches!(
            compile_err("A = read_table('data.csv'); B = frobnicate(A);"),
            CompileError::UnknownOperator { statement: 2, .. }
        ));
        assert!(matches!(
            compile_err("A = read_table('data.csv'); B = sample_random(Z, size=1);"),
            CompileError::Undefined { statement: 2, .. }
        ));
        assert!(matches!(
            compile_err("A = read_table('missing.csv');"),
            CompileError::MissingUpload { .. }
        ));
        assert!(matches!(
            compile_err("A = read_table('data.csv'); J2_tasks = sample_random(A, size=1);"),
            CompileError::ReservedName { statement: 2, .. }
        ));
    }

    #[test]
    fn label_parameter_errors() {
        let base = "A = read_table('data.csv');";
        for bad in [
            "L = label(A, 'inst.html', labels=[Yes], k=1, n=1);",
            "L = label(A, 'inst.html', labels=[Yes, Yes], k=1, n=1);",
            "L = label(A, 'inst.html', labels=[Yes, undecided], k=1, n=1);",
            "L = label(A, 'inst.html', labels=[Yes, No], k=3, n=2);",
            "L = label(A, 'inst.html', labels=[Yes, No], k=0, n=2);",
            "L = label(A, 'inst.html', labels=[Yes, No], k=1, n=2, l=2, m=1);",
            "L = label(A, 'inst.html', labels=[Yes, No], k=1, n=2, colour=red);",
            "L = label(A, 'inst.txt', labels=[Yes, No], k=1, n=2);",
            "L = label(A, 'inst.html', labels=[Yes, No], k=1, n=2, batch=5);",
            "L, V, W = label(A, 'inst.html', labels=[Yes, No], k=1, n=2);",
        ] {
            let err = compile(&format!("{} {}", base, bad), &uploads(), &CompileLimits::default());
            assert!(err.is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn amt_label_takes_batch_and_reward() {
        let p = compile_ok(
            "A = read_table('data.csv'); L = label_amt(A, 'inst.html', labels=[Yes, No], k=1, n=1, batch=10, reward='0.05');",
        );
        let (_, op) = p.operator_at(1).unwrap();
        let params = op.params.label().unwrap();
        assert!(params.provider);
        assert_eq!(params.batch_size, 10);
        assert_eq!(params.reward.as_deref(), Some("0.05"));
    }

    #[test]
    fn self_rebinding_is_a_cycle() {
        assert!(matches!(
            compile_err("A = read_table('data.csv'); A = sample_random(A, size=1);"),
            CompileError::Cycle { .. }
        ));
    }
}
