/// Program- and operator-level validation
///
/// Turns parsed statements into typed operator nodes. Program checks (load
/// first, definition before use, allow-list) run before operator checks
/// (arity, naming, file extensions, uploads, data ceilings, label parameters).

use super::graph::OperatorNode;
use super::operators::{LabelParams, Operator, OperatorParams, UNDECIDED};
use super::parser::{Argument, Statement, Value};
use super::{CompileError, CompileLimits, Uploads};
use crate::tabular::parse_csv;
use std::collections::{BTreeMap, HashSet};

pub fn validate_program(
    statements: &[Statement],
    uploads: &Uploads,
    limits: &CompileLimits,
) -> Result<Vec<OperatorNode>, CompileError> {
    let first = statements.first().ok_or(CompileError::EmptyProgram)?;
    if first.operator != Operator::ReadTable.name() {
        return Err(CompileError::MissingLoad {
            found: first.operator.clone(),
        });
    }

    let mut bound: HashSet<String> = HashSet::new();
    let mut nodes = Vec::with_capacity(statements.len());

    for stmt in statements {
        let operator = Operator::from_name(&stmt.operator).ok_or_else(|| CompileError::UnknownOperator {
            statement: stmt.index,
            name: stmt.operator.clone(),
        })?;

        for arg in &stmt.args {
            if let Argument::Variable(name) = arg {
                if !bound.contains(name) {
                    return Err(CompileError::Undefined {
                        statement: stmt.index,
                        name: name.clone(),
                    });
                }
            }
        }

        let node = validate_statement(stmt, operator, uploads, limits)?;
        bound.extend(node.outputs.iter().cloned());
        nodes.push(node);
    }

    Ok(nodes)
}

fn validate_statement(
    stmt: &Statement,
    operator: Operator,
    uploads: &Uploads,
    limits: &CompileLimits,
) -> Result<OperatorNode, CompileError> {
    let ctx = Ctx { stmt, operator };

    for name in &stmt.outputs {
        if !is_variable_name(name) {
            return Err(CompileError::InvalidName {
                statement: stmt.index,
                name: name.clone(),
            });
        }
        if is_job_scoped_name(name) {
            return Err(CompileError::ReservedName {
                statement: stmt.index,
                name: name.clone(),
            });
        }
    }

    let mut inputs = Vec::new();
    let mut strings = Vec::new();
    let mut params: BTreeMap<String, Value> = BTreeMap::new();
    for arg in &stmt.args {
        match arg {
            Argument::Variable(v) => inputs.push(v.clone()),
            Argument::Str(s) => strings.push(s.clone()),
            Argument::List(_) => return Err(ctx.fail("list literals are only allowed as parameter values")),
            Argument::Param { key, value } => {
                if params.insert(key.clone(), value.clone()).is_some() {
                    return Err(ctx.fail(&format!("duplicate parameter '{}'", key)));
                }
            }
        }
    }

    let params = match operator {
        Operator::ReadTable => {
            ctx.arity(&inputs, 0, 0)?;
            ctx.outputs(1, 1)?;
            ctx.no_params(&params)?;
            let file = ctx.single_string(&strings, "file name")?;
            ctx.extension(&file, ".csv")?;
            let text = ctx.upload(uploads, &file)?;
            check_data_file(&file, text, limits)?;
            OperatorParams::ReadTable { file }
        }
        Operator::WriteTable => {
            ctx.arity(&inputs, 1, 1)?;
            ctx.outputs(0, 0)?;
            ctx.no_params(&params)?;
            let file = ctx.single_string(&strings, "file name")?;
            ctx.extension(&file, ".csv")?;
            if file.contains(['/', '\\']) || file.starts_with('.') {
                return Err(ctx.fail(&format!("output file '{}' must be a plain file name", file)));
            }
            OperatorParams::WriteTable { file }
        }
        Operator::SampleRandom => {
            ctx.arity(&inputs, 1, 1)?;
            ctx.outputs(1, 1)?;
            if !strings.is_empty() {
                return Err(ctx.fail("unexpected string argument"));
            }
            let mut params = params;
            let size = match params.remove("size") {
                Some(v) => ctx.positive_int(&v, "size")?,
                None => return Err(ctx.fail("missing parameter 'size'")),
            };
            ctx.no_params(&params)?;
            OperatorParams::SampleRandom { size }
        }
        Operator::ExecSql => {
            ctx.arity(&inputs, 1, usize::MAX)?;
            ctx.outputs(1, 1)?;
            ctx.no_params(&params)?;
            let query = ctx.single_string(&strings, "query")?;
            if query.trim().is_empty() {
                return Err(ctx.fail("query is empty"));
            }
            OperatorParams::ExecSql { query }
        }
        Operator::Label | Operator::LabelAmt => {
            ctx.arity(&inputs, 1, 1)?;
            ctx.outputs(1, 2)?;
            let instructions = ctx.single_string(&strings, "instructions file")?;
            ctx.extension(&instructions, ".html")?;
            ctx.upload(uploads, &instructions)?;
            OperatorParams::Label(label_params(&ctx, instructions, params, uploads, limits)?)
        }
    };

    Ok(OperatorNode {
        operator,
        params,
        inputs,
        outputs: stmt.outputs.clone(),
        statement: stmt.index,
    })
}

fn label_params(
    ctx: &Ctx<'_>,
    instructions: String,
    mut params: BTreeMap<String, Value>,
    uploads: &Uploads,
    limits: &CompileLimits,
) -> Result<LabelParams, CompileError> {
    let labels = match params.remove("labels") {
        Some(Value::List(items)) => items,
        Some(_) => return Err(ctx.fail("'labels' must be a list")),
        None => return Err(ctx.fail("missing parameter 'labels'")),
    };
    let distinct: HashSet<&String> = labels.iter().collect();
    if labels.len() < 2 || distinct.len() != labels.len() {
        return Err(ctx.fail("'labels' needs at least two distinct values"));
    }
    if labels.iter().any(|l| l == UNDECIDED || l.is_empty()) {
        return Err(ctx.fail(&format!("'{}' and empty values are reserved", UNDECIDED)));
    }

    let mut int_param = |key: &str, default: Option<u64>| -> Result<u64, CompileError> {
        match params.remove(key) {
            Some(v) => ctx.positive_int(&v, key),
            None => default.ok_or_else(|| ctx.fail(&format!("missing parameter '{}'", key))),
        }
    };
    let k = int_param("k", None)?;
    let n = int_param("n", None)?;
    let l = int_param("l", Some(1))?;
    let m = int_param("m", Some(l))?;
    let timeout = int_param("timeout", Some(limits.default_timeout_secs as u64))?;
    let is_amt = ctx.operator == Operator::LabelAmt;
    let batch = if is_amt { int_param("batch", Some(1))? } else { 1 };

    if k > n {
        return Err(ctx.fail("k must not exceed n"));
    }
    if l > m {
        return Err(ctx.fail("l must not exceed m"));
    }

    let layout = match params.remove("layout") {
        Some(Value::Str(file)) => {
            ctx.extension(&file, ".html")?;
            ctx.upload(uploads, &file)?;
            Some(file)
        }
        Some(_) => return Err(ctx.fail("'layout' must be a quoted file name")),
        None => None,
    };

    let reward = if is_amt {
        match params.remove("reward") {
            Some(Value::Str(r)) | Some(Value::Word(r)) => {
                if r.parse::<f64>().map(|v| v <= 0.0 || !v.is_finite()).unwrap_or(true) {
                    return Err(ctx.fail(&format!("invalid reward '{}'", r)));
                }
                Some(r)
            }
            Some(Value::List(_)) => return Err(ctx.fail("'reward' must be a number")),
            None => None,
        }
    } else {
        None
    };

    ctx.no_params(&params)?;

    let narrow = |v: u64, key: &str| u32::try_from(v).map_err(|_| ctx.fail(&format!("'{}' is too large", key)));
    Ok(LabelParams {
        labels,
        k: narrow(k, "k")?,
        n: narrow(n, "n")?,
        l: narrow(l, "l")?,
        m: narrow(m, "m")?,
        timeout_secs: Some(i64::try_from(timeout).map_err(|_| ctx.fail("'timeout' is too large"))?),
        instructions,
        layout,
        provider: is_amt,
        batch_size: narrow(batch, "batch")?,
        reward,
    })
}

/// Data files need valid headers, a unique integer `_id` and must fit the ceilings.
fn check_data_file(file: &str, text: &str, limits: &CompileLimits) -> Result<(), CompileError> {
    let invalid = |message: String| CompileError::InvalidData {
        file: file.to_string(),
        message,
    };
    let table = parse_csv(text).map_err(|e| invalid(e.to_string()))?;

    if table.headers.len() > limits.max_headers {
        return Err(invalid(format!(
            "{} columns exceed the limit of {}",
            table.headers.len(),
            limits.max_headers
        )));
    }
    if table.rows.len() > limits.max_rows {
        return Err(invalid(format!(
            "{} rows exceed the limit of {}",
            table.rows.len(),
            limits.max_rows
        )));
    }

    let mut seen_headers = HashSet::new();
    for h in &table.headers {
        if !is_header_name(h) {
            return Err(invalid(format!("invalid column name '{}'", h)));
        }
        if !seen_headers.insert(h.as_str()) {
            return Err(invalid(format!("duplicate column '{}'", h)));
        }
        if h == "label" {
            return Err(invalid("column name 'label' is reserved".to_string()));
        }
    }

    let id_col = table
        .headers
        .iter()
        .position(|h| h == "_id")
        .ok_or_else(|| invalid("missing '_id' column".to_string()))?;
    let mut ids = HashSet::with_capacity(table.rows.len());
    for (i, row) in table.rows.iter().enumerate() {
        let id: i64 = row[id_col]
            .trim()
            .parse()
            .map_err(|_| invalid(format!("row {}: '_id' is not an integer", i + 1)))?;
        if !ids.insert(id) {
            return Err(invalid(format!("duplicate _id {}", id)));
        }
    }
    Ok(())
}

pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `j{digits}_...` would land in a job's table namespace. SQLite table names
/// are case-insensitive, so `J3_x` counts too.
pub fn is_job_scoped_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(['j', 'J']) else {
        return false;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && rest[digits..].starts_with('_')
}

pub fn is_header_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Ctx<'a> {
    stmt: &'a Statement,
    operator: Operator,
}

impl Ctx<'_> {
    fn fail(&self, message: &str) -> CompileError {
        CompileError::Operator {
            statement: self.stmt.index,
            operator: self.operator.name().to_string(),
            message: message.to_string(),
        }
    }

    fn arity(&self, inputs: &[String], min: usize, max: usize) -> Result<(), CompileError> {
        for name in inputs {
            if !is_variable_name(name) {
                return Err(CompileError::InvalidName {
                    statement: self.stmt.index,
                    name: name.clone(),
                });
            }
        }
        if inputs.len() < min || inputs.len() > max {
            return Err(self.fail(&format!("takes {} input table(s), got {}", describe(min, max), inputs.len())));
        }
        Ok(())
    }

    fn outputs(&self, min: usize, max: usize) -> Result<(), CompileError> {
        let found = self.stmt.outputs.len();
        if found < min || found > max {
            return Err(self.fail(&format!("binds {} output variable(s), got {}", describe(min, max), found)));
        }
        let distinct: HashSet<&String> = self.stmt.outputs.iter().collect();
        if distinct.len() != found {
            return Err(self.fail("output variables must be distinct"));
        }
        Ok(())
    }

    fn no_params(&self, params: &BTreeMap<String, Value>) -> Result<(), CompileError> {
        match params.keys().next() {
            Some(key) => Err(self.fail(&format!("unknown parameter '{}'", key))),
            None => Ok(()),
        }
    }

    fn single_string(&self, strings: &[String], what: &str) -> Result<String, CompileError> {
        match strings {
            [one] => Ok(one.clone()),
            [] => Err(self.fail(&format!("missing {}", what))),
            _ => Err(self.fail("too many string arguments")),
        }
    }

    fn extension(&self, file: &str, ext: &str) -> Result<(), CompileError> {
        if file.len() > ext.len() && file.to_ascii_lowercase().ends_with(ext) {
            Ok(())
        } else {
            Err(self.fail(&format!("'{}' must be a {} file", file, ext)))
        }
    }

    fn upload<'u>(&self, uploads: &'u Uploads, file: &str) -> Result<&'u str, CompileError> {
        uploads
            .get(file)
            .map(String::as_str)
            .ok_or_else(|| CompileError::MissingUpload {
                statement: self.stmt.index,
                file: file.to_string(),
            })
    }

    fn positive_int(&self, value: &Value, key: &str) -> Result<u64, CompileError> {
        let parsed = match value {
            Value::Word(w) | Value::Str(w) => w.trim().parse::<u64>().ok(),
            Value::List(_) => None,
        };
        match parsed {
            Some(v) if v > 0 => Ok(v),
            _ => Err(self.fail(&format!("'{}' must be a positive integer", key))),
        }
    }
}

fn describe(min: usize, max: usize) -> String {
    match (min, max) {
        (a, b) if a == b => a.to_string(),
        (a, usize::MAX) => format!("at least {}", a),
        (a, b) => format!("{} to {}", a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_rules() {
        assert!(is_variable_name("A"));
        assert!(is_variable_name("labels_2"));
        assert!(!is_variable_name("_x"));
        assert!(!is_variable_name("2x"));
        assert!(!is_variable_name(""));
        assert!(is_job_scoped_name("j3_final_labels"));
        assert!(is_job_scoped_name("J12_tasks"));
        assert!(!is_job_scoped_name("j_tasks"));
        assert!(!is_job_scoped_name("j3"));
        assert!(!is_job_scoped_name("jobs_3"));
        assert!(is_header_name("_id"));
        assert!(!is_header_name("first name"));
    }

    #[test]
    fn data_file_checks() {
        let limits = CompileLimits {
            max_headers: 3,
            max_rows: 2,
            default_timeout_secs: 60,
        };
        assert!(check_data_file("a.csv", "_id,x\n1,a\n2,b\n", &limits).is_ok());
        assert!(check_data_file("a.csv", "id,x\n1,a\n", &limits).is_err());
        assert!(check_data_file("a.csv", "_id,x\n1,a\n1,b\n", &limits).is_err());
        assert!(check_data_file("a.csv", "_id,x\none,a\n", &limits).is_err());
        assert!(check_data_file("a.csv", "_id,x\n1,a\n2,b\n3,c\n", &limits).is_err());
        assert!(check_data_file("a.csv", "_id,a,b,c\n1,a,b,c\n", &limits).is_err());
        assert!(check_data_file("a.csv", "_id,bad col\n1,a\n", &limits).is_err());
    }
}
