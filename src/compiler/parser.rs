/// Statement parser for the workflow DSL
///
/// Grammar: `[var[, var...] =] operator(arg[, arg...]);`. Runs on masked text, so
/// the only `,` `(` `)` `;` and `=` left are structural.

use super::preprocess::{Literal, Masked};
use super::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Word(String),
    Str(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// Bare identifier referring to a bound variable.
    Variable(String),
    Str(String),
    List(Vec<String>),
    Param { key: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based position in the program.
    pub index: usize,
    pub operator: String,
    pub args: Vec<Argument>,
    pub outputs: Vec<String>,
}

pub fn parse_program(masked: &Masked) -> Result<Vec<Statement>, CompileError> {
    masked
        .text
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, text)| parse_statement(i + 1, text, masked))
        .collect()
}

fn parse_statement(index: usize, text: &str, masked: &Masked) -> Result<Statement, CompileError> {
    let syntax = |message: &str| CompileError::Syntax {
        statement: index,
        message: message.to_string(),
    };

    let open = text.find('(').ok_or_else(|| syntax("expected '('"))?;
    let close = text.rfind(')').ok_or_else(|| syntax("expected ')'"))?;
    if close < open {
        return Err(syntax("unbalanced parentheses"));
    }
    if !text[close + 1..].trim().is_empty() {
        return Err(syntax("unexpected text after ')'"));
    }

    let head = &text[..open];
    let (outputs, operator) = match head.split_once('=') {
        Some((lhs, op)) => {
            let outputs: Vec<String> = lhs.split(',').map(|v| v.trim().to_string()).collect();
            if outputs.iter().any(String::is_empty) {
                return Err(syntax("empty output variable"));
            }
            (outputs, op.trim())
        }
        None => (Vec::new(), head.trim()),
    };
    if operator.is_empty() || operator.contains(char::is_whitespace) {
        return Err(syntax("malformed operator name"));
    }

    let inner = &text[open + 1..close];
    if inner.contains(['(', ')']) {
        return Err(syntax("nested parentheses are not supported"));
    }

    let mut args = Vec::new();
    if !inner.trim().is_empty() {
        for raw in inner.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(syntax("empty argument"));
            }
            args.push(parse_argument(raw, masked).map_err(|m| syntax(&m))?);
        }
    }

    Ok(Statement {
        index,
        operator: operator.to_string(),
        args,
        outputs,
    })
}

fn parse_argument(raw: &str, masked: &Masked) -> Result<Argument, String> {
    if let Some((key, value)) = raw.split_once('=') {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(format!("malformed parameter '{}'", raw));
        }
        let value = match masked.literal(value) {
            Some(Literal::Str(s)) => Value::Str(s.clone()),
            Some(Literal::List(items)) => Value::List(items.clone()),
            None => Value::Word(value.to_string()),
        };
        return Ok(Argument::Param {
            key: key.to_string(),
            value,
        });
    }

    Ok(match masked.literal(raw) {
        Some(Literal::Str(s)) => Argument::Str(s.clone()),
        Some(Literal::List(items)) => Argument::List(items.clone()),
        None => Argument::Variable(raw.to_string()),
    })
}
