/// Minimal CSV reader/writer for uploaded data files and exported tables
///
/// Supports RFC 4180 quoting (quoted fields, doubled quotes, embedded
/// separators and newlines). Every value is kept as text; typing is left to SQL.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsvError {
    #[error("file is empty")]
    Empty,
    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },
    #[error("row {row} has {found} fields, header has {expected}")]
    Ragged { row: usize, expected: usize, found: usize },
}

/// Parse CSV text into a header row and data rows.
pub fn parse_csv(text: &str) -> Result<Table, CsvError> {
    let mut records = parse_records(text)?;
    if records.is_empty() {
        return Err(CsvError::Empty);
    }
    let headers: Vec<String> = records
        .remove(0)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    for (i, row) in records.iter().enumerate() {
        if row.len() != headers.len() {
            return Err(CsvError::Ragged {
                row: i + 1,
                expected: headers.len(),
                found: row.len(),
            });
        }
    }

    Ok(Table {
        headers,
        rows: records,
    })
}

fn parse_records(text: &str) -> Result<Vec<Vec<String>>, CsvError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut line = 1;
    let mut chars = text.chars().peekable();
    let mut dirty = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                in_quotes = true;
                quote_line = line;
                dirty = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                dirty = true;
            }
            '\r' => {}
            '\n' => {
                line += 1;
                if dirty || !field.is_empty() {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                dirty = false;
            }
            _ => {
                field.push(c);
                dirty = true;
            }
        }
    }

    if in_quotes {
        return Err(CsvError::UnterminatedQuote { line: quote_line });
    }
    if dirty || !field.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

/// Render rows as CSV; `None` cells become empty fields.
pub fn write_csv(headers: &[String], rows: &[Vec<Option<String>>], include_header: bool) -> String {
    let mut out = String::new();
    if include_header {
        let line: Vec<String> = headers.iter().map(|h| escape(h)).collect();
        let _ = writeln!(out, "{}", line.join(","));
    }
    for row in rows {
        let line: Vec<String> = row
            .iter()
            .map(|cell| cell.as_deref().map(escape).unwrap_or_default())
            .collect();
        let _ = writeln!(out, "{}", line.join(","));
    }
    out
}

fn escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_fields_with_commas() {
        let t = parse_csv("_id,name\n1,\"Smith, John\"\n2,\"say \"\"hi\"\"\"\n").unwrap();
        assert_eq!(t.headers, vec!["_id", "name"]);
        assert_eq!(t.rows[0][1], "Smith, John");
        assert_eq!(t.rows[1][1], "say \"hi\"");
    }

    #[test]
    fn skips_blank_lines_and_handles_missing_trailing_newline() {
        let t = parse_csv("_id,a\r\n1,x\r\n\r\n2,y").unwrap();
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[1], vec!["2", "y"]);
    }

    #[test]
    fn rejects_ragged_rows() {
        assert_eq!(
            parse_csv("_id,a\n1\n"),
            Err(CsvError::Ragged { row: 1, expected: 2, found: 1 })
        );
        assert!(matches!(parse_csv(""), Err(CsvError::Empty)));
        assert!(matches!(
            parse_csv("_id\n\"1\n"),
            Err(CsvError::UnterminatedQuote { .. })
        ));
    }

    #[test]
    fn escapes_on_write() {
        let csv = write_csv(
            &["_id".into(), "v".into()],
            &[vec![Some("1".into()), Some("a,b".into())], vec![Some("2".into()), None]],
            true,
        );
        assert_eq!(csv, "_id,v\n1,\"a,b\"\n2,\n");
    }
}
