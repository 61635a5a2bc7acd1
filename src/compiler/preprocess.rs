/// Source preprocessing: comment stripping and literal masking
///
/// Quoted strings and bracketed lists may contain `;`, `,`, `(` and `)`. They are
/// swapped for `@N` placeholders before statements and arguments are split, and
/// restored per argument afterwards.

use super::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    List(Vec<String>),
}

#[derive(Debug)]
pub struct Masked {
    pub text: String,
    literals: Vec<Literal>,
}

impl Masked {
    /// Resolve a token that is exactly one placeholder.
    pub fn literal(&self, token: &str) -> Option<&Literal> {
        let index: usize = token.strip_prefix('@')?.parse().ok()?;
        self.literals.get(index)
    }
}

/// Remove `/* ... */` comments, leaving quoted text untouched.
pub fn strip_comments(source: &str) -> Result<String, CompileError> {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return Err(CompileError::Lexical("unterminated comment".to_string()));
                }
                // keep tokens on either side of the comment apart
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Replace string and list literals with placeholders.
pub fn mask_literals(text: &str) -> Result<Masked, CompileError> {
    let mut out = String::with_capacity(text.len());
    let mut literals = Vec::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let value = read_quoted(&mut chars, c)?;
                out.push_str(&format!("@{}", literals.len()));
                literals.push(Literal::Str(value));
            }
            '[' => {
                let items = read_list(&mut chars)?;
                out.push_str(&format!("@{}", literals.len()));
                literals.push(Literal::List(items));
            }
            ']' => {
                return Err(CompileError::Lexical("unbalanced ']'".to_string()))
            }
            '@' => {
                return Err(CompileError::Lexical("unexpected character '@'".to_string()))
            }
            _ => out.push(c),
        }
    }

    Ok(Masked {
        text: out,
        literals,
    })
}

fn read_quoted(chars: &mut std::str::Chars<'_>, quote: char) -> Result<String, CompileError> {
    let mut value = String::new();
    for c in chars.by_ref() {
        if c == quote {
            return Ok(value);
        }
        value.push(c);
    }
    Err(CompileError::Lexical(format!("unterminated string literal '{}{}'", quote, value)))
}

fn read_list(chars: &mut std::str::Chars<'_>) -> Result<Vec<String>, CompileError> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    loop {
        let Some(c) = chars.next() else {
            return Err(CompileError::Lexical("unterminated list literal".to_string()));
        };
        match c {
            '\'' | '"' => {
                current.push_str(&read_quoted(chars, c)?);
                quoted = true;
            }
            ',' => {
                push_item(&mut items, &mut current, &mut quoted)?;
            }
            ']' => {
                if !current.trim().is_empty() || quoted || !items.is_empty() {
                    push_item(&mut items, &mut current, &mut quoted)?;
                }
                return Ok(items);
            }
            '[' => {
                return Err(CompileError::Lexical("nested lists are not supported".to_string()))
            }
            _ => current.push(c),
        }
    }
}

fn push_item(items: &mut Vec<String>, current: &mut String, quoted: &mut bool) -> Result<(), CompileError> {
    let item = if *quoted {
        current.clone()
    } else {
        current.trim().to_string()
    };
    if item.is_empty() && !*quoted {
        return Err(CompileError::Lexical("empty list item".to_string()));
    }
    items.push(item);
    current.clear();
    *quoted = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_removed_but_quoted_text_kept() {
        let out = strip_comments("A = read_table('a/*b*/.csv'); /* note; x */ B").unwrap();
        assert_eq!(out, "A = read_table('a/*b*/.csv');   B");
    }

    #[test]
    fn unterminated_comment_is_an_error() {
        assert!(strip_comments("A /* open").is_err());
    }

    #[test]
    fn literals_are_masked_and_restorable() {
        let masked = mask_literals("L = label(A, 'i,x.html', labels=[Yes, 'No, really']);").unwrap();
        assert_eq!(masked.text, "L = label(A, @0, labels=@1);");
        assert_eq!(masked.literal("@0"), Some(&Literal::Str("i,x.html".into())));
        assert_eq!(
            masked.literal("@1"),
            Some(&Literal::List(vec!["Yes".into(), "No, really".into()]))
        );
        assert_eq!(masked.literal("@2"), None);
    }

    #[test]
    fn empty_list_and_bad_lists() {
        let masked = mask_literals("[]").unwrap();
        assert_eq!(masked.literal("@0"), Some(&Literal::List(vec![])));
        assert!(mask_literals("[a,,b]").is_err());
        assert!(mask_literals("[a, b").is_err());
        assert!(mask_literals("'open").is_err());
    }
}
