//! Recursive-descent parser for splitter expressions.

use super::SplitGroup;
use crate::error::{ErrorCode, Result, SplitflowError};

pub(super) fn parse_groups(expression: &str) -> Result<Vec<SplitGroup>> {
    let mut parser = Parser {
        source: expression,
        chars: expression.char_indices().peekable(),
    };
    let groups = parser.node()?;
    parser.skip_whitespace();
    if let Some((pos, c)) = parser.chars.next() {
        return Err(parser.error(format!("unexpected '{}' at position {}", c, pos)));
    }
    Ok(groups)
}

struct Parser<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    /// field | '(' list ')' | '[' list ']'
    fn node(&mut self) -> Result<Vec<SplitGroup>> {
        self.skip_whitespace();
        match self.chars.peek().copied() {
            Some((_, '(')) => {
                self.chars.next();
                let children = self.list(')')?;
                let mut fields = Vec::new();
                for child in children {
                    match child.as_slice() {
                        [group] => fields.extend(group.fields().iter().cloned()),
                        _ => {
                            return Err(self.error(
                                "an outer product cannot appear inside a scalar split",
                            ))
                        }
                    }
                }
                Ok(vec![SplitGroup::new(fields)])
            }
            Some((_, '[')) => {
                self.chars.next();
                Ok(self.list(']')?.into_iter().flatten().collect())
            }
            Some((_, c)) if is_field_char(c) => Ok(vec![SplitGroup::new([self.field()])]),
            Some((pos, c)) => Err(self.error(format!("unexpected '{}' at position {}", c, pos))),
            None => Err(self.error("expression ended early")),
        }
    }

    fn list(&mut self, close: char) -> Result<Vec<Vec<SplitGroup>>> {
        let mut items = vec![self.node()?];
        loop {
            self.skip_whitespace();
            match self.chars.next() {
                Some((_, ',')) => items.push(self.node()?),
                Some((_, c)) if c == close => return Ok(items),
                Some((pos, c)) => {
                    return Err(self.error(format!(
                        "expected ',' or '{}' at position {}, found '{}'",
                        close, pos, c
                    )))
                }
                None => return Err(self.error(format!("missing closing '{}'", close))),
            }
        }
    }

    fn field(&mut self) -> String {
        let mut name = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if !is_field_char(c) {
                break;
            }
            name.push(c);
            self.chars.next();
        }
        name
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn error(&self, detail: impl AsRef<str>) -> SplitflowError {
        SplitflowError::configuration_with_code(
            ErrorCode::CONFIG_INVALID_SPLITTER,
            format!("invalid split expression '{}': {}", self.source, detail.as_ref()),
            Some("split".to_string()),
        )
    }
}

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '.'
}
