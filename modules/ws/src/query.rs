//! Extraction of the subscribed field and its arguments from a
//! subscription query, without a full GraphQL parser.
//!
//! Arguments start from the request variables; inline argument values of
//! the same name overwrite them. Inline values cover the scalar literals,
//! enums (as strings), lists, and `$variable` references.

use crate::protocol::SubscribePayload;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("malformed subscription query")]
    Malformed,

    #[error("empty subscription field name")]
    EmptyField,

    #[error("unmatched '(' in subscription arguments")]
    UnmatchedParen,

    #[error("expected ':' after argument name {0:?}")]
    ExpectedColon(String),

    #[error("unterminated string")]
    UnterminatedString,

    #[error("unterminated list")]
    UnterminatedList,

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("expected variable name after '$'")]
    EmptyVariable,

    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),

    #[error("unexpected end of arguments")]
    UnexpectedEnd,
}

/// Extract `(field_name, args)` from a subscription payload
pub fn extract_subscription_field(
    payload: &SubscribePayload,
) -> Result<(String, Map<String, Value>), QueryError> {
    let mut query = payload.query.trim();

    // strip "subscription", an optional operation name, and an optional
    // variable-declaration list
    if query.to_lowercase().starts_with("subscription") {
        query = query["subscription".len()..].trim_start();
        if !query.starts_with('{') {
            if query.starts_with('(') {
                query = skip_parens(query)?;
            } else {
                let idx = query.find(['{', '(']).ok_or(QueryError::Malformed)?;
                if query.as_bytes()[idx] == b'(' {
                    query = skip_parens(&query[idx..])?;
                } else {
                    query = &query[idx..];
                }
            }
            query = query.trim_start();
        }
    }

    let query = query.trim();
    if query.len() < 2 || !query.starts_with('{') {
        return Err(QueryError::Malformed);
    }
    let query = query[1..].trim_start();

    // field name runs up to '(', '{' or whitespace
    let field_end = query
        .find(|c: char| c == '(' || c == '{' || c.is_whitespace())
        .unwrap_or(query.len());
    let field_name = &query[..field_end];
    if field_name.is_empty() {
        return Err(QueryError::EmptyField);
    }

    // variables seed the args; inline values overwrite them
    let mut args = payload.variables.clone().unwrap_or_default();

    let rest = query[field_end..].trim_start();
    if rest.starts_with('(') {
        let closing = find_matching_paren(rest).ok_or(QueryError::UnmatchedParen)?;
        let inline = parse_args(&rest[1..closing], payload.variables.as_ref())?;
        for (name, value) in inline {
            args.insert(name, value);
        }
    }

    Ok((field_name.to_string(), args))
}

/// Skip a parenthesized group at the start of `s`, returning what follows
fn skip_parens(s: &str) -> Result<&str, QueryError> {
    let closing = find_matching_paren(s).ok_or(QueryError::UnmatchedParen)?;
    Ok(&s[closing + 1..])
}

/// Index of the ')' matching the '(' at `s[0]`, quote- and nesting-aware
fn find_matching_paren(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1, // skip the escaped byte
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parse a `name: value, ...` argument list
fn parse_args(
    s: &str,
    variables: Option<&Map<String, Value>>,
) -> Result<Map<String, Value>, QueryError> {
    let mut args = Map::new();
    let mut s = s.trim();

    while !s.is_empty() {
        let name_end = s
            .find(|c: char| c == ':' || c.is_whitespace())
            .ok_or_else(|| QueryError::ExpectedColon(s.to_string()))?;
        let name = &s[..name_end];
        s = s[name_end..].trim_start();

        if !s.starts_with(':') {
            return Err(QueryError::ExpectedColon(name.to_string()));
        }
        s = s[1..].trim_start();

        let (value, rest) = parse_value(s, variables)?;
        args.insert(name.to_string(), value);
        s = rest.trim_start();

        if s.starts_with(',') {
            s = s[1..].trim_start();
        }
    }

    Ok(args)
}

/// Parse one value, returning it with the remaining input
fn parse_value<'a>(
    s: &'a str,
    variables: Option<&Map<String, Value>>,
) -> Result<(Value, &'a str), QueryError> {
    let first = s.chars().next().ok_or(QueryError::UnexpectedEnd)?;

    match first {
        '"' => parse_string(s),
        '[' => parse_list(s, variables),
        '$' => parse_variable(s, variables),
        '-' | '0'..='9' => parse_number(s),
        _ if s.starts_with("true") && ends_ident(s, 4) => Ok((Value::Bool(true), &s[4..])),
        _ if s.starts_with("false") && ends_ident(s, 5) => Ok((Value::Bool(false), &s[5..])),
        _ if s.starts_with("null") && ends_ident(s, 4) => Ok((Value::Null, &s[4..])),
        _ => parse_enum(s),
    }
}

/// True when the identifier starting at 0 ends exactly at `len`
fn ends_ident(s: &str, len: usize) -> bool {
    s[len..].chars().next().map_or(true, |c| !is_ident_char(c))
}

fn parse_string(s: &str) -> Result<(Value, &str), QueryError> {
    let bytes = s.as_bytes();
    let mut out = String::new();
    let mut i = 1; // opening quote
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                match bytes[i + 1] {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'/' => out.push('/'),
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'r' => out.push('\r'),
                    other => {
                        out.push('\\');
                        out.push(other as char);
                    }
                }
                i += 2;
            }
            b'"' => return Ok((Value::String(out), &s[i + 1..])),
            _ => {
                // copy the whole UTF-8 character
                let ch = s[i..].chars().next().ok_or(QueryError::UnterminatedString)?;
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Err(QueryError::UnterminatedString)
}

fn parse_list<'a>(
    s: &'a str,
    variables: Option<&Map<String, Value>>,
) -> Result<(Value, &'a str), QueryError> {
    let mut s = s[1..].trim_start(); // '['
    let mut list = Vec::new();

    while !s.is_empty() && !s.starts_with(']') {
        let (value, rest) = parse_value(s, variables)?;
        list.push(value);
        s = rest.trim_start();
        if s.starts_with(',') {
            s = s[1..].trim_start();
        }
    }

    if s.is_empty() {
        return Err(QueryError::UnterminatedList);
    }
    Ok((Value::Array(list), &s[1..]))
}

fn parse_variable<'a>(
    s: &'a str,
    variables: Option<&Map<String, Value>>,
) -> Result<(Value, &'a str), QueryError> {
    let s = &s[1..]; // '$'
    let end = s
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return Err(QueryError::EmptyVariable);
    }
    let name = &s[..end];
    let value = variables
        .and_then(|vars| vars.get(name).cloned())
        .unwrap_or(Value::Null); // unresolved variables become null
    Ok((value, &s[end..]))
}

fn parse_number(s: &str) -> Result<(Value, &str), QueryError> {
    let bytes = s.as_bytes();
    let mut end = 0;
    if bytes.first() == Some(&b'-') {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut is_float = false;
    if end < bytes.len() && bytes[end] == b'.' {
        is_float = true;
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }

    let text = &s[..end];
    let number = if is_float {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .ok_or_else(|| QueryError::InvalidNumber(text.to_string()))?
    } else {
        Number::from(
            text.parse::<i64>()
                .map_err(|_| QueryError::InvalidNumber(text.to_string()))?,
        )
    };
    Ok((Value::Number(number), &s[end..]))
}

/// A bare identifier: an enum value, carried as a string
fn parse_enum(s: &str) -> Result<(Value, &str), QueryError> {
    let end = s
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        return Err(QueryError::UnexpectedChar(s.chars().next().unwrap_or(' ')));
    }
    Ok((Value::String(s[..end].to_string()), &s[end..]))
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}
