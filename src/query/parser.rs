//! Parser for sanitized query expressions.
//!
//! Accepts `[await] __COLLECTION__.method(args).method(args)...[;]` where every
//! argument is a literal: JavaScript-style objects and arrays, quoted strings,
//! numbers, `true`/`false`/`null`, and the shell constructors `Date`,
//! `ISODate`, `ObjectId`, `NumberInt`, `NumberLong`, `NumberDecimal`.
//! Identifiers, operators, function literals and regular expressions are
//! syntax errors, so nothing in the text can name code to run.
//!
//! Dates become `{"$date": "<rfc3339>"}` and object ids `{"$oid": "<hex>"}`;
//! [`super::plan`] turns them into stored values.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use super::QueryError;
use crate::sanitize::PLACEHOLDER;

/// One method call in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
}

/// Parses a sanitized expression into its call chain.
///
/// The first call is the collection method; the rest are cursor methods.
pub fn parse_expression(text: &str) -> Result<Vec<Call>, QueryError> {
    let mut p = Parser::new(text);
    p.skip_ws();

    let mut root = p.ident().ok_or_else(|| p.error("expected the collection"))?;
    if root == "await" || root == "return" {
        p.skip_ws();
        root = p.ident().ok_or_else(|| p.error("expected the collection"))?;
    }
    if root != PLACEHOLDER {
        return Err(QueryError::NotPermitted(format!(
            "an expression rooted at `{}` instead of the collection",
            root
        )));
    }

    let mut calls = Vec::new();
    loop {
        p.skip_ws();
        if !p.eat('.') {
            break;
        }
        p.skip_ws();
        let method = p.ident().ok_or_else(|| p.error("expected a method name"))?;
        p.skip_ws();
        if !p.eat('(') {
            return Err(QueryError::NotPermitted(format!(
                "property access `{}`",
                method
            )));
        }
        let args = p.sequence(')')?;
        calls.push(Call {
            method: method.to_string(),
            args,
        });
    }

    p.skip_ws();
    p.eat(';');
    p.skip_ws();
    if !p.at_end() {
        return Err(p.error("unexpected trailing input"));
    }
    if calls.is_empty() {
        return Err(QueryError::Invalid(
            "expression does not call a collection method".to_string(),
        ));
    }
    Ok(calls)
}

/// Parses a single literal value.
pub fn parse_literal(text: &str) -> Result<Value, QueryError> {
    let mut p = Parser::new(text);
    let value = p.value()?;
    p.skip_ws();
    if !p.at_end() {
        return Err(p.error("unexpected trailing input"));
    }
    Ok(value)
}

/// Deepest nesting of objects and arrays accepted in a literal.
pub const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    /// Parses one nested container, bounding recursion at [`MAX_DEPTH`].
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_DEPTH)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), QueryError> {
        self.skip_ws();
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", c)))
        }
    }

    /// Skips whitespace and `//` / `/* */` comments.
    fn skip_ws(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with("//") {
                let end = trimmed.find('\n').unwrap_or(trimmed.len());
                self.pos += end;
            } else if trimmed.starts_with("/*") {
                match trimmed[2..].find("*/") {
                    Some(end) => self.pos += end + 4,
                    None => self.pos = self.src.len(),
                }
            } else {
                return;
            }
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if c.is_alphabetic() || c == '_' || c == '$' => {}
            _ => return None,
        }
        let end = chars
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '$'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        Some(&rest[..end])
    }

    /// Unquoted object key; dotted paths are accepted.
    fn key(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '$' || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    /// Comma-separated values up to `close`; a trailing comma is allowed.
    fn sequence(&mut self, close: char) -> Result<Vec<Value>, QueryError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }

    fn value(&mut self) -> Result<Value, QueryError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('{') => {
                self.bump();
                self.nested(|p| p.object())
            }
            Some('[') => {
                self.bump();
                self.nested(|p| p.sequence(']')).map(Value::Array)
            }
            Some(q @ ('"' | '\'' | '`')) => {
                self.bump();
                Ok(Value::String(self.string(q)?))
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.number(),
            Some('/') => Err(self.error("regular expressions are not supported")),
            Some(_) => self.word(),
        }
    }

    fn object(&mut self) -> Result<Value, QueryError> {
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => {
                    self.bump();
                    self.string(q)?
                }
                _ => self
                    .key()
                    .ok_or_else(|| self.error("expected an object key"))?
                    .to_string(),
            };
            self.expect(':')?;
            let value = self.value()?;
            if map.insert(key.clone(), value).is_some() {
                return Err(self.error(format!("duplicate key `{}`", key)));
            }
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            self.expect('}')?;
            return Ok(Value::Object(map));
        }
    }

    fn string(&mut self, quote: char) -> Result<String, QueryError> {
        let mut out = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| self.error("unterminated string"))?;
            match c {
                c if c == quote => return Ok(out),
                '$' if quote == '`' && self.peek() == Some('{') => {
                    return Err(self.error("template substitutions are not supported"));
                }
                '\\' => {
                    let esc = self
                        .bump()
                        .ok_or_else(|| self.error("unterminated string"))?;
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '0' => out.push('\0'),
                        'u' => {
                            let start = self.pos;
                            let hex = self
                                .rest()
                                .get(..4)
                                .ok_or_else(|| self.error("truncated unicode escape"))?;
                            let code = u32::from_str_radix(hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid unicode escape"))?;
                            self.pos = start + 4;
                            out.push(code);
                        }
                        other => out.push(other),
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Value, QueryError> {
        let start = self.pos;
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(i, c)| {
                !(c.is_ascii_digit()
                    || *c == '.'
                    || *c == 'e'
                    || *c == 'E'
                    || ((*c == '-' || *c == '+')
                        && (*i == 0 || matches!(rest.as_bytes()[i - 1], b'e' | b'E'))))
            })
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let text = &rest[..end];
        self.pos += end;
        number_from_str(text.trim_start_matches('+')).ok_or(QueryError::Syntax {
            offset: start,
            message: format!("invalid number `{}`", text),
        })
    }

    /// Keyword literals and shell constructors.
    fn word(&mut self) -> Result<Value, QueryError> {
        let start = self.pos;
        let word = self
            .ident()
            .ok_or_else(|| self.error("unexpected character"))?;
        match word {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" | "undefined" => Ok(Value::Null),
            "new" => {
                self.skip_ws();
                let ctor = self
                    .ident()
                    .ok_or_else(|| self.error("expected a constructor after `new`"))?;
                self.constructor(ctor, start)
            }
            other => self.constructor(other, start),
        }
    }

    fn constructor(&mut self, name: &str, start: usize) -> Result<Value, QueryError> {
        self.skip_ws();
        let known = matches!(
            name,
            "Date" | "ISODate" | "ObjectId" | "NumberInt" | "NumberLong" | "NumberDecimal"
        );
        if !known || !self.eat('(') {
            return Err(QueryError::Syntax {
                offset: start,
                message: format!("unexpected identifier `{}`", name),
            });
        }
        let args = self.sequence(')')?;
        let bad_args = || QueryError::Syntax {
            offset: start,
            message: format!("invalid arguments to `{}`", name),
        };
        match name {
            "Date" | "ISODate" => {
                let date = match args.as_slice() {
                    [] => Utc::now(),
                    [Value::String(s)] => {
                        return Ok(tagged("$date", Value::String(s.clone())));
                    }
                    [Value::Number(n)] => n
                        .as_i64()
                        .and_then(DateTime::from_timestamp_millis)
                        .ok_or_else(bad_args)?,
                    _ => return Err(bad_args()),
                };
                Ok(tagged(
                    "$date",
                    Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ))
            }
            "ObjectId" => match args.as_slice() {
                [Value::String(s)] => Ok(tagged("$oid", Value::String(s.clone()))),
                _ => Err(bad_args()),
            },
            _ => match args.as_slice() {
                [Value::Number(n)] => Ok(Value::Number(n.clone())),
                [Value::String(s)] => number_from_str(s.trim()).ok_or_else(bad_args),
                _ => Err(bad_args()),
            },
        }
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(tag.to_string(), value);
    Value::Object(map)
}

fn number_from_str(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_find() {
        let calls = parse_expression(r#"__COLLECTION__.find({channel: "X"})"#).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "find");
        assert_eq!(calls[0].args, vec![json!({"channel": "X"})]);
    }

    #[test]
    fn test_cursor_chain_and_semicolon() {
        let calls = parse_expression(
            "await __COLLECTION__\n  .find({}, {channel: 1, _id: 0})\n  .sort({aum: -1})\n  .limit(5)\n  .toArray();",
        )
        .unwrap();
        let methods: Vec<_> = calls.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, ["find", "sort", "limit", "toArray"]);
        assert_eq!(calls[0].args[1], json!({"channel": 1, "_id": 0}));
        assert_eq!(calls[1].args[0], json!({"aum": -1}));
        assert_eq!(calls[2].args[0], json!(5));
    }

    #[test]
    fn test_aggregate_literals() {
        let calls = parse_expression(
            r#"__COLLECTION__.aggregate([
                // total by channel
                { $match: { 'financials_date': { $gte: Date("2023-01-01") } } },
                { "$group": { _id: "$channel", total: { $sum: "$revenue" }, } },
                /* biggest first */
                { $sort: { total: -1.0 } },
            ])"#,
        )
        .unwrap();
        assert_eq!(
            calls[0].args[0],
            json!([
                {"$match": {"financials_date": {"$gte": {"$date": "2023-01-01"}}}},
                {"$group": {"_id": "$channel", "total": {"$sum": "$revenue"}}},
                {"$sort": {"total": -1.0}}
            ])
        );
    }

    #[test]
    fn test_constructors() {
        assert_eq!(
            parse_literal(r#"new Date("2023-05-01T00:00:00Z")"#).unwrap(),
            json!({"$date": "2023-05-01T00:00:00Z"})
        );
        assert_eq!(
            parse_literal("Date(0)").unwrap(),
            json!({"$date": "1970-01-01T00:00:00.000Z"})
        );
        assert_eq!(
            parse_literal(r#"ObjectId("64b7f0c2a1")"#).unwrap(),
            json!({"$oid": "64b7f0c2a1"})
        );
        assert_eq!(parse_literal(r#"NumberInt("42")"#).unwrap(), json!(42));
        assert_eq!(parse_literal("NumberDecimal(1.5)").unwrap(), json!(1.5));
        assert!(parse_literal("new Date()").unwrap()["$date"].is_string());
    }

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(parse_literal("-12").unwrap(), json!(-12));
        assert_eq!(parse_literal("1e3").unwrap(), json!(1000.0));
        assert_eq!(parse_literal("2.5E-1").unwrap(), json!(0.25));
        assert_eq!(parse_literal(r"'it\'s'").unwrap(), json!("it's"));
        assert_eq!(parse_literal(r#""é\n""#).unwrap(), json!("é\n"));
        assert_eq!(parse_literal("[1, 'a', null, true,]").unwrap(), json!([1, "a", null, true]));
    }

    #[test]
    fn test_write_method_parses_but_is_plain_call() {
        // Permission checks happen in the planner, not here.
        let calls = parse_expression("__COLLECTION__.deleteMany({})").unwrap();
        assert_eq!(calls[0].method, "deleteMany");
    }

    #[test]
    fn test_rejects_code() {
        for text in [
            "__COLLECTION__.find({$where: function() { return true }})",
            "__COLLECTION__.find({a: process.env})",
            "__COLLECTION__.find({a: 1 + 1})",
            "__COLLECTION__.find({channel: /Ret/})",
            "__COLLECTION__.find({channel: `${x}`})",
            "__COLLECTION__.find({}); __COLLECTION__.drop()",
            "__COLLECTION__.find({})[0]",
        ] {
            let err = parse_expression(text).unwrap_err();
            assert!(
                matches!(err, QueryError::Syntax { .. }),
                "{:?} gave {:?}",
                text,
                err
            );
        }
    }

    #[test]
    fn test_rejects_other_roots() {
        for text in [
            "db.getCollection('users').find({})",
            "require('child_process').exec('ls')",
            "collection.find({})",
        ] {
            assert!(matches!(
                parse_expression(text).unwrap_err(),
                QueryError::NotPermitted(_)
            ));
        }
    }

    #[test]
    fn test_property_access_rejected() {
        let err = parse_expression("__COLLECTION__.s.db.dropDatabase()").unwrap_err();
        assert!(matches!(err, QueryError::NotPermitted(_)));
    }

    #[test]
    fn test_placeholder_alone_is_invalid() {
        assert!(matches!(
            parse_expression("__COLLECTION__").unwrap_err(),
            QueryError::Invalid(_)
        ));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        assert!(parse_literal("{a: 1, a: 2}").is_err());
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let nested = |n: usize| format!("{}1{}", "[".repeat(n), "]".repeat(n));
        assert!(parse_literal(&nested(MAX_DEPTH)).is_ok());
        assert!(matches!(
            parse_literal(&nested(MAX_DEPTH + 1)),
            Err(QueryError::Syntax { .. })
        ));

        // Far past the limit still fails cleanly instead of exhausting the stack.
        let text = format!("__COLLECTION__.find({{channel: {}}})", nested(20_000));
        assert!(matches!(
            parse_expression(&text),
            Err(QueryError::Syntax { .. })
        ));
        let objects = format!("{}1{}", "{a: ".repeat(20_000), "}".repeat(20_000));
        assert!(matches!(
            parse_literal(&objects),
            Err(QueryError::Syntax { .. })
        ));
    }
}
