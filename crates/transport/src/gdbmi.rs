//! Structured sub-reply notation
//!
//! The debugger extension reports stack frames, threads, modules, registers,
//! breakpoint listings and stop reasons in a GDB/MI like notation:
//!
//! ```text
//! {reason="breakpoint",breakpointId="100100",threadId="3",stack=[frame={level="0",address="0x7ff6a1032410"}]}
//! ```
//!
//! Tuples (`{...}`) and lists (`[...]`) nest arbitrarily, children may be
//! named (`name=value`) and leaves are C-escaped strings. Lookups of absent
//! children yield an invalid sentinel rather than a default value so callers
//! can tell "missing" from "zero".
use std::fmt;
use std::ops::Index;

use crate::error::ParseError;

/// Kind of a [`GdbMi`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    /// Absent value, returned for failed lookups.
    #[default]
    Invalid,
    /// Scalar leaf.
    Const,
    /// `{...}`
    Tuple,
    /// `[...]`
    List,
}

/// A node of a structured reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GdbMi {
    name: String,
    data: String,
    kind: Kind,
    children: Vec<GdbMi>,
}

static INVALID: GdbMi = GdbMi {
    name: String::new(),
    data: String::new(),
    kind: Kind::Invalid,
    children: Vec::new(),
};

impl GdbMi {
    /// Parse a complete reply.
    ///
    /// Several comma separated top level results (`a="1",b="2"`) are wrapped
    /// into an anonymous tuple.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut parser = Parser::new(input);
        parser.skip_spaces();
        let mut results = Vec::new();
        loop {
            if parser.at_end() {
                break;
            }
            results.push(parser.result_or_value()?);
            parser.skip_spaces();
            if !parser.eat(',') {
                break;
            }
            parser.skip_spaces();
        }
        parser.skip_spaces();
        if !parser.at_end() {
            return Err(ParseError::TrailingInput {
                offset: parser.offset(),
            });
        }
        match results.len() {
            0 => Err(ParseError::UnexpectedEnd { offset: 0 }),
            1 => Ok(results.remove(0)),
            _ => Ok(Self::tuple("", results)),
        }
    }

    /// A named scalar.
    pub fn constant(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            kind: Kind::Const,
            children: Vec::new(),
        }
    }

    /// A named tuple.
    pub fn tuple(name: impl Into<String>, children: Vec<GdbMi>) -> Self {
        Self {
            name: name.into(),
            data: String::new(),
            kind: Kind::Tuple,
            children,
        }
    }

    /// A named list.
    pub fn list(name: impl Into<String>, children: Vec<GdbMi>) -> Self {
        Self {
            name: name.into(),
            data: String::new(),
            kind: Kind::List,
            children,
        }
    }

    /// The shared invalid sentinel.
    pub fn invalid() -> &'static GdbMi {
        &INVALID
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_valid(&self) -> bool {
        self.kind != Kind::Invalid
    }

    pub fn children(&self) -> &[GdbMi] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GdbMi> {
        self.children.iter()
    }

    /// Look up a named child, returning the invalid sentinel when absent.
    pub fn get(&self, name: &str) -> &GdbMi {
        self.children
            .iter()
            .find(|c| c.name == name)
            .unwrap_or(&INVALID)
    }

    /// Scalar data of a named child, if present.
    pub fn str_of(&self, name: &str) -> Option<&str> {
        let child = self.get(name);
        (child.kind == Kind::Const).then_some(child.data.as_str())
    }

    /// Decimal or `0x` prefixed integer.
    pub fn to_int(&self) -> Option<i64> {
        if self.kind != Kind::Const {
            return None;
        }
        parse_int(&self.data)
    }

    /// Address in hexadecimal, with or without `0x`, with CDB's `` ` `` separator.
    pub fn to_address(&self) -> Option<u64> {
        if self.kind != Kind::Const {
            return None;
        }
        parse_address(&self.data)
    }

    /// `true`/`1` and `false`/`0`.
    pub fn to_bool(&self) -> Option<bool> {
        match self.data.as_str() {
            "true" | "1" if self.kind == Kind::Const => Some(true),
            "false" | "0" if self.kind == Kind::Const => Some(false),
            _ => None,
        }
    }
}

impl Index<&str> for GdbMi {
    type Output = GdbMi;

    fn index(&self, name: &str) -> &Self::Output {
        self.get(name)
    }
}

impl<'a> IntoIterator for &'a GdbMi {
    type Item = &'a GdbMi;
    type IntoIter = std::slice::Iter<'a, GdbMi>;

    fn into_iter(self) -> Self::IntoIter {
        self.children.iter()
    }
}

impl fmt::Display for GdbMi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            write!(f, "{}=", self.name)?;
        }
        match self.kind {
            Kind::Invalid => Ok(()),
            Kind::Const => {
                f.write_str("\"")?;
                for c in self.data.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Kind::Tuple | Kind::List => {
                let (open, close) = if self.kind == Kind::Tuple {
                    ('{', '}')
                } else {
                    ('[', ']')
                };
                write!(f, "{open}")?;
                for (i, child) in self.children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

/// Parse a decimal or `0x` prefixed (optionally negative) integer.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

/// Parse a hexadecimal address such as `0x401000` or ``00000000`77490000``.
pub fn parse_address(s: &str) -> Option<u64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != '`').collect();
    let hex = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    if hex.is_empty() {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn offset(&self) -> usize {
        self.pos
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn end_error(&self) -> ParseError {
        ParseError::UnexpectedEnd { offset: self.pos }
    }

    fn unexpected(&self, found: char) -> ParseError {
        ParseError::UnexpectedCharacter {
            found,
            offset: self.pos,
        }
    }

    /// `name=value` or a bare value.
    fn result_or_value(&mut self) -> Result<GdbMi, ParseError> {
        self.skip_spaces();
        match self.peek() {
            None => Err(self.end_error()),
            Some('{' | '[' | '"') => self.value(String::new()),
            Some(_) => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '=' || c == ',' || c == '}' || c == ']' {
                        break;
                    }
                    self.bump();
                }
                let word = self.input[start..self.pos].trim().to_string();
                if self.eat('=') {
                    self.skip_spaces();
                    self.value(word)
                } else {
                    // bare scalar
                    Ok(GdbMi::constant("", word))
                }
            }
        }
    }

    fn value(&mut self, name: String) -> Result<GdbMi, ParseError> {
        match self.peek() {
            None => Err(self.end_error()),
            Some('{') => {
                self.bump();
                let children = self.children('}')?;
                Ok(GdbMi::tuple(name, children))
            }
            Some('[') => {
                self.bump();
                let children = self.children(']')?;
                Ok(GdbMi::list(name, children))
            }
            Some('"') => {
                self.bump();
                let data = self.c_string()?;
                Ok(GdbMi::constant(name, data))
            }
            Some(_) => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == ',' || c == '}' || c == ']' {
                        break;
                    }
                    self.bump();
                }
                Ok(GdbMi::constant(name, self.input[start..self.pos].trim()))
            }
        }
    }

    fn children(&mut self, close: char) -> Result<Vec<GdbMi>, ParseError> {
        let mut children = Vec::new();
        loop {
            self.skip_spaces();
            while self.eat(',') {
                self.skip_spaces();
            }
            match self.peek() {
                None => return Err(self.end_error()),
                Some(c) if c == close => {
                    self.bump();
                    return Ok(children);
                }
                Some(_) => children.push(self.result_or_value()?),
            }
            self.skip_spaces();
            match self.peek() {
                Some(',') => {}
                Some(c) if c == close => {}
                Some(c) => return Err(self.unexpected(c)),
                None => return Err(self.end_error()),
            }
        }
    }

    /// Body of a C string after the opening quote.
    fn c_string(&mut self) -> Result<String, ParseError> {
        let mut out = String::new();
        loop {
            let c = self.bump().ok_or_else(|| self.end_error())?;
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let escaped = self.bump().ok_or_else(|| self.end_error())?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'a' => out.push('\u{7}'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        'v' => out.push('\u{b}'),
                        '0'..='7' => {
                            let mut value = escaped.to_digit(8).unwrap_or(0);
                            for _ in 0..2 {
                                match self.peek().and_then(|d| d.to_digit(8)) {
                                    Some(d) => {
                                        value = value * 8 + d;
                                        self.bump();
                                    }
                                    None => break,
                                }
                            }
                            out.push(char::from_u32(value).unwrap_or('?'));
                        }
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stop_reason() {
        let mi = GdbMi::parse(
            r#"{reason="breakpoint",breakpointId="100100",threadId="3",stack=[frame={level="0",address="0x7ff6a1032410"},{}]}"#,
        )
        .unwrap();
        assert_eq!(mi.kind(), Kind::Tuple);
        assert_eq!(mi["reason"].data(), "breakpoint");
        assert_eq!(mi["breakpointId"].to_int(), Some(100100));
        let stack = &mi["stack"];
        assert_eq!(stack.kind(), Kind::List);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.children()[0]["address"].to_address(), Some(0x7ff6a1032410));
        assert!(stack.children()[1].is_empty());
    }

    #[test]
    fn absent_fields_are_invalid_not_zero() {
        let mi = GdbMi::parse(r#"{address="0x0"}"#).unwrap();
        assert_eq!(mi["address"].to_address(), Some(0));
        assert!(!mi["line"].is_valid());
        assert_eq!(mi["line"].to_int(), None);
        assert_eq!(mi.str_of("line"), None);
    }

    #[test]
    fn escapes_are_decoded() {
        let mi = GdbMi::parse(r#"msg="line\none \"quoted\" C:\\dir""#).unwrap();
        assert_eq!(mi.name(), "msg");
        assert_eq!(mi.data(), "line\none \"quoted\" C:\\dir");
    }

    #[test]
    fn top_level_results_become_tuple() {
        let mi = GdbMi::parse(r#"a="1",b=["x","y"]"#).unwrap();
        assert_eq!(mi.kind(), Kind::Tuple);
        assert_eq!(mi["a"].to_int(), Some(1));
        assert_eq!(mi["b"].len(), 2);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(GdbMi::parse(r#"{reason="breakpoint""#).is_err());
        assert!(GdbMi::parse("").is_err());
        assert!(GdbMi::parse(r#"{a="1"} junk"#).is_err());
    }

    #[test]
    fn display_round_trips() {
        let text = r#"{name="eax",value="0x1",list=[{a="b\"c"}]}"#;
        let mi = GdbMi::parse(text).unwrap();
        assert_eq!(GdbMi::parse(&mi.to_string()).unwrap(), mi);
    }

    #[test]
    fn address_formats() {
        assert_eq!(parse_address("00000000`77490000"), Some(0x77490000));
        assert_eq!(parse_address("0x10"), Some(16));
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_int("-1"), Some(-1));
        assert_eq!(parse_int("0x1f"), Some(31));
    }
}
