//! Text syntax for selectors.
//!
//! ```text
//! selector := <field> selector | <index> selector
//!           | "$" selector | "$$" selector
//!           | "?" selector
//!           | "[" (selector ","?)* "]"
//!           | "{" ((<field> | "*") selector ","?)* "}"
//!           | <empty>
//! spacing  := [.\s]+
//! ```
//!
//! Each `?` takes the next [`SelectArg`]: a filter query or a predicate
//! narrows the current set, a field or index stands for itself, and a
//! selector is spliced in whole and ends the chain.

use super::{Predicate, Selector};
use crate::error::{Result, TetherError};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Argument bound to a `?` placeholder
#[derive(Debug, Clone)]
pub enum SelectArg {
    Field(String),
    Index(usize),
    Filter(Value),
    Predicate(Predicate),
    Selector(Selector),
}

impl From<&str> for SelectArg {
    fn from(field: &str) -> Self {
        SelectArg::Field(field.to_string())
    }
}

impl From<String> for SelectArg {
    fn from(field: String) -> Self {
        SelectArg::Field(field)
    }
}

impl From<usize> for SelectArg {
    fn from(index: usize) -> Self {
        SelectArg::Index(index)
    }
}

impl From<Value> for SelectArg {
    fn from(query: Value) -> Self {
        SelectArg::Filter(query)
    }
}

impl From<Predicate> for SelectArg {
    fn from(predicate: Predicate) -> Self {
        SelectArg::Predicate(predicate)
    }
}

impl From<Selector> for SelectArg {
    fn from(selector: Selector) -> Self {
        SelectArg::Selector(selector)
    }
}

/// Parse a selector expression, binding `args` to its `?` placeholders in order.
pub fn parse_selector(input: &str, args: Vec<SelectArg>) -> Result<Selector> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
        args: args.into_iter(),
    };
    let selector = parser.chain()?;
    parser.skip_spacing();
    if let Some(c) = parser.peek() {
        return Err(parser.error(format!("Unexpected '{c}'")));
    }
    if parser.args.len() > 0 {
        return Err(parser.error(format!(
            "{} unused argument(s) for '?' placeholders",
            parser.args.len()
        )));
    }
    Ok(selector)
}

impl FromStr for Selector {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        parse_selector(s, Vec::new())
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    args: std::vec::IntoIter<SelectArg>,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, message: String) -> TetherError {
        TetherError::Syntax {
            position: self.pos,
            message,
        }
    }

    fn skip_spacing(&mut self) {
        while matches!(self.peek(), Some(c) if c == '.' || c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn chain(&mut self) -> Result<Selector> {
        self.skip_spacing();
        let Some(c) = self.peek() else {
            return Ok(Selector::Identity);
        };
        match c {
            ']' | '}' | ',' => Ok(Selector::Identity),
            '$' => {
                self.pos += 1;
                if self.peek() == Some('$') {
                    self.pos += 1;
                    Ok(Selector::flat_map(self.chain()?))
                } else {
                    Ok(Selector::map(self.chain()?))
                }
            }
            '?' => {
                self.pos += 1;
                match self.next_arg()? {
                    SelectArg::Field(name) => Ok(Selector::field(name, self.chain()?)),
                    SelectArg::Index(index) => Ok(Selector::index(index, self.chain()?)),
                    SelectArg::Filter(query) => Ok(Selector::filter(query, self.chain()?)),
                    SelectArg::Predicate(predicate) => {
                        Ok(Selector::predicate(predicate, self.chain()?))
                    }
                    SelectArg::Selector(selector) => {
                        self.expect_end("a selector argument")?;
                        Ok(selector)
                    }
                }
            }
            '[' => {
                self.pos += 1;
                let tuple = self.tuple()?;
                self.expect_end("a tuple")?;
                Ok(tuple)
            }
            '{' => {
                self.pos += 1;
                let object = self.object()?;
                self.expect_end("an object")?;
                Ok(object)
            }
            c if is_name_char(c) => {
                let name = self.name();
                let next = self.chain()?;
                Ok(match name.parse::<usize>() {
                    Ok(index) => Selector::index(index, next),
                    Err(_) => Selector::field(name, next),
                })
            }
            c => Err(self.error(format!("Unexpected '{c}'"))),
        }
    }

    fn tuple(&mut self) -> Result<Selector> {
        let mut items = Vec::new();
        loop {
            self.skip_spacing();
            match self.peek() {
                None => return Err(self.error("Unclosed '['".into())),
                Some(']') => {
                    self.pos += 1;
                    return Ok(Selector::Tuple(items));
                }
                Some('}') => return Err(self.error("Unexpected '}' in tuple".into())),
                _ => {}
            }
            items.push(self.chain()?);
            self.skip_spacing();
            if self.peek() == Some(',') {
                self.pos += 1;
            }
        }
    }

    fn object(&mut self) -> Result<Selector> {
        let mut fields = Vec::new();
        let mut wildcard = None;
        loop {
            self.skip_spacing();
            match self.peek() {
                None => return Err(self.error("Unclosed '{'".into())),
                Some('}') => {
                    self.pos += 1;
                    return Ok(Selector::Object { fields, wildcard });
                }
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                Some('*') => {
                    if wildcard.is_some() {
                        return Err(self.error("Only one '*' allowed per object".into()));
                    }
                    self.pos += 1;
                    wildcard = Some(Box::new(self.chain()?));
                }
                Some('?') => {
                    self.pos += 1;
                    let name = match self.next_arg()? {
                        SelectArg::Field(name) => name,
                        _ => {
                            return Err(
                                self.error("Object keys can only be bound to field names".into())
                            );
                        }
                    };
                    fields.push((name, self.chain()?));
                }
                Some(c) if is_name_char(c) => {
                    let name = self.name();
                    fields.push((name, self.chain()?));
                }
                Some(c) => return Err(self.error(format!("Unexpected '{c}' in object"))),
            }
            self.skip_spacing();
            if self.peek() == Some(',') {
                self.pos += 1;
            }
        }
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_name_char(c)) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn next_arg(&mut self) -> Result<SelectArg> {
        self.args
            .next()
            .ok_or_else(|| self.error("Missing argument for '?' placeholder".into()))
    }

    /// Tuples, objects and spliced selectors end a chain
    fn expect_end(&mut self, what: &str) -> Result<()> {
        self.skip_spacing();
        match self.peek() {
            None | Some(']') | Some('}') | Some(',') => Ok(()),
            Some(c) => Err(self.error(format!("Unexpected '{c}' after {what}"))),
        }
    }
}

fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '.' | '[' | ']' | '{' | '}' | ',' | '$' | '?' | '*')
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn then(f: &mut fmt::Formatter<'_>, next: &Selector) -> fmt::Result {
            match next {
                Selector::Identity => Ok(()),
                next => write!(f, ".{next}"),
            }
        }
        match self {
            Selector::Identity => Ok(()),
            Selector::Field(name, next) => {
                f.write_str(name)?;
                then(f, next)
            }
            Selector::Index(index, next) => {
                write!(f, "{index}")?;
                then(f, next)
            }
            Selector::Map(next) => {
                f.write_str("$")?;
                then(f, next)
            }
            Selector::FlatMap(next) => {
                f.write_str("$$")?;
                then(f, next)
            }
            Selector::Filter(_, next) | Selector::Predicate(_, next) => {
                f.write_str("?")?;
                then(f, next)
            }
            Selector::Tuple(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Selector::Object { fields, wildcard } => {
                f.write_str("{")?;
                let entries = fields
                    .iter()
                    .map(|(name, sub)| (name.as_str(), sub))
                    .chain(wildcard.as_deref().map(|sub| ("*", sub)));
                for (i, (name, sub)) in entries.enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(name)?;
                    if !matches!(sub, Selector::Identity) {
                        write!(f, " {sub}")?;
                    }
                }
                f.write_str("}")
            }
        }
    }
}
