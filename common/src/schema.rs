//! Remote interface schemas.
//!
//! A target object may describe the methods it offers and the shape of their
//! arguments. Inbound calls are checked against the schema before the object
//! sees them; a failed check is reported to the caller as a violation and
//! never reaches application code.

use std::collections::BTreeMap;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::RpcError,
    wire::{CapabilityMetadata, WireValue},
};

/// Constraint on a single argument or result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Any,
    Bool,
    Integer {
        min: i64,
        max: i64,
    },
    /// Integer or float.
    Number,
    ByteString {
        min_len: usize,
        max_len: Option<usize>,
    },
    Text {
        min_len: usize,
        max_len: Option<usize>,
        pattern: Option<String>,
    },
    ListOf {
        element: Box<Constraint>,
        max_len: Option<usize>,
    },
    /// Either `None` or the inner constraint.
    Optional(Box<Constraint>),
    Capability,
}

fn violation<S: Into<String>>(msg: S) -> RpcError {
    RpcError::Violation(msg.into())
}

impl Constraint {
    /// Signed 32-bit integers.
    pub fn int32() -> Self {
        Constraint::Integer {
            min: i32::MIN as i64,
            max: i32::MAX as i64,
        }
    }

    pub fn text(max_len: usize) -> Self {
        Constraint::Text {
            min_len: 0,
            max_len: Some(max_len),
            pattern: None,
        }
    }

    pub fn check(&self, value: &WireValue) -> Result<(), RpcError> {
        match (self, value) {
            (Constraint::Any, _) => Ok(()),
            (Constraint::Optional(_), WireValue::None) => Ok(()),
            (Constraint::Optional(inner), other) => inner.check(other),
            (Constraint::Bool, WireValue::Bool(_)) => Ok(()),
            (Constraint::Integer { min, max }, WireValue::Int(n)) => {
                if n < min || n > max {
                    return Err(violation(format!("number {n} out of range {min}..={max}")));
                }
                Ok(())
            }
            (Constraint::Number, WireValue::Int(_) | WireValue::Float(_)) => Ok(()),
            (Constraint::ByteString { min_len, max_len }, WireValue::Bytes(b)) => {
                check_len("bytestring", b.len(), *min_len, *max_len)
            }
            (
                Constraint::Text {
                    min_len,
                    max_len,
                    pattern,
                },
                WireValue::Text(s),
            ) => {
                check_len("string", s.len(), *min_len, *max_len)?;
                if let Some(pattern) = pattern {
                    let re = Regex::new(pattern)
                        .map_err(|e| violation(format!("invalid pattern '{pattern}': {e}")))?;
                    if !re.is_match(s) {
                        return Err(violation("regexp failed to match"));
                    }
                }
                Ok(())
            }
            (Constraint::ListOf { element, max_len }, WireValue::List(items)) => {
                check_len("list", items.len(), 0, *max_len)?;
                items.iter().try_for_each(|item| element.check(item))
            }
            (Constraint::Capability, WireValue::Capability(_)) => Ok(()),
            (expected, got) => Err(violation(format!(
                "'{}' is not {}",
                got.type_name(),
                expected.describe()
            ))),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Constraint::Any => "anything",
            Constraint::Bool => "a bool",
            Constraint::Integer { .. } => "an integer",
            Constraint::Number => "a number",
            Constraint::ByteString { .. } => "a bytestring",
            Constraint::Text { .. } => "a string",
            Constraint::ListOf { .. } => "a list",
            Constraint::Optional(_) => "optional",
            Constraint::Capability => "a capability",
        }
    }
}

fn check_len(what: &str, len: usize, min: usize, max: Option<usize>) -> Result<(), RpcError> {
    if let Some(max) = max {
        if len > max {
            return Err(violation(format!("{what} too long ({len} > {max})")));
        }
    }
    if len < min {
        return Err(violation(format!("{what} too short ({len} < {min})")));
    }
    Ok(())
}

/// A named, constrained positional argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name:       String,
    pub constraint: Constraint,
}

/// Argument and response constraints for one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSchema {
    pub args:     Vec<ArgSpec>,
    pub response: Constraint,
}

impl Default for MethodSchema {
    fn default() -> Self {
        Self {
            args:     Vec::new(),
            response: Constraint::Any,
        }
    }
}

impl MethodSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<S: Into<String>>(mut self, name: S, constraint: Constraint) -> Self {
        self.args.push(ArgSpec {
            name: name.into(),
            constraint,
        });
        self
    }

    pub fn returns(mut self, response: Constraint) -> Self {
        self.response = response;
        self
    }

    /// Checks positional arguments. Trailing optional arguments may be
    /// omitted.
    pub fn check_args(&self, args: &[WireValue]) -> Result<(), RpcError> {
        if args.len() > self.args.len() {
            return Err(violation(format!(
                "too many arguments: expected at most {}, got {}",
                self.args.len(),
                args.len()
            )));
        }
        for (i, spec) in self.args.iter().enumerate() {
            match args.get(i) {
                Some(value) => spec
                    .constraint
                    .check(value)
                    .map_err(|e| violation(format!("argument '{}': {}", spec.name, strip(e))))?,
                None if matches!(spec.constraint, Constraint::Optional(_)) => {}
                None => {
                    return Err(violation(format!("missing argument '{}'", spec.name)));
                }
            }
        }
        Ok(())
    }

    pub fn check_response(&self, value: &WireValue) -> Result<(), RpcError> {
        self.response
            .check(value)
            .map_err(|e| violation(format!("response: {}", strip(e))))
    }
}

fn strip(err: RpcError) -> String {
    match err {
        RpcError::Violation(msg) => msg,
        other => other.to_string(),
    }
}

/// The set of methods a target offers to remote callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInterface {
    pub name:    String,
    pub methods: BTreeMap<String, MethodSchema>,
}

impl RemoteInterface {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name:    name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method<S: Into<String>>(mut self, name: S, schema: MethodSchema) -> Self {
        self.methods.insert(name.into(), schema);
        self
    }

    pub fn schema(&self, method: &str) -> Result<&MethodSchema, RpcError> {
        self.methods.get(method).ok_or_else(|| {
            violation(format!(
                "{}({}) does not offer {}",
                self.name,
                self.methods.keys().cloned().collect::<Vec<_>>().join(","),
                method
            ))
        })
    }

    /// Checks an inbound call before it is delivered.
    pub fn check_call(&self, method: &str, args: &[WireValue]) -> Result<(), RpcError> {
        self.schema(method)?.check_args(args)
    }

    /// Metadata advertised to peers when a reference is granted.
    pub fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            interface: self.name.clone(),
            methods:   self.methods.keys().cloned().collect(),
        }
    }
}
