//! Implicit conversion of host values into expression nodes.

use std::fmt;
use std::rc::Rc;

use crate::builder::ScriptBuilder;
use crate::escape::{bigint_literal, json_literal, number_literal, property_key, string_literal};
use crate::node::{Body, Expr};
use crate::validate::{CompilerError, ERR_UNCONVERTIBLE_VALUE};

/// A callable host value. Its body is produced lazily, once, from `f`.
pub struct HostFunction {
    pub arity: usize,
    pub f: Box<dyn Fn(&ScriptBuilder, &[Expr]) -> HostValue>,
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// A value on the host side that can appear inside emitted script.
///
/// Composite and callable values are reference counted: converting the same
/// `Rc` twice through one builder yields the same node.
#[derive(Debug, Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Bytes(Vec<u8>),
    RegExp { source: String, flags: String },
    Array(Rc<Vec<HostValue>>),
    Record(Rc<Vec<(String, HostValue)>>),
    Map(Rc<Vec<(HostValue, HostValue)>>),
    Set(Rc<Vec<HostValue>>),
    Function(Rc<HostFunction>),
    Json(serde_json::Value),
    Expr(Expr),
    /// A host object with no script form, described for diagnostics.
    Opaque(String),
}

impl HostValue {
    pub fn array(items: Vec<HostValue>) -> Self {
        HostValue::Array(Rc::new(items))
    }

    pub fn record(entries: Vec<(&str, HostValue)>) -> Self {
        HostValue::Record(Rc::new(
            entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ))
    }

    pub fn function<F>(arity: usize, f: F) -> Self
    where
        F: Fn(&ScriptBuilder, &[Expr]) -> HostValue + 'static,
    {
        HostValue::Function(Rc::new(HostFunction {
            arity,
            f: Box::new(f),
        }))
    }

    /// Address of the shared allocation, for identity-keyed memoization.
    fn identity(&self) -> Option<usize> {
        match self {
            HostValue::Array(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            HostValue::Record(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            HostValue::Map(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            HostValue::Set(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            HostValue::Function(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            _ => None,
        }
    }
}

impl From<Expr> for HostValue {
    fn from(e: Expr) -> Self {
        HostValue::Expr(e)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Number(n as f64)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(v: serde_json::Value) -> Self {
        HostValue::Json(v)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(HostValue::Undefined, Into::into)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(items: Vec<T>) -> Self {
        HostValue::array(items.into_iter().map(Into::into).collect())
    }
}

impl ScriptBuilder {
    /// Converts a host value into a node.
    pub fn value(&self, value: impl Into<HostValue>) -> Result<Expr, CompilerError> {
        let value = value.into();
        let Some(key) = value.identity() else {
            return self.convert(&value);
        };
        if let Some((_, e)) = self.memo.borrow().get(&key) {
            return Ok(*e);
        }
        let e = self.convert(&value)?;
        // The memo owns a clone so the allocation, and with it the key, stays live.
        self.memo.borrow_mut().insert(key, (value, e));
        Ok(e)
    }

    /// Shorthand for a number, string or boolean literal.
    pub fn literal(&self, value: impl Into<HostValue>) -> Result<Expr, CompilerError> {
        self.value(value)
    }

    /// A function whose body is a host callable's converted return value.
    pub fn host_function<F>(&self, arity: usize, f: F) -> Expr
    where
        F: Fn(&ScriptBuilder, &[Expr]) -> HostValue + 'static,
    {
        let func = Rc::new(HostFunction {
            arity,
            f: Box::new(f),
        });
        self.function_from_host(func)
    }

    fn function_from_host(&self, func: Rc<HostFunction>) -> Expr {
        let arity = func.arity;
        self.try_function(arity, move |cx, args| {
            let result = (func.f)(cx, args);
            Ok(Body::Expr(cx.value(result)?))
        })
    }

    fn convert(&self, value: &HostValue) -> Result<Expr, CompilerError> {
        let e = match value {
            HostValue::Undefined => self.literal_text("void 0".to_string()),
            HostValue::Null => self.literal_text("null".to_string()),
            HostValue::Bool(b) => self.literal_text(b.to_string()),
            HostValue::Number(n) => self.literal_text(number_literal(*n)),
            HostValue::BigInt(n) => self.literal_text(bigint_literal(*n)),
            HostValue::String(s) => self.literal_text(string_literal(s)),
            HostValue::Date(ms) => self.literal_text(format!("new Date({})", number_literal(*ms))),
            HostValue::Bytes(bytes) => {
                let items: Vec<String> = bytes.iter().map(u8::to_string).collect();
                self.literal_text(format!("new Uint8Array([{}])", items.join(",")))
            }
            HostValue::RegExp { source, flags } => self.literal_text(format!(
                "new RegExp({},{})",
                string_literal(source),
                string_literal(flags)
            )),
            HostValue::Array(items) => {
                let mut builder = self.js().text("[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        builder = builder.text(",");
                    }
                    builder = builder.expr(self.value(item.clone())?);
                }
                builder.text("]").build()
            }
            HostValue::Record(entries) => {
                let mut builder = self.js().text("{");
                for (i, (key, item)) in entries.iter().enumerate() {
                    let sep = if i > 0 { "," } else { "" };
                    builder = builder
                        .text(format!("{}{}:", sep, property_key(key)))
                        .expr(self.value(item.clone())?);
                }
                builder.text("}").build()
            }
            HostValue::Map(entries) => {
                let mut builder = self.js().text("new Map([");
                for (i, (key, item)) in entries.iter().enumerate() {
                    let sep = if i > 0 { ",[" } else { "[" };
                    builder = builder
                        .text(sep)
                        .expr(self.value(key.clone())?)
                        .text(",")
                        .expr(self.value(item.clone())?)
                        .text("]");
                }
                builder.text("])").build()
            }
            HostValue::Set(items) => {
                let mut builder = self.js().text("new Set([");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        builder = builder.text(",");
                    }
                    builder = builder.expr(self.value(item.clone())?);
                }
                builder.text("])").build()
            }
            HostValue::Function(func) => self.function_from_host(func.clone()),
            HostValue::Json(json) => match json {
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    self.raw(json_literal(json))
                }
                scalar => self.literal_text(json_literal(scalar)),
            },
            HostValue::Expr(e) => *e,
            HostValue::Opaque(description) => {
                return Err(CompilerError::with_details(
                    ERR_UNCONVERTIBLE_VALUE,
                    &format!("Cannot convert host value '{}' into script.", description),
                    None,
                    vec![
                        "Wrap the value in a node with ScriptBuilder::raw or pass a serializable value."
                            .to_string(),
                    ],
                ))
            }
        };
        Ok(e)
    }
}
