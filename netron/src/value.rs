//! Values exchanged through get, set and call.
//!
//! Plain data crosses the wire as is. Object references travel as a
//! [`Value::Definition`] (the receiver gets a new handle) or a
//! [`Value::Reference`] (the receiver already owns the object). The
//! [`Value::Context`] and [`Value::Interface`] variants only exist in memory
//! and are substituted before a value is written.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::definition::{DefId, Definition};
use crate::error::RemoteError;
use crate::interface::Interface;

/// Dynamically typed value.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Object exposed by the sender.
    Definition(Definition),
    /// Object owned by the receiver, addressed by its definition id.
    Reference(DefId),
    /// Failure carried as data.
    Error(RemoteError),
    /// Local object to be exposed when the value is sent.
    #[serde(skip)]
    Context(Rc<dyn Context>),
    /// Handle to an object living on a peer.
    #[serde(skip)]
    Interface(Interface),
}

impl Value {
    /// Check whether the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer content, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Float content, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Boolean content, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// String content, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Interface handle, if any.
    pub fn as_interface(&self) -> Option<&Interface> {
        match self {
            Value::Interface(interface) => Some(interface),
            _ => None,
        }
    }

    /// Consume the value into an interface handle, if it is one.
    pub fn into_interface(self) -> Option<Interface> {
        match self {
            Value::Interface(interface) => Some(interface),
            _ => None,
        }
    }

    /// Spread the value into call arguments: lists are spread, null is no
    /// argument, anything else is a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Value::List(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Definition(a), Value::Definition(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Context(a), Value::Context(b)) => Rc::ptr_eq(a, b),
            (Value::Interface(a), Value::Interface(b)) => a.same_object(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value})"),
            Value::String(value) => write!(f, "String({value:?})"),
            Value::Bytes(value) => write!(f, "Bytes({} bytes)", value.len()),
            Value::List(values) => f.debug_tuple("List").field(values).finish(),
            Value::Map(values) => f.debug_tuple("Map").field(values).finish(),
            Value::Definition(definition) => {
                write!(f, "Definition({} #{})", definition.name, definition.id)
            }
            Value::Reference(def_id) => write!(f, "Reference(#{def_id})"),
            Value::Error(error) => write!(f, "Error({error})"),
            Value::Context(context) => write!(f, "Context({})", context.name()),
            Value::Interface(interface) => write!(f, "{interface:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::List(values)
    }
}

impl From<Rc<dyn Context>> for Value {
    fn from(context: Rc<dyn Context>) -> Self {
        Value::Context(context)
    }
}

impl From<Interface> for Value {
    fn from(interface: Interface) -> Self {
        Value::Interface(interface)
    }
}
