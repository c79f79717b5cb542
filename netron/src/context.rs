//! Local objects exposed to peers.
//!
//! A [`Context`] is implemented by application objects. The runtime wraps
//! each exposed object in a [`Stub`], which checks incoming accesses against
//! the object's definition before dispatching them.

use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;

use crate::definition::{Defined, Definition, Member};
use crate::error::{NetronError, NetronResult};
use crate::interface::Interface;
use crate::value::Value;

/// An object that can be exposed to remote peers.
///
/// Only the members listed by [`members`](Context::members) are reachable.
/// Unimplemented accessors fail with `NotImplemented`.
#[async_trait(?Send)]
pub trait Context {
    /// Type name announced in the definition.
    fn name(&self) -> &str;

    /// Members exposed to peers.
    fn members(&self) -> Vec<(String, Member)>;

    /// Invoke a method.
    async fn call(&self, _method: &str, _args: Vec<Value>) -> NetronResult<Value> {
        Err(NetronError::NotImplemented("call"))
    }

    /// Read a property.
    async fn get(&self, _property: &str) -> NetronResult<Value> {
        Err(NetronError::NotImplemented("get"))
    }

    /// Write a property.
    async fn set(&self, _property: &str, _value: Value) -> NetronResult<()> {
        Err(NetronError::NotImplemented("set"))
    }
}

/// What a stub dispatches to.
#[derive(Clone)]
pub enum StubTarget {
    /// An object living in this process.
    Local(Rc<dyn Context>),
    /// An object living on another peer, reached through its interface.
    Proxy(Interface),
}

/// Exposed object together with its definition.
#[derive(Clone)]
pub struct Stub {
    definition: Definition,
    target: StubTarget,
}

impl Stub {
    /// Expose a local context.
    pub fn local(definition: Definition, context: Rc<dyn Context>) -> Self {
        Self {
            definition,
            target: StubTarget::Local(context),
        }
    }

    /// Re-expose a remote object under a proxy definition.
    pub fn proxy(definition: Definition, interface: Interface) -> Self {
        Self {
            definition,
            target: StubTarget::Proxy(interface),
        }
    }

    /// What this stub dispatches to.
    pub fn target(&self) -> &StubTarget {
        &self.target
    }

    /// Check whether this stub exposes exactly `context`.
    pub fn exposes(&self, context: &Rc<dyn Context>) -> bool {
        matches!(&self.target, StubTarget::Local(local) if Rc::ptr_eq(local, context))
    }

    /// Serve a GET: invoke a method with `arg` as its arguments, or read a
    /// property falling back to `arg` when the value is null.
    pub async fn get(&self, name: &str, arg: Value) -> NetronResult<Value> {
        match self.definition.member(name)? {
            Member::Method => match &self.target {
                StubTarget::Local(context) => context.call(name, arg.into_args()).await,
                StubTarget::Proxy(interface) => interface.call(name, arg.into_args()).await,
            },
            Member::Property { .. } => match &self.target {
                StubTarget::Local(context) => {
                    let value = context.get(name).await?;
                    Ok(if value.is_null() { arg } else { value })
                }
                StubTarget::Proxy(interface) => interface.get_or(name, arg).await,
            },
        }
    }

    /// Serve a SET: invoke a method discarding its result, or write a
    /// property.
    pub async fn set(&self, name: &str, value: Value) -> NetronResult<()> {
        match self.definition.check_writable(name)? {
            Member::Method => match &self.target {
                StubTarget::Local(context) => {
                    context.call(name, value.into_args()).await.map(|_| ())
                }
                StubTarget::Proxy(interface) => interface.call_void(name, value.into_args()).await,
            },
            Member::Property { .. } => match &self.target {
                StubTarget::Local(context) => context.set(name, value).await,
                StubTarget::Proxy(interface) => interface.set(name, value).await,
            },
        }
    }
}

impl Defined for Stub {
    fn definition(&self) -> &Definition {
        &self.definition
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            StubTarget::Local(_) => "local",
            StubTarget::Proxy(_) => "proxy",
        };
        f.debug_struct("Stub")
            .field("definition", &self.definition)
            .field("target", &target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct Counter {
        value: RefCell<i64>,
    }

    #[async_trait(?Send)]
    impl Context for Counter {
        fn name(&self) -> &str {
            "Counter"
        }

        fn members(&self) -> Vec<(String, Member)> {
            vec![
                ("add".to_string(), Member::Method),
                ("value".to_string(), Member::Property { readonly: true }),
                ("note".to_string(), Member::Property { readonly: false }),
            ]
        }

        async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
            match method {
                "add" => {
                    let delta: i64 = args.iter().filter_map(Value::as_i64).sum();
                    *self.value.borrow_mut() += delta;
                    Ok(Value::Int(*self.value.borrow()))
                }
                _ => Err(NetronError::NotImplemented("call")),
            }
        }

        async fn get(&self, property: &str) -> NetronResult<Value> {
            match property {
                "value" => Ok(Value::Int(*self.value.borrow())),
                _ => Ok(Value::Null),
            }
        }
    }

    fn stub() -> Stub {
        let context: Rc<dyn Context> = Rc::new(Counter {
            value: RefCell::new(0),
        });
        let definition = Definition::describe(1, context.as_ref());
        Stub::local(definition, context)
    }

    #[tokio::test]
    async fn test_get_on_method_invokes_it() {
        let stub = stub();
        let result = stub
            .get("add", Value::List(vec![Value::Int(2), Value::Int(3)]))
            .await
            .expect("call");
        assert_eq!(result, Value::Int(5));
    }

    #[tokio::test]
    async fn test_get_property_falls_back_to_default() {
        let stub = stub();
        let note = stub
            .get("note", Value::from("fallback"))
            .await
            .expect("get");
        assert_eq!(note, Value::from("fallback"));
    }

    #[tokio::test]
    async fn test_set_readonly_property_is_rejected() {
        let stub = stub();
        let result = stub.set("value", Value::Int(1)).await;
        assert!(matches!(result, Err(NetronError::InvalidAccess(_))));
    }

    #[tokio::test]
    async fn test_set_on_method_invokes_it() {
        let stub = stub();
        stub.set("add", Value::Int(4)).await.expect("call void");
        assert_eq!(stub.get("value", Value::Null).await, Ok(Value::Int(4)));
    }

    #[tokio::test]
    async fn test_unimplemented_setter() {
        let stub = stub();
        let result = stub.set("note", Value::from("x")).await;
        assert_eq!(result, Err(NetronError::NotImplemented("set")));
    }
}
