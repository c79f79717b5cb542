//! Shared contexts and helpers for the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use netron::{Context, Interface, Member, NetronError, NetronResult, Value};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Poll `condition` between scheduler turns until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Arithmetic context with a mix of members.
#[derive(Default)]
pub struct Calculator {
    precision: Cell<i64>,
    label: RefCell<String>,
}

#[async_trait(?Send)]
impl Context for Calculator {
    fn name(&self) -> &str {
        "Calculator"
    }

    fn members(&self) -> Vec<(String, Member)> {
        vec![
            ("add".to_string(), Member::Method),
            ("spawn".to_string(), Member::Method),
            ("echo".to_string(), Member::Method),
            ("fail".to_string(), Member::Method),
            ("wait".to_string(), Member::Method),
            ("precision".to_string(), Member::Property { readonly: false }),
            ("label".to_string(), Member::Property { readonly: false }),
            ("version".to_string(), Member::Property { readonly: true }),
        ]
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "add" => Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum())),
            "spawn" => {
                let child: Rc<dyn Context> = Rc::new(Calculator::default());
                Ok(Value::Context(child))
            }
            "echo" => Ok(args.into_iter().next().unwrap_or_default()),
            "fail" => Err(NetronError::NotExists("nothing to compute".to_string())),
            "wait" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            _ => Err(NetronError::NotImplemented("call")),
        }
    }

    async fn get(&self, property: &str) -> NetronResult<Value> {
        match property {
            "precision" => Ok(Value::Int(self.precision.get())),
            "version" => Ok(Value::from("1.0.0")),
            "label" => {
                let label = self.label.borrow();
                Ok(if label.is_empty() {
                    Value::Null
                } else {
                    Value::from(label.as_str())
                })
            }
            _ => Err(NetronError::NotImplemented("get")),
        }
    }

    async fn set(&self, property: &str, value: Value) -> NetronResult<()> {
        match (property, value) {
            ("precision", Value::Int(precision)) => {
                self.precision.set(precision);
                Ok(())
            }
            ("label", Value::String(label)) => {
                *self.label.borrow_mut() = label;
                Ok(())
            }
            _ => Err(NetronError::NotImplemented("set")),
        }
    }
}

/// Context counting its invocations.
#[derive(Default)]
pub struct Counter {
    value: Cell<i64>,
}

impl Counter {
    pub fn value(&self) -> i64 {
        self.value.get()
    }
}

#[async_trait(?Send)]
impl Context for Counter {
    fn name(&self) -> &str {
        "Counter"
    }

    fn members(&self) -> Vec<(String, Member)> {
        vec![
            ("increment".to_string(), Member::Method),
            ("value".to_string(), Member::Property { readonly: true }),
        ]
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "increment" => {
                self.value.set(self.value.get() + 1);
                Ok(Value::Int(self.value.get()))
            }
            _ => Err(NetronError::NotImplemented("call")),
        }
    }

    async fn get(&self, _property: &str) -> NetronResult<Value> {
        Ok(Value::Int(self.value.get()))
    }
}

/// Context handing out an object living on another peer.
#[derive(Default)]
pub struct Broker {
    target: RefCell<Option<Interface>>,
}

impl Broker {
    pub fn set_target(&self, target: Interface) {
        *self.target.borrow_mut() = Some(target);
    }
}

#[async_trait(?Send)]
impl Context for Broker {
    fn name(&self) -> &str {
        "Broker"
    }

    fn members(&self) -> Vec<(String, Member)> {
        vec![
            ("target".to_string(), Member::Method),
            ("invoke".to_string(), Member::Method),
            ("echo".to_string(), Member::Method),
        ]
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "target" => {
                let target = self.target.borrow().clone();
                target
                    .map(Value::Interface)
                    .ok_or_else(|| NetronError::NotExists("no target".to_string()))
            }
            "invoke" => {
                let callback = args
                    .into_iter()
                    .next()
                    .and_then(Value::into_interface)
                    .ok_or_else(|| NetronError::IllegalState("expected an object".to_string()))?;
                callback.call("increment", Vec::new()).await
            }
            "echo" => Ok(args.into_iter().next().unwrap_or_default()),
            _ => Err(NetronError::NotImplemented("call")),
        }
    }
}

/// Context handing the same child object to every caller.
pub struct Holder {
    child: Rc<Counter>,
}

impl Holder {
    pub fn new(child: Rc<Counter>) -> Self {
        Self { child }
    }
}

#[async_trait(?Send)]
impl Context for Holder {
    fn name(&self) -> &str {
        "Holder"
    }

    fn members(&self) -> Vec<(String, Member)> {
        vec![("child".to_string(), Member::Method)]
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "child" => {
                let child: Rc<dyn Context> = self.child.clone();
                Ok(Value::Context(child))
            }
            _ => Err(NetronError::NotImplemented("call")),
        }
    }
}
