//! Substitution of in-memory objects before a value is written.
//!
//! ```text
//! Value::Context(ctx)          ──► Definition of an attached stub, or of a
//!                                  new stub minted for the target peer
//! Value::Interface(on target)  ──► Reference(def_id)
//! Value::Interface(elsewhere)  ──► Definition of a proxy stub forwarding
//!                                  to the origin peer
//! ```
//!
//! The walk collects new stubs first and registers them only once the whole
//! value was substituted, so a failing walk leaves the registry untouched.

use std::rc::Rc;

use uuid::Uuid;

use crate::context::Context;
use crate::definition::{resolve_reference, DefId, Definition, Reference};
use crate::error::{NetronError, NetronResult};
use crate::interface::Interface;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::value::Value;

/// Stub to register once a walk succeeded.
pub(crate) enum PendingStub {
    Context {
        definition: Definition,
        context: Rc<dyn Context>,
    },
    Proxy {
        origin: Definition,
        origin_peer: Uuid,
        owner: Uuid,
        proxy: Definition,
        interface: Interface,
    },
}

impl PendingStub {
    fn exposing(&self, context: &Rc<dyn Context>) -> Option<&Definition> {
        match self {
            PendingStub::Context {
                definition,
                context: pending,
            } if Rc::ptr_eq(pending, context) => Some(definition),
            _ => None,
        }
    }

    fn proxying(&self, peer: Uuid, def_id: DefId, for_owner: Uuid) -> Option<&Definition> {
        match self {
            PendingStub::Proxy {
                origin,
                origin_peer,
                owner,
                proxy,
                ..
            } if *origin_peer == peer && origin.id == def_id && *owner == for_owner => Some(proxy),
            _ => None,
        }
    }
}

/// Substitute every object in `value` for sending to `target`.
pub(crate) fn marshal(runtime: Option<&Netron>, target: &Peer, value: Value) -> NetronResult<Value> {
    let mut pending = Vec::new();
    let value = walk(runtime, target, value, &mut pending)?;
    if let Some(runtime) = runtime {
        runtime.commit(pending);
    }
    Ok(value)
}

fn no_runtime() -> NetronError {
    NetronError::IllegalState("exposing objects requires a runtime".into())
}

fn walk(
    runtime: Option<&Netron>,
    target: &Peer,
    value: Value,
    pending: &mut Vec<PendingStub>,
) -> NetronResult<Value> {
    match value {
        Value::Context(context) => {
            let runtime = runtime.ok_or_else(no_runtime)?;
            if let Some(definition) = runtime.definition_of(&context, target.uid()) {
                return Ok(Value::Definition(definition));
            }
            if let Some(definition) = pending.iter().find_map(|p| p.exposing(&context)) {
                return Ok(Value::Definition(definition.clone()));
            }

            let definition = Definition::describe(runtime.next_def_id(), context.as_ref())
                .with_owner(target.uid());
            pending.push(PendingStub::Context {
                definition: definition.clone(),
                context,
            });
            Ok(Value::Definition(definition))
        }
        Value::Interface(interface) => {
            if interface.peer().same_peer(target) {
                return Ok(Value::Reference(interface.def_id()));
            }
            let runtime = runtime.ok_or_else(no_runtime)?;
            proxy(runtime, target, interface, pending)
        }
        Value::List(values) => values
            .into_iter()
            .map(|value| walk(runtime, target, value, pending))
            .collect::<NetronResult<_>>()
            .map(Value::List),
        Value::Map(values) => values
            .into_iter()
            .map(|(key, value)| Ok((key, walk(runtime, target, value, pending)?)))
            .collect::<NetronResult<_>>()
            .map(Value::Map),
        other => Ok(other),
    }
}

fn proxy(
    runtime: &Netron,
    target: &Peer,
    interface: Interface,
    pending: &mut Vec<PendingStub>,
) -> NetronResult<Value> {
    let origin_peer = interface
        .peer()
        .uid()
        .ok_or_else(|| NetronError::IllegalState("interface peer has no session".into()))?;
    let owner = target
        .uid()
        .ok_or_else(|| NetronError::IllegalState("target peer has no session".into()))?;
    let def_id = interface.def_id();

    if let Some(proxy) = runtime.proxy_for(origin_peer, def_id, owner) {
        return Ok(Value::Definition(proxy));
    }
    if let Some(proxy) = pending
        .iter()
        .find_map(|p| p.proxying(origin_peer, def_id, owner))
    {
        return Ok(Value::Definition(proxy.clone()));
    }

    match resolve_reference(interface.definition(), origin_peer, owner, runtime.next_def_id()) {
        Reference::Local(definition) => Ok(Value::Reference(definition.id)),
        Reference::Remote { origin, proxy } => {
            pending.push(PendingStub::Proxy {
                origin,
                origin_peer,
                owner,
                proxy: proxy.clone(),
                interface,
            });
            Ok(Value::Definition(proxy))
        }
    }
}
