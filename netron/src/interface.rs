//! Local handles to remote objects.

use std::fmt;
use std::rc::Rc;

use crate::definition::{DefId, Definition};
use crate::error::NetronResult;
use crate::peer::Peer;
use crate::value::Value;

/// Callable handle to an object exposed by a peer.
///
/// Cloning is cheap; every clone addresses the same remote object.
#[derive(Clone)]
pub struct Interface {
    definition: Rc<Definition>,
    peer: Peer,
}

impl Interface {
    /// Create a handle for `definition` living on `peer`.
    pub fn new(definition: Definition, peer: Peer) -> Self {
        Self {
            definition: Rc::new(definition),
            peer,
        }
    }

    /// Definition id on the remote side.
    pub fn def_id(&self) -> DefId {
        self.definition.id
    }

    /// Definition of the remote object.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Peer owning the remote object.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Check whether both handles address the same object on the same peer.
    pub fn same_object(&self, other: &Interface) -> bool {
        self.def_id() == other.def_id() && self.peer.same_peer(&other.peer)
    }

    /// Invoke a method and wait for its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.peer.call(self.def_id(), method, args).await
    }

    /// Invoke a method without waiting for the remote side.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.peer.call_void(self.def_id(), method, args).await
    }

    /// Read a property.
    pub async fn get(&self, property: &str) -> NetronResult<Value> {
        self.get_or(property, Value::Null).await
    }

    /// Read a property, receiving `default` when the remote value is null.
    pub async fn get_or(&self, property: &str, default: Value) -> NetronResult<Value> {
        self.peer.get(self.def_id(), property, default).await
    }

    /// Drop this handle's definition from its peer.
    ///
    /// See [`Peer::release_interface`].
    pub fn release(&self) -> bool {
        self.peer.release_interface(self)
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: Value) -> NetronResult<()> {
        self.peer.set(self.def_id(), property, value).await
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.definition.name)
            .field("def_id", &self.definition.id)
            .field("peer", &self.peer.uid())
            .finish()
    }
}
