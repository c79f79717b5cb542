//! Object definitions and their registry.
//!
//! A [`Definition`] describes the callable surface of an object exposed by
//! one side of a session: its members, a session-unique id and, for proxies,
//! the id of the definition it wraps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{NetronError, NetronResult};

/// Registry of definitions keyed by id and by context name.
pub mod registry;

pub use registry::{Defined, DefinitionRegistry};

/// Definition identifier.
pub type DefId = u64;

/// A member of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Member {
    /// Invocable method.
    Method,
    /// Readable property, writable unless `readonly`.
    Property {
        /// Whether writes are rejected.
        readonly: bool,
    },
}

/// Capability surface of an exposed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Session-unique definition id.
    pub id: DefId,
    /// Definition this one was derived from, for proxies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DefId>,
    /// Type name of the exposed object.
    pub name: String,
    /// Members by name.
    pub members: BTreeMap<String, Member>,
    /// Uid of the peer this definition was minted for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
}

impl Definition {
    /// Create an empty definition.
    pub fn new(id: DefId, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: None,
            name: name.into(),
            members: BTreeMap::new(),
            owner: None,
        }
    }

    /// Describe a local context.
    pub fn describe(id: DefId, context: &dyn Context) -> Self {
        let mut definition = Self::new(id, context.name());
        definition.members.extend(context.members());
        definition
    }

    /// Add a method member.
    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.members.insert(name.into(), Member::Method);
        self
    }

    /// Add a property member.
    pub fn with_property(mut self, name: impl Into<String>, readonly: bool) -> Self {
        self.members
            .insert(name.into(), Member::Property { readonly });
        self
    }

    /// Set the owning peer.
    pub fn with_owner(mut self, owner: Option<Uuid>) -> Self {
        self.owner = owner;
        self
    }

    /// Look up a member, failing with `UnknownMember`.
    pub fn member(&self, name: &str) -> NetronResult<Member> {
        self.members
            .get(name)
            .copied()
            .ok_or_else(|| NetronError::UnknownMember {
                def_id: self.id,
                name: name.to_string(),
            })
    }

    /// Check that `name` can be written, failing with `UnknownMember` or
    /// `InvalidAccess`.
    pub fn check_writable(&self, name: &str) -> NetronResult<Member> {
        match self.member(name)? {
            Member::Property { readonly: true } => Err(NetronError::InvalidAccess(format!(
                "property '{}' of {} is readonly",
                name, self.name
            ))),
            member => Ok(member),
        }
    }

    /// Build the proxy definition that re-exposes `self` under a new id.
    pub fn proxy(&self, id: DefId, owner: Uuid) -> Definition {
        Definition {
            id,
            parent_id: Some(self.id),
            name: self.name.clone(),
            members: self.members.clone(),
            owner: Some(owner),
        }
    }
}

/// How a definition is exposed to a given peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// The definition already lives on the receiving side and is addressed
    /// by its own id.
    Local(Definition),
    /// The definition comes from a third peer and is re-exposed through a
    /// locally minted proxy.
    Remote {
        /// Definition as received from its origin peer.
        origin: Definition,
        /// Proxy definition handed to the receiving peer.
        proxy: Definition,
    },
}

impl Reference {
    /// Definition that goes on the wire.
    pub fn exposed(&self) -> &Definition {
        match self {
            Reference::Local(definition) => definition,
            Reference::Remote { proxy, .. } => proxy,
        }
    }

    /// Definition at the origin of the chain.
    pub fn origin(&self) -> &Definition {
        match self {
            Reference::Local(definition) => definition,
            Reference::Remote { origin, .. } => origin,
        }
    }
}

/// Decide how `origin`, received from `origin_peer`, is exposed to
/// `target_peer`.
///
/// Handing a definition back to the peer it came from needs no proxy. Any
/// other hop wraps it in a proxy with id `proxy_id`.
pub fn resolve_reference(
    origin: &Definition,
    origin_peer: Uuid,
    target_peer: Uuid,
    proxy_id: DefId,
) -> Reference {
    if origin_peer == target_peer {
        Reference::Local(origin.clone())
    } else {
        Reference::Remote {
            origin: origin.clone(),
            proxy: origin.proxy(proxy_id, target_peer),
        }
    }
}
