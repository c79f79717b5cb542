//! Definition bookkeeping.
//!
//! ```text
//!   by_context: ctx_id ──► def_id ─┐
//!                                  ▼
//!   by_id:                def_id ──► entry
//!   own:      ctx_id ──► def_id        (contexts this side exposed remotely)
//!   proxies:  (origin peer, origin id, owner) ──► def_id
//! ```
//!
//! Every name in `by_context` points at a live `by_id` entry. Anonymous
//! entries exist only in `by_id`.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use super::{DefId, Definition, Reference};
use crate::error::{NetronError, NetronResult};

/// Entries that carry a definition.
pub trait Defined {
    /// The definition describing this entry.
    fn definition(&self) -> &Definition;
}

impl Defined for Definition {
    fn definition(&self) -> &Definition {
        self
    }
}

type ProxyKey = (Uuid, DefId, Uuid);

/// Registry of definitions keyed by id and by context name.
#[derive(Debug)]
pub struct DefinitionRegistry<E> {
    by_id: HashMap<DefId, E>,
    by_context: HashMap<String, DefId>,
    own: HashMap<String, DefId>,
    proxies: HashMap<ProxyKey, DefId>,
}

impl<E: Defined> DefinitionRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_context: HashMap::new(),
            own: HashMap::new(),
            proxies: HashMap::new(),
        }
    }

    /// Register a named entry, rejecting an existing name with
    /// `ContextExists`.
    pub fn register_local(&mut self, ctx_id: &str, entry: E) -> NetronResult<DefId> {
        if self.by_context.contains_key(ctx_id) {
            return Err(NetronError::ContextExists(ctx_id.to_string()));
        }
        Ok(self.insert_named(ctx_id, entry))
    }

    /// Register a named entry, replacing whatever the name pointed at.
    pub fn redefine(&mut self, ctx_id: &str, entry: E) -> DefId {
        if let Some(previous) = self.by_context.remove(ctx_id) {
            self.by_id.remove(&previous);
        }
        self.insert_named(ctx_id, entry)
    }

    fn insert_named(&mut self, ctx_id: &str, entry: E) -> DefId {
        let def_id = entry.definition().id;
        self.by_id.insert(def_id, entry);
        self.by_context.insert(ctx_id.to_string(), def_id);
        def_id
    }

    /// Register an anonymous entry, reachable only by id.
    pub fn register_weak(&mut self, entry: E) -> DefId {
        let def_id = entry.definition().id;
        self.by_id.insert(def_id, entry);
        def_id
    }

    /// Look up an entry by context name.
    pub fn lookup_by_context(&self, ctx_id: &str) -> NetronResult<&E> {
        self.by_context
            .get(ctx_id)
            .and_then(|def_id| self.by_id.get(def_id))
            .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string()))
    }

    /// Look up an entry by definition id.
    pub fn lookup_by_id(&self, def_id: DefId) -> NetronResult<&E> {
        self.by_id
            .get(&def_id)
            .ok_or(NetronError::UnknownDefinition(def_id))
    }

    /// First entry matching `predicate`, in id order.
    pub fn find(&self, predicate: impl Fn(&E) -> bool) -> Option<&E> {
        let mut ids: Vec<&DefId> = self.by_id.keys().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|entry| predicate(entry))
    }

    /// Ids of the anonymous entries matching `predicate`, sorted.
    pub fn anonymous_matching(&self, predicate: impl Fn(&E) -> bool) -> Vec<DefId> {
        let mut ids: Vec<DefId> = self
            .by_id
            .iter()
            .filter(|(id, entry)| !self.is_named(**id) && predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Check whether some context name points at `def_id`.
    pub fn is_named(&self, def_id: DefId) -> bool {
        self.by_context.values().any(|id| *id == def_id)
    }

    /// Check whether a context name is registered.
    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.by_context.contains_key(ctx_id)
    }

    /// Remove a named entry from both maps.
    pub fn detach(&mut self, ctx_id: &str) -> NetronResult<E> {
        let def_id = self
            .by_context
            .remove(ctx_id)
            .ok_or_else(|| NetronError::UnknownContext(ctx_id.to_string()))?;
        self.by_id
            .remove(&def_id)
            .ok_or(NetronError::UnknownDefinition(def_id))
    }

    /// Remove an entry by id along with any name pointing at it.
    pub fn remove_by_id(&mut self, def_id: DefId) -> Option<E> {
        let entry = self.by_id.remove(&def_id)?;
        self.by_context.retain(|_, id| *id != def_id);
        self.proxies.retain(|_, id| *id != def_id);
        Some(entry)
    }

    /// Named entries as `(ctx_id, definition)` pairs, sorted by name.
    pub fn contexts(&self) -> Vec<(String, Definition)> {
        let mut contexts: Vec<(String, Definition)> = self
            .by_context
            .iter()
            .filter_map(|(ctx_id, def_id)| {
                self.by_id
                    .get(def_id)
                    .map(|entry| (ctx_id.clone(), entry.definition().clone()))
            })
            .collect();
        contexts.sort_by(|a, b| a.0.cmp(&b.0));
        contexts
    }

    /// Context names, sorted.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_context.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries reachable by id.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check whether the registry holds no entry.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Record a context this side exposed on the remote side.
    pub fn expose_own(&mut self, ctx_id: &str, def_id: DefId) -> NetronResult<()> {
        if self.own.contains_key(ctx_id) {
            return Err(NetronError::ContextExists(ctx_id.to_string()));
        }
        self.own.insert(ctx_id.to_string(), def_id);
        Ok(())
    }

    /// Definition id of a context this side exposed remotely.
    pub fn own(&self, ctx_id: &str) -> Option<DefId> {
        self.own.get(ctx_id).copied()
    }

    /// Forget a context this side exposed remotely.
    pub fn withdraw_own(&mut self, ctx_id: &str) -> Option<DefId> {
        self.own.remove(ctx_id)
    }

    /// Ids of every entry whose `parent_id` chain leads to `def_id`.
    ///
    /// Proxies are skipped: their `parent_id` names a definition in the
    /// origin peer's id space, not an entry of this registry.
    pub fn children_of(&self, def_id: DefId) -> Vec<DefId> {
        let proxies: BTreeSet<DefId> = self.proxies.values().copied().collect();
        let mut found = BTreeSet::new();
        let mut frontier = vec![def_id];
        while let Some(parent) = frontier.pop() {
            for (id, entry) in &self.by_id {
                if proxies.contains(id) {
                    continue;
                }
                if entry.definition().parent_id == Some(parent) && found.insert(*id) {
                    frontier.push(*id);
                }
            }
        }
        found.into_iter().collect()
    }

    /// Remove an entry and everything derived from it.
    pub fn remove_tree(&mut self, def_id: DefId) -> Vec<E> {
        let mut doomed = self.children_of(def_id);
        doomed.push(def_id);
        doomed
            .into_iter()
            .filter_map(|id| self.remove_by_id(id))
            .collect()
    }

    /// Existing proxy wrapping `origin_id` from `origin_peer` for `owner`.
    pub fn proxy_for(&self, origin_peer: Uuid, origin_id: DefId, owner: Uuid) -> Option<&E> {
        self.proxies
            .get(&(origin_peer, origin_id, owner))
            .and_then(|id| self.by_id.get(id))
    }

    /// Wrap a definition received from `origin_peer` into a proxy entry
    /// exposed to `owner` under `new_id`.
    ///
    /// An existing proxy for the same origin and owner is reused; `wrap` is
    /// only called when a new entry is minted.
    pub fn create_proxy(
        &mut self,
        origin: &Definition,
        origin_peer: Uuid,
        owner: Uuid,
        new_id: DefId,
        wrap: impl FnOnce(Definition) -> E,
    ) -> Reference {
        if let Some(existing) = self.proxy_for(origin_peer, origin.id, owner) {
            return Reference::Remote {
                origin: origin.clone(),
                proxy: existing.definition().clone(),
            };
        }

        let proxy = origin.proxy(new_id, owner);
        self.proxies.insert((origin_peer, origin.id, owner), new_id);
        self.register_weak(wrap(proxy.clone()));
        Reference::Remote {
            origin: origin.clone(),
            proxy,
        }
    }

    /// Remove every entry minted for `peer` and every proxy whose origin is
    /// `peer`, with their descendants.
    pub fn release_peer(&mut self, peer: Uuid) -> Vec<E> {
        let mut roots: BTreeSet<DefId> = self
            .by_id
            .iter()
            .filter(|(_, entry)| entry.definition().owner == Some(peer))
            .map(|(id, _)| *id)
            .collect();
        roots.extend(
            self.proxies
                .iter()
                .filter(|((origin_peer, _, _), _)| *origin_peer == peer)
                .map(|(_, id)| *id),
        );

        roots
            .into_iter()
            .flat_map(|id| self.remove_tree(id))
            .collect()
    }
}

impl<E: Defined> Default for DefinitionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
