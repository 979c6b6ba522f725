//! Live peer table keyed by connection, indexed by logical name
//!
//! The table enforces that a logical name maps to at most one live
//! connection. It is owned by one server task; other tasks read it through
//! the server's query methods.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::DuplicateNamePolicy;
use crate::errors::{PeerwireError, ProtocolError, Result};
use crate::types::{ConnectionId, PeerIdentity, TransportAddress};

// ----------------------------------------------------------------------------
// Peer Entry
// ----------------------------------------------------------------------------

/// One registered connection and the handle used to reach it
#[derive(Debug, Clone)]
pub struct PeerEntry<H> {
    pub id: ConnectionId,
    pub identity: PeerIdentity,
    pub handle: H,
}

/// Result of applying an identification
#[derive(Debug)]
pub enum Identification<H> {
    /// The connection now carries the name
    Named { identity: PeerIdentity },
    /// The name moved from `evicted` to this connection
    Replaced {
        identity: PeerIdentity,
        evicted: PeerEntry<H>,
    },
}

// ----------------------------------------------------------------------------
// Peer Table
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct PeerTable<H> {
    entries: HashMap<ConnectionId, PeerEntry<H>>,
    names: HashMap<String, ConnectionId>,
    policy: DuplicateNamePolicy,
}

impl<H: Clone> PeerTable<H> {
    pub fn new(policy: DuplicateNamePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            names: HashMap::new(),
            policy,
        }
    }

    /// Register an accepted link before it has identified
    pub fn insert_unnamed(
        &mut self,
        id: ConnectionId,
        address: TransportAddress,
        handle: H,
    ) -> PeerIdentity {
        let identity = PeerIdentity::unnamed(address);
        self.entries.insert(
            id,
            PeerEntry {
                id,
                identity: identity.clone(),
                handle,
            },
        );
        identity
    }

    /// Register a link whose name is already known (e.g. from advertising)
    pub fn insert_named(
        &mut self,
        id: ConnectionId,
        address: TransportAddress,
        name: &str,
        handle: H,
    ) -> Result<Identification<H>> {
        self.insert_unnamed(id, address, handle);
        match self.identify(id, name) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.entries.remove(&id);
                Err(e)
            }
        }
    }

    /// Attach `name` to connection `id` according to the duplicate-name policy
    pub fn identify(&mut self, id: ConnectionId, name: &str) -> Result<Identification<H>> {
        if name.is_empty() {
            return Err(PeerwireError::config_error("logical name must not be empty"));
        }
        if !self.entries.contains_key(&id) {
            return Err(PeerwireError::peer_not_found(id.to_string()));
        }

        let mut evicted = None;
        match self.names.get(name).copied() {
            Some(holder) if holder == id => {
                let identity = self.entries[&id].identity.clone();
                return Ok(Identification::Named { identity });
            }
            Some(holder) => match self.policy {
                DuplicateNamePolicy::RejectNew => {
                    warn!("Rejecting {} identifying as {:?}: name held by {}", id, name, holder);
                    return Err(ProtocolError::DuplicateName {
                        name: name.to_string(),
                    }
                    .into());
                }
                DuplicateNamePolicy::ReplaceExisting => {
                    debug!("{} takes name {:?} from {}", id, name, holder);
                    self.names.remove(name);
                    evicted = self.entries.remove(&holder);
                }
            },
            None => {}
        }

        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| PeerwireError::peer_not_found(id.to_string()))?;
        if entry.identity.is_identified() {
            self.names.remove(&entry.identity.logical_name);
        }
        entry.identity.logical_name = name.to_string();
        let identity = entry.identity.clone();
        self.names.insert(name.to_string(), id);

        Ok(match evicted {
            Some(evicted) => Identification::Replaced { identity, evicted },
            None => Identification::Named { identity },
        })
    }

    /// Remove a connection and release its name
    pub fn remove(&mut self, id: ConnectionId) -> Option<PeerEntry<H>> {
        let entry = self.entries.remove(&id)?;
        if entry.identity.is_identified()
            && self.names.get(&entry.identity.logical_name) == Some(&id)
        {
            self.names.remove(&entry.identity.logical_name);
        }
        Some(entry)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&PeerEntry<H>> {
        self.entries.get(&id)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<PeerIdentity> {
        self.entries.get(&id).map(|e| e.identity.clone())
    }

    pub fn by_name(&self, name: &str) -> Option<&PeerEntry<H>> {
        self.names.get(name).and_then(|id| self.entries.get(id))
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Entries for the given names, in order; unknown names are skipped
    pub fn by_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<PeerEntry<H>> {
        names
            .iter()
            .filter_map(|n| self.by_name(n.as_ref()).cloned())
            .collect()
    }

    /// Resolve `names` for a send; an empty list means every live entry
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Vec<(String, Option<PeerEntry<H>>)> {
        if names.is_empty() {
            let mut all: Vec<_> = self
                .entries
                .values()
                .map(|e| (e.identity.logical_name.clone(), Some(e.clone())))
                .collect();
            all.sort_by_key(|(_, e)| e.as_ref().map(|e| e.id));
            return all;
        }
        names
            .iter()
            .map(|n| (n.as_ref().to_string(), self.by_name(n.as_ref()).cloned()))
            .collect()
    }

    pub fn entries(&self) -> Vec<PeerEntry<H>> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.id);
        all
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<PeerEntry<H>> {
        self.names.clear();
        let mut all: Vec<_> = self.entries.drain().map(|(_, e)| e).collect();
        all.sort_by_key(|e| e.id);
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.names.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> TransportAddress {
        TransportAddress::Socket(([127, 0, 0, 1], port).into())
    }

    #[test]
    fn unnamed_then_identified() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let id = ConnectionId::next();
        let identity = table.insert_unnamed(id, addr(1), "handle");
        assert!(!identity.is_identified());
        assert!(!table.has_name("peerA"));

        let outcome = table.identify(id, "peerA").unwrap();
        assert!(matches!(outcome, Identification::Named { .. }));
        assert!(table.has_name("peerA"));
        assert_eq!(table.by_name("peerA").unwrap().id, id);
    }

    #[test]
    fn reject_new_keeps_first() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        table.insert_unnamed(first, addr(1), 1);
        table.insert_unnamed(second, addr(2), 2);
        table.identify(first, "peerA").unwrap();

        let err = table.identify(second, "peerA").unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(table.by_name("peerA").unwrap().id, first);
        assert!(!table.get(second).unwrap().identity.is_identified());
    }

    #[test]
    fn replace_existing_evicts_first() {
        let mut table = PeerTable::new(DuplicateNamePolicy::ReplaceExisting);
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        table.insert_unnamed(first, addr(1), 1);
        table.insert_unnamed(second, addr(2), 2);
        table.identify(first, "peerA").unwrap();

        match table.identify(second, "peerA").unwrap() {
            Identification::Replaced { evicted, .. } => assert_eq!(evicted.id, first),
            other => panic!("expected replacement, got {:?}", other),
        }
        assert!(table.get(first).is_none());
        assert_eq!(table.by_name("peerA").unwrap().id, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reidentify_same_name_is_noop() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let id = ConnectionId::next();
        table.insert_unnamed(id, addr(1), ());
        table.identify(id, "peerA").unwrap();
        assert!(table.identify(id, "peerA").is_ok());
        assert_eq!(table.names(), vec!["peerA".to_string()]);
    }

    #[test]
    fn rename_releases_old_name() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let id = ConnectionId::next();
        table.insert_unnamed(id, addr(1), ());
        table.identify(id, "old").unwrap();
        table.identify(id, "new").unwrap();
        assert!(!table.has_name("old"));
        assert!(table.has_name("new"));
    }

    #[test]
    fn remove_releases_name() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let id = ConnectionId::next();
        table.insert_unnamed(id, addr(1), ());
        table.identify(id, "peerA").unwrap();
        assert!(table.remove(id).is_some());
        assert!(!table.has_name("peerA"));
        assert!(table.is_empty());
    }

    #[test]
    fn resolve_marks_unknown_names() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        table.insert_unnamed(a, addr(1), 'a');
        table.insert_unnamed(b, addr(2), 'b');
        table.identify(a, "peerA").unwrap();

        let resolved = table.resolve(&["peerA", "ghost"]);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].1.as_ref().unwrap().handle, 'a');
        assert!(resolved[1].1.is_none());

        let everyone = table.resolve::<&str>(&[]);
        assert_eq!(everyone.len(), 2);
        assert_eq!(table.by_names(&["peerA"]).len(), 1);
    }

    #[test]
    fn insert_named_failure_leaves_no_entry() {
        let mut table = PeerTable::new(DuplicateNamePolicy::RejectNew);
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        table.insert_named(a, addr(1), "peerA", ()).unwrap();
        assert!(table.insert_named(b, addr(2), "peerA", ()).is_err());
        assert!(table.get(b).is_none());
        assert_eq!(table.len(), 1);
    }
}
