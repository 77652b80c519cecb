use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::client::{Client, ClientId, Dimension};
use crate::index::{ClientMap, ClientsIndex};

/// Canonical set of live clients plus its reverse indices.
///
/// The registry is the only writer of the indices. Register and unregister
/// hold the canonical write lock for their whole duration, so mutations are
/// serialized against each other while index readers only ever wait on the
/// single index they query.
pub struct ClientRegistry {
    clients: RwLock<ClientMap>,
    index: ClientsIndex,
    indexing: bool,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_indexing(true)
    }

    /// With indexing disabled only the canonical set is maintained and the
    /// per-dimension lookups always come back empty.
    pub fn with_indexing(indexing: bool) -> Self {
        Self {
            clients: RwLock::new(ClientMap::new()),
            index: ClientsIndex::default(),
            indexing,
        }
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing
    }

    pub fn register(&self, client: Arc<Client>) {
        let id = client.id();
        let mut clients = self.clients.write();
        let previous = clients.insert(id, Arc::clone(&client));
        if self.indexing {
            if let Some(previous) = &previous {
                self.index.remove(previous);
            }
            self.index.insert(&client);
        }
        drop(clients);

        debug!(connection_id = %id, user_id = client.user_id(), "client registered");
    }

    /// Returns `false` when the client was not registered.
    pub fn unregister(&self, client: &Client) -> bool {
        self.unregister_id(client.id()).is_some()
    }

    pub fn unregister_id(&self, id: ClientId) -> Option<Arc<Client>> {
        let mut clients = self.clients.write();
        let removed = clients.remove(&id)?;
        if self.indexing {
            self.index.remove(&removed);
        }
        drop(clients);

        debug!(connection_id = %id, "client unregistered");
        Some(removed)
    }

    pub fn get_by_id(&self, id: ClientId) -> Option<Arc<Client>> {
        if self.indexing {
            self.index.connections().get(id)
        } else {
            self.clients.read().get(&id).cloned()
        }
    }

    pub fn get_by_user(&self, user_id: &str) -> ClientMap {
        self.lookup(Dimension::User, user_id)
    }

    pub fn get_by_device(&self, device_id: &str) -> ClientMap {
        self.lookup(Dimension::Device, device_id)
    }

    pub fn get_by_auth_token(&self, token: &str) -> ClientMap {
        self.lookup(Dimension::AuthToken, token)
    }

    pub fn get_by_ip(&self, ip: &str) -> ClientMap {
        self.lookup(Dimension::IpAddress, ip)
    }

    pub fn get_by_request_path(&self, path: &str) -> ClientMap {
        self.lookup(Dimension::RequestPath, path)
    }

    /// Clients holding `value` on a text dimension. Only that dimension's
    /// lock is taken.
    pub(crate) fn lookup(&self, dimension: Dimension, value: &str) -> ClientMap {
        if !self.indexing || value.is_empty() {
            return ClientMap::new();
        }
        self.index
            .text(dimension)
            .map(|index| index.get(value))
            .unwrap_or_default()
    }

    /// Copy of the canonical set, taken under one read lock.
    pub fn list(&self) -> ClientMap {
        self.clients.read().clone()
    }

    pub fn list_by_connection_id(&self) -> BTreeMap<ClientId, Arc<Client>> {
        self.clients
            .read()
            .iter()
            .map(|(id, client)| (*id, Arc::clone(client)))
            .collect()
    }

    pub fn list_chunked(&self, chunks: usize) -> Vec<ClientMap> {
        chunk_clients(&self.list(), chunks)
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    /// Read-only view of the reverse indices.
    pub fn index(&self) -> &ClientsIndex {
        &self.index
    }
}

/// Splits `clients` into `chunks` maps of at most `ceil(len / chunks)`
/// entries each, filled in iteration order. Trailing chunks may be empty.
/// A chunk count of zero is treated as one.
pub fn chunk_clients(clients: &ClientMap, chunks: usize) -> Vec<ClientMap> {
    let chunks = chunks.max(1);
    let per_chunk = clients.len().div_ceil(chunks).max(1);

    let mut out: Vec<ClientMap> = (0..chunks).map(|_| ClientMap::new()).collect();
    for (position, (id, client)) in clients.iter().enumerate() {
        out[position / per_chunk].insert(*id, Arc::clone(client));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn client(id: u64, user: &str, ip: &str) -> Arc<Client> {
        Arc::new(Client::builder(id).user(user).ip(ip).build())
    }

    #[test]
    fn register_then_lookup_each_dimension() {
        let registry = ClientRegistry::new();
        let c = Arc::new(
            Client::builder(1)
                .user("u1")
                .device("d1")
                .token("t1")
                .ip("1.1.1.1")
                .path("/events")
                .build(),
        );
        registry.register(Arc::clone(&c));

        assert_eq!(registry.count(), 1);
        assert!(registry.get_by_id(ClientId::new(1)).is_some());
        assert_eq!(registry.get_by_user("u1").len(), 1);
        assert_eq!(registry.get_by_device("d1").len(), 1);
        assert_eq!(registry.get_by_auth_token("t1").len(), 1);
        assert_eq!(registry.get_by_ip("1.1.1.1").len(), 1);
        assert_eq!(registry.get_by_request_path("/events").len(), 1);
        assert!(registry.get_by_user("u2").is_empty());
        assert!(registry.get_by_user("").is_empty());
    }

    #[test]
    fn unregister_is_noop_when_absent() {
        let registry = ClientRegistry::new();
        let c = client(1, "u1", "1.1.1.1");

        assert!(!registry.unregister(&c));
        registry.register(Arc::clone(&c));
        assert!(registry.unregister(&c));
        assert!(!registry.unregister(&c));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn register_unregister_round_trip_restores_indices() {
        let registry = ClientRegistry::new();
        registry.register(client(1, "u1", "1.1.1.1"));
        registry.register(client(2, "u2", "1.1.1.1"));

        let before: Vec<_> = Dimension::TEXT
            .iter()
            .map(|d| registry.index().text(*d).map(|i| i.snapshot()))
            .collect();
        let ids_before = registry.index().connections().ids();

        let transient = client(3, "u1", "9.9.9.9");
        registry.register(Arc::clone(&transient));
        registry.unregister(&transient);

        let after: Vec<_> = Dimension::TEXT
            .iter()
            .map(|d| registry.index().text(*d).map(|i| i.snapshot()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(ids_before, registry.index().connections().ids());
    }

    #[test]
    fn list_is_a_detached_copy() {
        let registry = ClientRegistry::new();
        registry.register(client(1, "u1", "1.1.1.1"));

        let snapshot = registry.list();
        registry.register(client(2, "u2", "2.2.2.2"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
        let ordered: Vec<u64> = registry
            .list_by_connection_id()
            .keys()
            .map(|id| id.as_u64())
            .collect();
        assert_eq!(ordered, vec![1, 2]);
    }

    #[test]
    fn disabled_indexing_keeps_canonical_set_only() {
        let registry = ClientRegistry::with_indexing(false);
        registry.register(client(1, "u1", "1.1.1.1"));

        assert_eq!(registry.count(), 1);
        assert!(registry.get_by_id(ClientId::new(1)).is_some());
        assert!(registry.get_by_user("u1").is_empty());
        assert!(registry.index().connections().is_empty());
    }

    #[test]
    fn chunking_partitions_without_loss() {
        let n = 4;
        for size in [0usize, 1, n, n + 1, 1000] {
            let registry = ClientRegistry::new();
            for id in 1..=size as u64 {
                registry.register(client(id, "u", "ip"));
            }

            let chunks = registry.list_chunked(n);
            assert_eq!(chunks.len(), n);
            assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), size);

            let mut seen = HashSet::new();
            for chunk in &chunks {
                for id in chunk.keys() {
                    assert!(seen.insert(*id), "client {id} in two chunks");
                }
            }
            assert_eq!(seen.len(), size);
        }
    }

    #[test]
    fn zero_chunks_is_one_chunk() {
        let registry = ClientRegistry::new();
        registry.register(client(1, "u1", "1.1.1.1"));

        let chunks = registry.list_chunked(0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }
}
