//! Reverse indices over the live client set.
//!
//! Every dimension has its own lock. Writers take them one at a time in the
//! order connections, users, devices, auth tokens, IP addresses, request paths,
//! and never hold two index locks at once.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::client::{Client, ClientId, Dimension};

pub type ClientMap = HashMap<ClientId, Arc<Client>>;

/// Connection id to client.
#[derive(Default)]
pub struct ConnectionIndex {
    clients: RwLock<ClientMap>,
}

impl ConnectionIndex {
    pub(crate) fn insert(&self, client: &Arc<Client>) {
        self.clients.write().insert(client.id(), Arc::clone(client));
    }

    pub(crate) fn remove(&self, id: ClientId) -> bool {
        self.clients.write().remove(&id).is_some()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> HashSet<ClientId> {
        self.clients.read().keys().copied().collect()
    }
}

/// Text dimension value to the clients currently holding it.
pub struct DimensionIndex {
    dimension: Dimension,
    buckets: RwLock<HashMap<String, ClientMap>>,
}

impl DimensionIndex {
    pub fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// No-op when the client has no value for this dimension.
    pub(crate) fn insert(&self, client: &Arc<Client>) -> bool {
        let Some(value) = client.indexed_value(self.dimension) else {
            return false;
        };
        self.buckets
            .write()
            .entry(value.to_owned())
            .or_default()
            .insert(client.id(), Arc::clone(client));
        true
    }

    /// Drops the bucket once its last client leaves.
    pub(crate) fn remove(&self, client: &Client) -> bool {
        let Some(value) = client.indexed_value(self.dimension) else {
            return false;
        };
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(value) else {
            return false;
        };
        let removed = bucket.remove(&client.id()).is_some();
        if bucket.is_empty() {
            buckets.remove(value);
        }
        removed
    }

    /// Copy of the clients holding `value`, empty when none.
    pub fn get(&self, value: &str) -> ClientMap {
        self.buckets.read().get(value).cloned().unwrap_or_default()
    }

    /// Number of distinct values currently indexed.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value to connection ids, for consistency checks.
    pub fn snapshot(&self) -> HashMap<String, HashSet<ClientId>> {
        self.buckets
            .read()
            .iter()
            .map(|(value, bucket)| (value.clone(), bucket.keys().copied().collect()))
            .collect()
    }
}

/// The six indices maintained by the registry.
pub struct ClientsIndex {
    connections: ConnectionIndex,
    users: DimensionIndex,
    devices: DimensionIndex,
    auth_tokens: DimensionIndex,
    ip_addresses: DimensionIndex,
    request_paths: DimensionIndex,
}

impl Default for ClientsIndex {
    fn default() -> Self {
        Self {
            connections: ConnectionIndex::default(),
            users: DimensionIndex::new(Dimension::User),
            devices: DimensionIndex::new(Dimension::Device),
            auth_tokens: DimensionIndex::new(Dimension::AuthToken),
            ip_addresses: DimensionIndex::new(Dimension::IpAddress),
            request_paths: DimensionIndex::new(Dimension::RequestPath),
        }
    }
}

impl ClientsIndex {
    pub fn connections(&self) -> &ConnectionIndex {
        &self.connections
    }

    /// Index for a text dimension; `None` for `Dimension::Connection`.
    pub fn text(&self, dimension: Dimension) -> Option<&DimensionIndex> {
        match dimension {
            Dimension::Connection => None,
            Dimension::User => Some(&self.users),
            Dimension::Device => Some(&self.devices),
            Dimension::AuthToken => Some(&self.auth_tokens),
            Dimension::IpAddress => Some(&self.ip_addresses),
            Dimension::RequestPath => Some(&self.request_paths),
        }
    }

    fn text_in_lock_order(&self) -> [&DimensionIndex; 5] {
        [
            &self.users,
            &self.devices,
            &self.auth_tokens,
            &self.ip_addresses,
            &self.request_paths,
        ]
    }

    pub(crate) fn insert(&self, client: &Arc<Client>) {
        self.connections.insert(client);
        for index in self.text_in_lock_order() {
            index.insert(client);
        }
    }

    pub(crate) fn remove(&self, client: &Client) {
        self.connections.remove(client.id());
        for index in self.text_in_lock_order() {
            index.remove(client);
        }
    }
}
