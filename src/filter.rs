//! Client search filters.
//!
//! A [`FindClientsFilter`] is what callers build. Before a search runs it is
//! consumed into a [`PreparedFilter`], which turns every exception list into
//! a hash set once and is immutable from then on.

use std::collections::HashSet;
use std::hash::Hash;

use crate::client::{Client, ClientId, Dimension};

/// Query over the live client set.
///
/// With `all` set every client is a candidate and only the `except_*` lists
/// apply. Otherwise the result is the union of the populated inclusion lists,
/// each minus its own exception list.
#[derive(Debug, Clone, Default)]
pub struct FindClientsFilter {
    pub all: bool,

    pub connections: Vec<ClientId>,
    pub users: Vec<String>,
    pub devices: Vec<String>,
    pub auth_tokens: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub request_paths: Vec<String>,

    pub except_connections: Vec<ClientId>,
    pub except_users: Vec<String>,
    pub except_devices: Vec<String>,
    pub except_auth_tokens: Vec<String>,
    pub except_ip_addresses: Vec<String>,
    pub except_request_paths: Vec<String>,
}

impl FindClientsFilter {
    /// Every live client, before exceptions.
    pub fn everyone() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Builds the exception sets, one task per dimension, and waits for all six.
    pub async fn prepare(self) -> PreparedFilter {
        let (
            except_connections,
            except_users,
            except_devices,
            except_auth_tokens,
            except_ip_addresses,
            except_request_paths,
        ) = tokio::join!(
            build_except_set(self.except_connections),
            build_except_set(self.except_users),
            build_except_set(self.except_devices),
            build_except_set(self.except_auth_tokens),
            build_except_set(self.except_ip_addresses),
            build_except_set(self.except_request_paths),
        );

        PreparedFilter {
            all: self.all,
            connections: self.connections,
            users: self.users,
            devices: self.devices,
            auth_tokens: self.auth_tokens,
            ip_addresses: self.ip_addresses,
            request_paths: self.request_paths,
            except_connections,
            except_users,
            except_devices,
            except_auth_tokens,
            except_ip_addresses,
            except_request_paths,
        }
    }
}

async fn build_except_set<T>(values: Vec<T>) -> ExceptSet<T>
where
    T: Eq + Hash + Send + 'static,
{
    if values.is_empty() {
        return ExceptSet::default();
    }
    match tokio::spawn(async move { ExceptSet::from_values(values) }).await {
        Ok(set) => set,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => ExceptSet::default(),
    }
}

/// O(1) membership over one exception list.
#[derive(Debug, Clone)]
pub struct ExceptSet<T> {
    enabled: bool,
    values: HashSet<T>,
}

impl<T> Default for ExceptSet<T> {
    fn default() -> Self {
        Self {
            enabled: false,
            values: HashSet::new(),
        }
    }
}

impl<T: Eq + Hash> ExceptSet<T> {
    pub fn from_values(values: Vec<T>) -> Self {
        Self {
            enabled: !values.is_empty(),
            values: values.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<T: Eq + Hash + std::borrow::Borrow<str>> ExceptSet<T> {
    pub fn contains_str(&self, value: &str) -> bool {
        self.enabled && self.values.contains(value)
    }
}

impl ExceptSet<ClientId> {
    pub fn contains_id(&self, id: ClientId) -> bool {
        self.enabled && self.values.contains(&id)
    }
}

/// A normalized filter. Fields are private so the derived sets cannot change
/// after preparation.
#[derive(Debug, Clone)]
pub struct PreparedFilter {
    all: bool,

    connections: Vec<ClientId>,
    users: Vec<String>,
    devices: Vec<String>,
    auth_tokens: Vec<String>,
    ip_addresses: Vec<String>,
    request_paths: Vec<String>,

    except_connections: ExceptSet<ClientId>,
    except_users: ExceptSet<String>,
    except_devices: ExceptSet<String>,
    except_auth_tokens: ExceptSet<String>,
    except_ip_addresses: ExceptSet<String>,
    except_request_paths: ExceptSet<String>,
}

impl PreparedFilter {
    pub fn is_all(&self) -> bool {
        self.all
    }

    pub fn connections(&self) -> &[ClientId] {
        &self.connections
    }

    pub fn except_connections(&self) -> &ExceptSet<ClientId> {
        &self.except_connections
    }

    /// Inclusion list for a text dimension; empty for `Dimension::Connection`.
    pub fn inclusions(&self, dimension: Dimension) -> &[String] {
        match dimension {
            Dimension::Connection => &[],
            Dimension::User => &self.users,
            Dimension::Device => &self.devices,
            Dimension::AuthToken => &self.auth_tokens,
            Dimension::IpAddress => &self.ip_addresses,
            Dimension::RequestPath => &self.request_paths,
        }
    }

    /// Exception set for a text dimension. `Dimension::Connection` has its
    /// own typed accessor and yields `None` here.
    pub fn exceptions(&self, dimension: Dimension) -> Option<&ExceptSet<String>> {
        match dimension {
            Dimension::Connection => None,
            Dimension::User => Some(&self.except_users),
            Dimension::Device => Some(&self.except_devices),
            Dimension::AuthToken => Some(&self.except_auth_tokens),
            Dimension::IpAddress => Some(&self.except_ip_addresses),
            Dimension::RequestPath => Some(&self.except_request_paths),
        }
    }

    /// True when any exception list matches the client's attributes.
    pub fn excludes(&self, client: &Client) -> bool {
        if self.except_connections.contains_id(client.id()) {
            return true;
        }
        Dimension::TEXT.iter().any(|dimension| {
            self.exceptions(*dimension)
                .is_some_and(|set| set.contains_str(client.attribute(*dimension)))
        })
    }

    /// Neither `all` nor any inclusion list is populated.
    pub fn is_degenerate(&self) -> bool {
        !self.all
            && self.connections.is_empty()
            && Dimension::TEXT
                .iter()
                .all(|dimension| self.inclusions(*dimension).is_empty())
    }
}
