//! Filtered search over the registry.
//!
//! An `all` query scans one snapshot of the canonical set and applies the
//! exception sets. Otherwise one task is spawned per populated inclusion list;
//! each looks values up in its own index and the partial results are merged
//! as the tasks finish. Union is commutative, so completion order does not
//! affect the answer. Every exception set is applied to the merged result,
//! so an exception on one dimension also removes clients found through
//! another.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::client::{ClientId, Dimension};
use crate::filter::{FindClientsFilter, PreparedFilter};
use crate::index::ClientMap;
use crate::registry::ClientRegistry;

impl ClientRegistry {
    /// Clients matching `filter`, keyed by connection id. Never fails; a
    /// filter with nothing to match yields an empty map.
    pub async fn find(self: &Arc<Self>, filter: FindClientsFilter) -> ClientMap {
        let filter = Arc::new(filter.prepare().await);

        if filter.is_all() {
            return self.scan_with_exceptions(&filter);
        }
        if filter.is_degenerate() {
            return ClientMap::new();
        }

        let mut searches = JoinSet::new();
        if !filter.connections().is_empty() {
            let registry = Arc::clone(self);
            let filter = Arc::clone(&filter);
            searches.spawn(async move { registry.search_connections(&filter) });
        }
        for dimension in Dimension::TEXT {
            if filter.inclusions(dimension).is_empty() {
                continue;
            }
            let registry = Arc::clone(self);
            let filter = Arc::clone(&filter);
            searches.spawn(async move { registry.search_dimension(&filter, dimension) });
        }

        let mut found = ClientMap::new();
        while let Some(result) = searches.join_next().await {
            match result {
                Ok(local) => {
                    for (id, client) in local {
                        found.entry(id).or_insert(client);
                    }
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(error = %e, "client sub-search did not complete"),
            }
        }

        // sub-searches only skip their own dimension's exceptions
        found.retain(|_, client| !filter.excludes(client));

        trace!(matched = found.len(), "client search finished");
        found
    }

    fn scan_with_exceptions(&self, filter: &PreparedFilter) -> ClientMap {
        self.list()
            .into_iter()
            .filter(|(_, client)| !filter.excludes(client))
            .collect()
    }

    fn search_connections(&self, filter: &PreparedFilter) -> ClientMap {
        let except = filter.except_connections();
        let mut local = ClientMap::new();
        for id in filter.connections() {
            if !id.is_valid() || except.contains_id(*id) {
                continue;
            }
            if let Some(client) = self.get_by_id(*id) {
                local.entry(*id).or_insert(client);
            }
        }
        local
    }

    fn search_dimension(&self, filter: &PreparedFilter, dimension: Dimension) -> ClientMap {
        let except = filter.exceptions(dimension);
        let mut local = ClientMap::new();
        for value in filter.inclusions(dimension) {
            if value.is_empty() || except.is_some_and(|set| set.contains_str(value)) {
                continue;
            }
            for (id, client) in self.lookup(dimension, value) {
                local.entry(id).or_insert(client);
            }
        }
        local
    }
}

/// Ids in a search result, sorted; handy for assertions and status output.
pub fn sorted_ids(found: &ClientMap) -> Vec<ClientId> {
    let mut ids: Vec<ClientId> = found.keys().copied().collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    fn ids(values: &[u64]) -> Vec<ClientId> {
        values.iter().copied().map(ClientId::new).collect()
    }

    fn registry_with(clients: Vec<Client>) -> Arc<ClientRegistry> {
        let registry = Arc::new(ClientRegistry::new());
        for client in clients {
            registry.register(Arc::new(client));
        }
        registry
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn users_minus_excepted_ip() {
        let registry = registry_with(vec![
            Client::builder(1).user("u1").ip("1.1.1.1").build(),
            Client::builder(2).user("u1").ip("2.2.2.2").build(),
            Client::builder(3).user("u2").ip("1.1.1.1").build(),
        ]);

        let filter = FindClientsFilter {
            users: vec!["u1".into()],
            except_ip_addresses: vec!["2.2.2.2".into()],
            ..FindClientsFilter::default()
        };
        let found = registry.find(filter).await;

        assert_eq!(sorted_ids(&found), ids(&[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connection_inclusion_honours_user_exception() {
        let registry = registry_with(vec![
            Client::builder(1).user("u1").build(),
            Client::builder(2).user("u2").build(),
            Client::builder(3).build(),
        ]);

        let filter = FindClientsFilter {
            connections: ids(&[1, 2, 3]),
            except_users: vec!["u2".into()],
            ..FindClientsFilter::default()
        };

        assert_eq!(sorted_ids(&registry.find(filter).await), ids(&[1, 3]));
    }

    #[tokio::test]
    async fn path_inclusion_honours_connection_exception() {
        let registry = registry_with(vec![
            Client::builder(1).path("/a").build(),
            Client::builder(2).path("/a").build(),
        ]);

        let filter = FindClientsFilter {
            request_paths: vec!["/a".into()],
            except_connections: ids(&[2]),
            ..FindClientsFilter::default()
        };

        assert_eq!(sorted_ids(&registry.find(filter).await), ids(&[1]));
    }

    #[tokio::test]
    async fn exception_only_skips_its_own_dimension_value() {
        let registry = registry_with(vec![
            Client::builder(1).user("u1").build(),
            Client::builder(2).user("u2").build(),
        ]);

        let filter = FindClientsFilter {
            users: vec!["u1".into(), "u2".into()],
            except_users: vec!["u2".into()],
            ..FindClientsFilter::default()
        };

        assert_eq!(sorted_ids(&registry.find(filter).await), ids(&[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn union_across_dimensions_collapses_duplicates() {
        let registry = registry_with(vec![
            Client::builder(1).user("u1").device("d1").path("/a").build(),
            Client::builder(2).user("u2").device("d1").path("/b").build(),
            Client::builder(3).user("u3").device("d3").path("/a").build(),
            Client::builder(4).user("u4").device("d4").path("/z").build(),
        ]);

        let filter = FindClientsFilter {
            users: vec!["u1".into()],
            devices: vec!["d1".into()],
            request_paths: vec!["/a".into()],
            connections: ids(&[1, 2]),
            ..FindClientsFilter::default()
        };
        let found = registry.find(filter).await;

        assert_eq!(found.len(), 3);
        assert_eq!(sorted_ids(&found), ids(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn all_with_exceptions_returns_complement() {
        let registry = registry_with(
            (1..=20u64)
                .map(|id| {
                    Client::builder(id)
                        .user(format!("u{}", id % 4))
                        .ip(format!("10.0.0.{}", id % 5))
                        .build()
                })
                .collect(),
        );

        let filter = FindClientsFilter {
            except_users: vec!["u0".into()],
            except_ip_addresses: vec!["10.0.0.1".into()],
            except_connections: ids(&[2]),
            ..FindClientsFilter::everyone()
        };
        let found = registry.find(filter).await;

        let expected: Vec<ClientId> = (1..=20u64)
            .filter(|id| id % 4 != 0 && id % 5 != 1 && *id != 2)
            .map(ClientId::new)
            .collect();
        assert_eq!(sorted_ids(&found), expected);
    }

    #[tokio::test]
    async fn degenerate_and_empty_value_filters_match_nothing() {
        let registry = registry_with(vec![Client::builder(1).user("u1").build()]);

        assert!(registry.find(FindClientsFilter::default()).await.is_empty());

        let blanks = FindClientsFilter {
            users: vec![String::new()],
            connections: vec![ClientId::new(0)],
            ..FindClientsFilter::default()
        };
        assert!(registry.find(blanks).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_values_are_ignored() {
        let registry = registry_with(vec![Client::builder(1).ip("1.1.1.1").build()]);

        let filter = FindClientsFilter {
            ip_addresses: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            connections: ids(&[99]),
            ..FindClientsFilter::default()
        };
        assert_eq!(sorted_ids(&registry.find(filter).await), ids(&[1]));
    }
}
