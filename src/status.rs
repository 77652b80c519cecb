//! Read-only snapshots for status reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

use crate::client::{Client, ClientId};
use crate::lifecycle::LifecycleState;
use crate::server::Server;

#[derive(Debug, Clone, Serialize)]
pub struct BoundAddress {
    pub scheme: &'static str,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub description: String,
    pub state: LifecycleState,
    pub listening_addresses: Vec<String>,
    pub listening_addresses_tls: Vec<String>,
    pub bound: Vec<BoundAddress>,
    pub current_connection_id: u64,
    pub clients: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientDetails {
    pub id: ClientId,
    pub ip_address: String,
    pub remote_ip: String,
    pub request_path: String,
    pub user_id: String,
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub connected_seconds: u64,
}

impl From<&Client> for ClientDetails {
    fn from(client: &Client) -> Self {
        Self {
            id: client.id(),
            ip_address: client.ip_address().to_string(),
            remote_ip: client.remote_ip().to_string(),
            request_path: client.request_path().to_string(),
            user_id: client.user_id().to_string(),
            device_id: client.device_id().to_string(),
            connected_at: client.connected_at(),
            connected_seconds: client.connected_for().as_secs(),
        }
    }
}

impl Server {
    pub fn status(&self) -> ServerStatus {
        let config = self.config();
        ServerStatus {
            name: config.name.clone(),
            description: config.description.clone(),
            state: self.state(),
            listening_addresses: if config.enable_plain {
                config.listening_addresses.clone()
            } else {
                Vec::new()
            },
            listening_addresses_tls: if config.enable_tls {
                config.listening_addresses_tls.clone()
            } else {
                Vec::new()
            },
            bound: self
                .bound_addresses()
                .into_iter()
                .map(|(transport, address)| BoundAddress {
                    scheme: transport.scheme(),
                    address,
                })
                .collect(),
            current_connection_id: self.current_connection_id(),
            clients: self.clients().count(),
            started_at: self.started_at(),
            stopped_at: self.stopped_at(),
        }
    }

    /// One entry per live client, ordered by connection id.
    pub fn clients_status(&self) -> Vec<ClientDetails> {
        self.clients()
            .list_by_connection_id()
            .values()
            .map(|client| ClientDetails::from(client.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::sync::Arc;

    #[test]
    fn status_of_idle_server() {
        let server = Server::new(ServerConfig {
            name: "edge".into(),
            description: "edge node".into(),
            ..ServerConfig::default()
        })
        .unwrap();

        let status = server.status();
        assert_eq!(status.name, "edge");
        assert_eq!(status.state, LifecycleState::NotStarted);
        assert_eq!(status.listening_addresses, vec!["127.0.0.1:8080"]);
        assert!(status.listening_addresses_tls.is_empty());
        assert!(status.bound.is_empty());
        assert_eq!(status.clients, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "not_started");
    }

    #[test]
    fn clients_status_is_ordered_by_id() {
        let server = Server::new(ServerConfig::default()).unwrap();
        for id in [7, 2, 5] {
            server
                .clients()
                .register(Arc::new(Client::builder(id).user("u").ip("10.0.0.1").build()));
        }

        let ids: Vec<u64> = server
            .clients_status()
            .iter()
            .map(|c| c.id.as_u64())
            .collect();
        assert_eq!(ids, vec![2, 5, 7]);
        assert_eq!(server.clients_status()[0].ip_address, "10.0.0.1");
    }
}
