//! Process-wide named server instances.
//!
//! Independent of any server's lifecycle: registering does not start a
//! server and stopping one leaves its entry in place.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::server::Server;

static INSTANCES: Lazy<DashMap<String, Server>> = Lazy::new(DashMap::new);

/// Stores `server` under `name`, returning the instance it replaced.
pub fn register(name: impl Into<String>, server: Server) -> Option<Server> {
    let name = name.into();
    debug!(instance = %name, "registering server instance");
    INSTANCES.insert(name, server)
}

pub fn get(name: &str) -> Result<Server> {
    INSTANCES
        .get(name)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| ServerError::UnknownInstance(name.to_string()))
}

pub fn remove(name: &str) -> Option<Server> {
    INSTANCES.remove(name).map(|(_, server)| server)
}

pub fn names() -> Vec<String> {
    let mut names: Vec<String> = INSTANCES.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn register_get_remove() {
        let server = Server::new(ServerConfig {
            name: "instances-test-a".into(),
            ..ServerConfig::default()
        })
        .unwrap();

        assert!(register("instances-test-a", server).is_none());
        assert_eq!(get("instances-test-a").unwrap().name(), "instances-test-a");
        assert!(names().contains(&"instances-test-a".to_string()));

        assert!(remove("instances-test-a").is_some());
        assert!(remove("instances-test-a").is_none());
    }

    #[test]
    fn unknown_name_is_an_error() {
        match get("instances-test-missing") {
            Err(ServerError::UnknownInstance(name)) => assert_eq!(name, "instances-test-missing"),
            other => panic!("expected UnknownInstance, got {:?}", other.map(|s| s.name().to_string())),
        }
    }
}
