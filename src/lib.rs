//! Switchyard: an HTTP server core that tracks every in-flight request as a
//! client, indexes clients by identity and network attributes, and answers
//! filtered searches over them while serving.

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod filter;
pub mod handler;
pub mod hooks;
pub mod index;
pub mod instances;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod search;
pub mod server;
pub mod status;

pub use client::{
    AuthDetails, AuthTokenDetails, Client, ClientBuilder, ClientId, ConnDetails, DeviceDetails,
    Dimension, UserDetails,
};
pub use config::{LoggingSettings, ServerConfig};
pub use error::{Result, ServerError};
pub use filter::{ExceptSet, FindClientsFilter, PreparedFilter};
pub use handler::{Anonymous, Authenticator, Handler, HttpResponse, PingHandler, text_response};
pub use hooks::LifecyclePhase;
pub use index::ClientMap;
pub use lifecycle::LifecycleState;
pub use listener::Transport;
pub use registry::{ClientRegistry, chunk_clients};
pub use server::Server;
pub use status::{ClientDetails, ServerStatus};
