use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Server-assigned connection identifier. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes by which live clients are indexed and filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Connection,
    User,
    Device,
    AuthToken,
    IpAddress,
    RequestPath,
}

impl Dimension {
    /// String-valued dimensions, in index lock order.
    pub const TEXT: [Dimension; 5] = [
        Dimension::User,
        Dimension::Device,
        Dimension::AuthToken,
        Dimension::IpAddress,
        Dimension::RequestPath,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Connection => "connection",
            Dimension::User => "user",
            Dimension::Device => "device",
            Dimension::AuthToken => "auth_token",
            Dimension::IpAddress => "ip_address",
            Dimension::RequestPath => "request_path",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the authenticated user. Resolved by the authenticator, opaque here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserDetails {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub role: Option<String>,
    /// Application-specific user record, never interpreted by the registry.
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceDetails {
    pub device_id: String,
    pub device_uuid: String,
    pub name: String,
    pub platform: String,
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthTokenDetails {
    pub token_id: String,
    pub token: String,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub extra: Option<Value>,
}

/// Everything the authenticator learned about the caller. Empty ids mean
/// the dimension is unauthenticated and will not be indexed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthDetails {
    pub user: UserDetails,
    pub device: DeviceDetails,
    pub token: AuthTokenDetails,
}

/// Per-request network metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnDetails {
    pub host: String,
    /// Client address as reported by proxies, else the peer address.
    pub client_ip: String,
    /// Address of the socket peer.
    pub remote_ip: String,
    pub client_port: u16,
    pub user_agent: String,
    pub referer: String,
    pub request_path: String,
    pub is_secure: bool,
}

/// A live request handle tracked by the registry.
///
/// Identity fields are fixed at construction; only the closed/disconnecting
/// flags and the custom data bag change afterwards.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    connected_at: DateTime<Utc>,
    connected_instant: Instant,
    closed: AtomicBool,
    disconnecting: AtomicBool,
    auth: Option<AuthDetails>,
    conn: Option<ConnDetails>,
    data: DashMap<String, Value>,
}

impl Client {
    pub fn new(id: ClientId, auth: Option<AuthDetails>, conn: Option<ConnDetails>) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            connected_instant: Instant::now(),
            closed: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            auth,
            conn,
            data: DashMap::new(),
        }
    }

    pub fn builder(id: impl Into<ClientId>) -> ClientBuilder {
        ClientBuilder {
            id: id.into(),
            auth: None,
            conn: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_instant.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` only for the caller that flipped the flag.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Returns `true` only for the caller that flipped the flag.
    pub fn mark_disconnecting(&self) -> bool {
        !self.disconnecting.swap(true, Ordering::AcqRel)
    }

    pub fn auth_details(&self) -> Option<&AuthDetails> {
        self.auth.as_ref()
    }

    pub fn conn_details(&self) -> Option<&ConnDetails> {
        self.conn.as_ref()
    }

    pub fn user_id(&self) -> &str {
        self.auth.as_ref().map_or("", |a| a.user.user_id.as_str())
    }

    pub fn device_id(&self) -> &str {
        self.auth.as_ref().map_or("", |a| a.device.device_id.as_str())
    }

    pub fn device_uuid(&self) -> &str {
        self.auth.as_ref().map_or("", |a| a.device.device_uuid.as_str())
    }

    pub fn auth_token(&self) -> &str {
        self.auth.as_ref().map_or("", |a| a.token.token.as_str())
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.auth.as_ref().and_then(|a| a.token.expires_at)
    }

    pub fn ip_address(&self) -> &str {
        self.conn.as_ref().map_or("", |c| c.client_ip.as_str())
    }

    pub fn remote_ip(&self) -> &str {
        self.conn.as_ref().map_or("", |c| c.remote_ip.as_str())
    }

    pub fn request_path(&self) -> &str {
        self.conn.as_ref().map_or("", |c| c.request_path.as_str())
    }

    /// Raw attribute for a text dimension, empty when unset.
    /// `Dimension::Connection` is numeric and always yields `""`.
    pub fn attribute(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::Connection => "",
            Dimension::User => self.user_id(),
            Dimension::Device => self.device_id(),
            Dimension::AuthToken => self.auth_token(),
            Dimension::IpAddress => self.ip_address(),
            Dimension::RequestPath => self.request_path(),
        }
    }

    /// Attribute for a text dimension if it should be indexed.
    pub fn indexed_value(&self, dimension: Dimension) -> Option<&str> {
        let value = self.attribute(dimension);
        (!value.is_empty()).then_some(value)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> &Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }
}

/// Convenience constructor used by middleware and tests.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    id: ClientId,
    auth: Option<AuthDetails>,
    conn: Option<ConnDetails>,
}

impl ClientBuilder {
    pub fn auth(mut self, auth: AuthDetails) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn conn(mut self, conn: ConnDetails) -> Self {
        self.conn = Some(conn);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.auth.get_or_insert_with(AuthDetails::default).user.user_id = user_id.into();
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.auth.get_or_insert_with(AuthDetails::default).device.device_id = device_id.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.auth.get_or_insert_with(AuthDetails::default).token.token = token.into();
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.conn.get_or_insert_with(ConnDetails::default).client_ip = ip.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.conn.get_or_insert_with(ConnDetails::default).request_path = path.into();
        self
    }

    pub fn build(self) -> Client {
        Client::new(self.id, self.auth, self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unauthenticated_dimensions_are_not_indexed() {
        let client = Client::builder(7).ip("10.0.0.1").build();

        assert_eq!(client.user_id(), "");
        assert_eq!(client.indexed_value(Dimension::User), None);
        assert_eq!(client.indexed_value(Dimension::IpAddress), Some("10.0.0.1"));
        assert_eq!(client.indexed_value(Dimension::RequestPath), None);
    }

    #[test]
    fn close_flags_flip_once() {
        let client = Client::builder(1).build();

        assert!(!client.is_closed());
        assert!(client.mark_closed());
        assert!(!client.mark_closed());
        assert!(client.is_closed());

        assert!(client.mark_disconnecting());
        assert!(!client.mark_disconnecting());
    }

    #[test]
    fn custom_data_bag() {
        let client = Client::builder(3).user("u1").build();

        client.set("room", json!("lobby")).set("score", json!(12));
        assert_eq!(client.get("room"), Some(json!("lobby")));
        assert_eq!(client.remove("score"), Some(json!(12)));
        assert_eq!(client.get("score"), None);
    }
}
