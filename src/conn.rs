//! Serving one accepted socket.
//!
//! Every request on the connection becomes a registered [`Client`] for as
//! long as the handler runs. The registration is held by a guard, so the
//! client leaves the registry even when the request future is dropped.

use anyhow::Result;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{Client, ConnDetails};
use crate::handler::HttpResponse;
use crate::registry::ClientRegistry;
use crate::server::Server;

pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Bound on the TLS handshake so a silent peer cannot pin a task.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn handle(
    server: Server,
    socket: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(socket))
                .await
                .map_err(|_| anyhow::anyhow!("tls handshake timed out"))??;
            serve(server, TokioIo::new(stream), peer, true, shutdown, grace).await
        }
        None => serve(server, TokioIo::new(socket), peer, false, shutdown, grace).await,
    }
}

async fn serve<I>(
    server: Server,
    io: I,
    peer: SocketAddr,
    is_secure: bool,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<()>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let server = server.clone();
        async move { Ok::<_, Infallible>(respond(server, request, peer, is_secure).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result?,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(grace, conn.as_mut()).await {
                Ok(result) => result?,
                Err(_) => warn!(%peer, "connection did not drain within grace period, closing"),
            }
        }
    }

    debug!(%peer, "connection closed");
    Ok(())
}

async fn respond(
    server: Server,
    request: Request<Incoming>,
    peer: SocketAddr,
    is_secure: bool,
) -> HttpResponse {
    let id = server.next_connection_id();
    let details = conn_details(&request, peer, is_secure);
    let auth = server
        .authenticator()
        .authenticate(request.headers(), request.uri())
        .await;

    let client = Arc::new(Client::new(id, auth, Some(details)));
    let _registration = Registration::new(Arc::clone(server.clients()), Arc::clone(&client));

    server.fire_request(&client);
    let mut response = server.handler().handle(Arc::clone(&client), request).await;
    server.fire_response(&client);

    response
        .headers_mut()
        .insert(CONNECTION_ID_HEADER, HeaderValue::from(id.as_u64()));
    response
}

/// Keeps a client registered until dropped.
struct Registration {
    registry: Arc<ClientRegistry>,
    client: Arc<Client>,
}

impl Registration {
    fn new(registry: Arc<ClientRegistry>, client: Arc<Client>) -> Self {
        registry.register(Arc::clone(&client));
        Self { registry, client }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.client.mark_closed();
        self.registry.unregister(&self.client);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

/// Network metadata for one request. The client IP prefers the first
/// `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn conn_details<B>(request: &Request<B>, peer: SocketAddr, is_secure: bool) -> ConnDetails {
    let headers = request.headers();
    let remote_ip = peer.ip().to_string();

    let forwarded = header_str(headers, "x-forwarded-for")
        .split(',')
        .next()
        .map(str::trim)
        .unwrap_or("");
    let client_ip = [forwarded, header_str(headers, "x-real-ip")]
        .into_iter()
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote_ip.clone());

    let host = match header_str(headers, "host") {
        "" => request.uri().host().unwrap_or("").to_string(),
        host => host.to_string(),
    };

    ConnDetails {
        host,
        client_ip,
        remote_ip,
        client_port: peer.port(),
        user_agent: header_str(headers, "user-agent").to_string(),
        referer: header_str(headers, "referer").to_string(),
        request_path: request.uri().path().to_string(),
        is_secure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.20:51000".parse().unwrap()
    }

    #[test]
    fn details_from_plain_request() {
        let request = Request::builder()
            .uri("/chat/room?x=1")
            .header("host", "example.test")
            .header("user-agent", "curl/8")
            .header("referer", "https://example.test/")
            .body(())
            .unwrap();

        let details = conn_details(&request, peer(), false);
        assert_eq!(details.host, "example.test");
        assert_eq!(details.client_ip, "192.168.1.20");
        assert_eq!(details.remote_ip, "192.168.1.20");
        assert_eq!(details.client_port, 51000);
        assert_eq!(details.user_agent, "curl/8");
        assert_eq!(details.referer, "https://example.test/");
        assert_eq!(details.request_path, "/chat/room");
        assert!(!details.is_secure);
    }

    #[test]
    fn forwarded_for_wins_over_peer() {
        let request = Request::builder()
            .uri("/")
            .header("x-forwarded-for", " 203.0.113.9 , 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();

        let details = conn_details(&request, peer(), true);
        assert_eq!(details.client_ip, "203.0.113.9");
        assert_eq!(details.remote_ip, "192.168.1.20");
        assert!(details.is_secure);
    }

    #[test]
    fn real_ip_used_without_forwarded_for() {
        let request = Request::builder()
            .uri("/")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();

        assert_eq!(conn_details(&request, peer(), false).client_ip, "198.51.100.2");
    }

    #[test]
    fn registration_guard_unregisters_on_drop() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Arc::new(Client::builder(9).user("u1").build());

        let guard = Registration::new(Arc::clone(&registry), Arc::clone(&client));
        assert_eq!(registry.get_by_user("u1").len(), 1);

        drop(guard);
        assert_eq!(registry.count(), 0);
        assert!(registry.get_by_user("u1").is_empty());
        assert!(client.is_closed());
    }
}
