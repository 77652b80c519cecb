use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use std::sync::Arc;

use crate::client::{AuthDetails, Client};

pub type HttpResponse = Response<Full<Bytes>>;

/// Application request handler. The client has already been registered when
/// this runs and is unregistered once the response has been produced.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, client: Arc<Client>, request: Request<Incoming>) -> HttpResponse;
}

/// Resolves the caller's identity from the request head. Extracting the
/// token (header, cookie, query) is up to the implementation.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, headers: &HeaderMap, uri: &Uri) -> Option<AuthDetails>;
}

/// Treats every caller as unauthenticated.
pub struct Anonymous;

#[async_trait]
impl Authenticator for Anonymous {
    async fn authenticate(&self, _headers: &HeaderMap, _uri: &Uri) -> Option<AuthDetails> {
        None
    }
}

/// Answers `GET /ping` and nothing else.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _client: Arc<Client>, request: Request<Incoming>) -> HttpResponse {
        if request.method() == Method::GET && request.uri().path() == "/ping" {
            text_response(StatusCode::OK, "pong")
        } else {
            text_response(StatusCode::NOT_FOUND, "not found")
        }
    }
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
