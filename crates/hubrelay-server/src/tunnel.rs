//! HTTP tunnel: turns inbound HTTP requests into `HttpInvoke` envelopes and
//! the hub's replies back into HTTP responses.
//!
//! Forwarded header names go on the wire lowercase, except `Content-Type`,
//! which hubs look up by its canonical spelling.

use crate::auth::AuthorizationService;
use crate::connector::ConnectorService;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hubrelay_core::{
    CloudMessageFactory, CloudMessageType, HttpRequestMessageContent, HttpResponseMessageContent,
    RelayError, RelayResult,
};
use hyper::body::Body;
use hyper::header::{
    HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, WWW_AUTHENTICATE,
};
use hyper::{HeaderMap, Request, Response, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Set on every tunneled response when the request reached the relay.
pub const ENTER_HEADER: HeaderName = HeaderName::from_static("hubrelay-cloud-enter");
/// Set on successful responses when the hub's reply left the relay.
pub const EXIT_HEADER: HeaderName = HeaderName::from_static("hubrelay-cloud-exit");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a tunneled request produced no hub response.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("invalid reply from hub: {0}")]
    InvalidReply(String),
}

impl TunnelError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::Relay(RelayError::SessionNotFound(_) | RelayError::SessionEnded) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            TunnelError::Relay(RelayError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            TunnelError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            TunnelError::BodyRead(_) => StatusCode::BAD_REQUEST,
            TunnelError::Relay(_) | TunnelError::InvalidReply(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

pub struct HttpTunnel {
    connector: Arc<ConnectorService>,
    authorization: Arc<dyn AuthorizationService>,
    factory: CloudMessageFactory,
    max_body_size: usize,
    forwarded_headers: Vec<HeaderName>,
}

impl HttpTunnel {
    /// `extra_headers` are forwarded to the hub in addition to `Content-Type`.
    pub fn new(
        connector: Arc<ConnectorService>,
        authorization: Arc<dyn AuthorizationService>,
        max_body_size: usize,
        extra_headers: &[String],
    ) -> RelayResult<Self> {
        let mut forwarded_headers = vec![CONTENT_TYPE];
        for name in extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RelayError::Config(format!("invalid forwarded header {name:?}: {e}"))
            })?;
            if !forwarded_headers.contains(&name) {
                forwarded_headers.push(name);
            }
        }

        Ok(Self {
            connector,
            authorization,
            factory: CloudMessageFactory::new(),
            max_body_size,
            forwarded_headers,
        })
    }

    /// Tunnel one request to the caller's hub.
    ///
    /// Returns `None` when `cancel` fired before the hub replied; the caller
    /// is gone and nothing should be written.
    pub async fn forward<B>(
        &self,
        request: Request<B>,
        cancel: &CancellationToken,
    ) -> Option<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let entered = Utc::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        match self.tunnel(request, cancel).await {
            Ok(mut response) => {
                stamp(response.headers_mut(), ENTER_HEADER, entered);
                stamp(response.headers_mut(), EXIT_HEADER, Utc::now());
                debug!(%method, path = %path, status = %response.status(), "request tunneled");
                Some(response)
            }
            Err(TunnelError::Relay(RelayError::Cancelled)) => None,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    warn!(%method, path = %path, %status, error = %e, "tunneled request failed");
                } else {
                    debug!(%method, path = %path, %status, error = %e, "tunneled request rejected");
                }
                Some(error_response(status, entered))
            }
        }
    }

    async fn tunnel<B>(
        &self,
        request: Request<B>,
        cancel: &CancellationToken,
    ) -> Result<Response<Full<Bytes>>, TunnelError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let context = self.authorization.authorize_request(request.headers())?;

        let (parts, body) = request.into_parts();
        let content = self.read_body(&parts.headers, body).await?;
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let headers = self
            .forwarded_headers
            .iter()
            .flat_map(|name| {
                parts.headers.get_all(name).iter().filter_map(move |value| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (wire_name(name), value.to_string()))
                })
            })
            .collect();

        let content = HttpRequestMessageContent {
            method: parts.method.to_string(),
            uri,
            headers,
            content,
        };
        let envelope = self
            .factory
            .create_message(CloudMessageType::HttpInvoke, &content)?;
        let reply = self.connector.invoke(&context, envelope, cancel).await?;

        build_response(reply.content_as()?)
    }

    /// Read the whole request body. An empty body without `Content-Length`
    /// is treated as absent.
    async fn read_body<B>(&self, headers: &HeaderMap, body: B) -> Result<Option<Vec<u8>>, TunnelError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_body_size as u64) {
            return Err(TunnelError::BodyTooLarge(self.max_body_size));
        }

        let collected = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    TunnelError::BodyTooLarge(self.max_body_size)
                } else {
                    TunnelError::BodyRead(e.to_string())
                }
            })?;

        let bytes = collected.to_bytes();
        if bytes.is_empty() && declared.is_none() {
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }
}

fn build_response(reply: HttpResponseMessageContent) -> Result<Response<Full<Bytes>>, TunnelError> {
    let status = StatusCode::from_u16(reply.status_code)
        .map_err(|_| TunnelError::InvalidReply(format!("status code {}", reply.status_code)))?;

    let mut response = Response::new(Full::new(Bytes::from(reply.content.unwrap_or_default())));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in reply.headers {
        let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            warn!(header = %name, "dropping invalid header from hub reply");
            continue;
        };
        // Framing is recomputed for the collected body.
        if header_name == CONTENT_LENGTH || header_name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(header_name, header_value);
    }
    Ok(response)
}

fn error_response(status: StatusCode, entered: DateTime<Utc>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"hubrelay\""),
        );
    }
    stamp(response.headers_mut(), ENTER_HEADER, entered);
    response
}

fn stamp(headers: &mut HeaderMap, name: HeaderName, at: DateTime<Utc>) {
    let formatted = at.to_rfc3339_opts(SecondsFormat::Micros, true);
    if let Ok(value) = HeaderValue::from_str(&formatted) {
        headers.insert(name, value);
    }
}

fn wire_name(name: &HeaderName) -> String {
    if *name == CONTENT_TYPE {
        "Content-Type".to_string()
    } else {
        name.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubrelay_core::{AuthorizationContext, Channel, ChannelReceiver, ChannelSender, CloudMessage};
    use hyper::header::{ACCEPT, AUTHORIZATION};
    use std::time::Duration;

    struct StubAuth(AuthorizationContext);

    impl AuthorizationService for StubAuth {
        fn authorize_request(&self, headers: &HeaderMap) -> RelayResult<AuthorizationContext> {
            match headers.get(AUTHORIZATION) {
                Some(v) if v.as_bytes() == b"Basic good" => Ok(self.0.clone()),
                _ => Err(RelayError::Unauthorized("bad credentials".into())),
            }
        }

        fn authorize_connection(&self, _headers: &HeaderMap) -> RelayResult<AuthorizationContext> {
            Ok(self.0.clone())
        }
    }

    fn hub_identity() -> AuthorizationContext {
        AuthorizationContext::new("H1", "home")
    }

    fn tunnel(connector: &Arc<ConnectorService>, max_body_size: usize) -> HttpTunnel {
        HttpTunnel::new(
            connector.clone(),
            Arc::new(StubAuth(hub_identity())),
            max_body_size,
            &["Accept".to_string()],
        )
        .unwrap()
    }

    async fn connect_hub(connector: &Arc<ConnectorService>) -> (ChannelSender, ChannelReceiver) {
        let (cloud, hub) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(cloud);
        let (hr, hw) = tokio::io::split(hub);

        tokio::spawn({
            let connector = connector.clone();
            async move {
                connector
                    .accept_connection(
                        Channel::from_io(cr, cw),
                        hub_identity(),
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !connector.is_connected(&hub_identity()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hub was not registered");

        Channel::from_io(hr, hw).split()
    }

    async fn reply(tx: &mut ChannelSender, request: &CloudMessage, status_code: u16, body: &str) {
        let content = HttpResponseMessageContent {
            status_code,
            headers: vec![("Content-Type".into(), "application/json".into())],
            content: Some(body.as_bytes().to_vec()),
        };
        let message = CloudMessageFactory::new()
            .create_reply(request, &content)
            .unwrap();
        tx.send(&message).await.unwrap();
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header(AUTHORIZATION, "Basic good")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn timestamp(response: &Response<Full<Bytes>>, name: HeaderName) -> DateTime<Utc> {
        let value = response.headers().get(name).unwrap().to_str().unwrap();
        DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn request_round_trips_through_hub() {
        let connector = Arc::new(ConnectorService::new());
        let (mut hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let hub = tokio::spawn(async move {
            let request = hub_rx.receive().await.unwrap();
            assert_eq!(request.message_type, CloudMessageType::HttpInvoke);
            let content: HttpRequestMessageContent = request.content_as().unwrap();
            assert_eq!(content.method, "GET");
            assert_eq!(content.uri, "/devices/42?verbose=1");
            assert_eq!(content.header("accept"), Some("application/json"));
            assert_eq!(content.header("x-not-forwarded"), None);
            assert_eq!(content.content, None);
            reply(&mut hub_tx, &request, 200, r#"{"id":42}"#).await;
        });

        let request = Request::builder()
            .method("GET")
            .uri("/devices/42?verbose=1")
            .header(AUTHORIZATION, "Basic good")
            .header(ACCEPT, "application/json")
            .header("x-not-forwarded", "1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = tunnel(&connector, 1024)
            .forward(request, &CancellationToken::new())
            .await
            .unwrap();
        hub.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let enter = timestamp(&response, ENTER_HEADER);
        let exit = timestamp(&response, EXIT_HEADER);
        assert!(exit >= enter);
        assert_eq!(body_of(response).await, Bytes::from_static(br#"{"id":42}"#));
    }

    #[tokio::test]
    async fn request_body_and_content_type_are_forwarded() {
        let connector = Arc::new(ConnectorService::new());
        let (mut hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let hub = tokio::spawn(async move {
            let request = hub_rx.receive().await.unwrap();
            let content: HttpRequestMessageContent = request.content_as().unwrap();
            assert_eq!(content.method, "POST");
            assert_eq!(content.header("content-type"), Some("text/plain"));
            assert!(content
                .headers
                .iter()
                .any(|(name, value)| name == "Content-Type" && value == "text/plain"));
            assert_eq!(content.content.as_deref(), Some(&b"turn on"[..]));
            reply(&mut hub_tx, &request, 201, "").await;
        });

        let request = Request::builder()
            .method("POST")
            .uri("/lights")
            .header(AUTHORIZATION, "Basic good")
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from_static(b"turn on")))
            .unwrap();
        let response = tunnel(&connector, 1024)
            .forward(request, &CancellationToken::new())
            .await
            .unwrap();
        hub.await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn no_hub_connected_is_gateway_timeout() {
        let connector = Arc::new(ConnectorService::new());
        let response = tunnel(&connector, 1024)
            .forward(get("/devices/42"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().contains_key(ENTER_HEADER));
        assert!(!response.headers().contains_key(EXIT_HEADER));
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected_before_sending() {
        let connector = Arc::new(ConnectorService::new());
        let (_hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let request = Request::builder()
            .uri("/devices/42")
            .header(AUTHORIZATION, "Basic wrong")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = tunnel(&connector, 1024)
            .forward(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), hub_rx.receive())
                .await
                .is_err(),
            "hub received an envelope"
        );
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let connector = Arc::new(ConnectorService::new());
        let (mut hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let hub = tokio::spawn(async move {
            let first = hub_rx.receive().await.unwrap();
            let second = hub_rx.receive().await.unwrap();
            for request in [&second, &first] {
                let content: HttpRequestMessageContent = request.content_as().unwrap();
                reply(&mut hub_tx, request, 200, &content.uri).await;
            }
        });

        let tunnel = tunnel(&connector, 1024);
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            tunnel.forward(get("/a"), &cancel),
            tunnel.forward(get("/b"), &cancel),
        );
        hub.await.unwrap();

        assert_eq!(body_of(a.unwrap()).await, Bytes::from_static(b"/a"));
        assert_eq!(body_of(b.unwrap()).await, Bytes::from_static(b"/b"));
    }

    #[tokio::test]
    async fn oversized_body_is_payload_too_large() {
        let connector = Arc::new(ConnectorService::new());
        let (_hub_tx, _hub_rx) = connect_hub(&connector).await;

        let request = Request::builder()
            .method("PUT")
            .uri("/upload")
            .header(AUTHORIZATION, "Basic good")
            .body(Full::new(Bytes::from(vec![0u8; 32])))
            .unwrap();
        let response = tunnel(&connector, 16)
            .forward(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn malformed_reply_is_bad_gateway() {
        let connector = Arc::new(ConnectorService::new());
        let (mut hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let hub = tokio::spawn(async move {
            let factory = CloudMessageFactory::new();
            let request = hub_rx.receive().await.unwrap();
            let message = factory.create_reply(&request, &"not a response").unwrap();
            hub_tx.send(&message).await.unwrap();

            let request = hub_rx.receive().await.unwrap();
            reply(&mut hub_tx, &request, 42, "").await;
        });

        let tunnel = tunnel(&connector, 1024);
        let cancel = CancellationToken::new();
        let first = tunnel.forward(get("/x"), &cancel).await.unwrap();
        let second = tunnel.forward(get("/y"), &cancel).await.unwrap();
        hub.await.unwrap();

        assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(second.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn invalid_reply_headers_are_dropped() {
        let response = build_response(HttpResponseMessageContent {
            status_code: 200,
            headers: vec![
                ("X-Good".into(), "yes".into()),
                ("Bad Name".into(), "x".into()),
                ("X-Bad-Value".into(), "line\nbreak".into()),
                ("Set-Cookie".into(), "a=1".into()),
                ("Set-Cookie".into(), "b=2".into()),
                ("Content-Length".into(), "999".into()),
            ],
            content: None,
        })
        .unwrap();

        assert_eq!(response.headers().get("x-good").unwrap(), "yes");
        assert!(!response.headers().contains_key("x-bad-value"));
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert!(!response.headers().contains_key(CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn cancelled_request_writes_nothing() {
        let connector = Arc::new(ConnectorService::new());
        let (_hub_tx, mut hub_rx) = connect_hub(&connector).await;

        let cancel = CancellationToken::new();
        let tunnel = tunnel(&connector, 1024);
        let forward = tunnel.forward(get("/slow"), &cancel);
        let hub = async {
            hub_rx.receive().await.unwrap();
            cancel.cancel();
        };
        let (response, ()) = tokio::join!(forward, hub);

        assert!(response.is_none());
    }
}
