//! HTTP front door: hub connector upgrades and tunneled requests.
//!
//! Every accepted TCP connection is served by hyper. A WebSocket upgrade on
//! the connector path becomes a hub session; any other request is tunneled
//! to the caller's hub.

use crate::auth::{AuthorizationService, CredentialStore};
use crate::config::ServerConfig;
use crate::connector::ConnectorService;
use crate::transport::channel_from_websocket;
use crate::tunnel::HttpTunnel;
use bytes::Bytes;
use http_body_util::Full;
use hubrelay_core::RelayResult;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    connector: Arc<ConnectorService>,
    authorization: Arc<dyn AuthorizationService>,
    tunnel: HttpTunnel,
}

impl RelayServer {
    /// Create a server authorizing against the configured channel credentials.
    pub fn new(config: ServerConfig) -> RelayResult<Self> {
        let credentials = CredentialStore::new(config.channels.clone());
        info!(count = credentials.len(), "loaded channel credentials");
        Self::with_authorization(config, Arc::new(credentials))
    }

    pub fn with_authorization(
        config: ServerConfig,
        authorization: Arc<dyn AuthorizationService>,
    ) -> RelayResult<Self> {
        let connector = Arc::new(ConnectorService::new());
        let tunnel = HttpTunnel::new(
            connector.clone(),
            authorization.clone(),
            config.max_body_size,
            &config.forwarded_headers,
        )?;
        Ok(Self {
            config,
            connector,
            authorization,
            tunnel,
        })
    }

    #[cfg(test)]
    pub fn connector(&self) -> &Arc<ConnectorService> {
        &self.connector
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> RelayResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` fires.
    ///
    /// Hub sessions and in-flight requests run under child tokens of
    /// `shutdown` and end with it.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> RelayResult<()> {
        info!(
            addr = %listener.local_addr()?,
            connector_path = %self.config.connector_path,
            "hubrelay listening"
        );

        let server = Arc::new(self);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let server = server.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, remote, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
            }
        }

        for session in server.connector.sessions() {
            info!(
                identity = %session.context,
                session_id = session.session_id,
                connected_at = %session.connected_at,
                "closing hub session"
            );
        }
        info!("hubrelay stopped accepting connections");
        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let service = {
            let server = self.clone();
            let shutdown = shutdown.clone();
            service_fn(move |req| {
                let server = server.clone();
                let shutdown = shutdown.clone();
                async move { Ok::<_, Infallible>(server.handle(req, remote, &shutdown).await) }
            })
        };

        let connection = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        if let Err(e) = result {
            debug!(remote = %remote, error = %e, "HTTP connection ended with error");
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Response<Full<Bytes>> {
        if req.uri().path() == self.config.connector_path
            && hyper_tungstenite::is_upgrade_request(&req)
        {
            return self.accept_hub(req, remote, shutdown);
        }

        // Cancelled when the caller goes away (future dropped) or on shutdown.
        let cancel = shutdown.child_token();
        let _guard = cancel.clone().drop_guard();
        match self.tunnel.forward(req, &cancel).await {
            Some(response) => response,
            None => status_response(StatusCode::SERVICE_UNAVAILABLE),
        }
    }

    fn accept_hub(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Response<Full<Bytes>> {
        let context = match self.authorization.authorize_connection(req.headers()) {
            Ok(context) => context,
            Err(e) => {
                warn!(remote = %remote, error = %e, "hub connection rejected");
                return status_response(StatusCode::UNAUTHORIZED);
            }
        };

        let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(remote = %remote, error = %e, "invalid WebSocket upgrade");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let connector = self.connector.clone();
        let max_frame_size = self.config.max_frame_size;
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            match websocket.await {
                Ok(ws) => {
                    debug!(remote = %remote, identity = %context, "hub WebSocket established");
                    let channel = channel_from_websocket(ws, max_frame_size);
                    connector.accept_connection(channel, context, cancel).await;
                }
                Err(e) => warn!(remote = %remote, error = %e, "WebSocket upgrade failed"),
            }
        });

        response
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
