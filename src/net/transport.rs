//! WebTransport join endpoint
//!
//! Each client opens a WebTransport session on
//! `/game/{session_id}?participantId=…&participantName=…` and then one
//! bidirectional stream that carries length-prefixed JSON frames both ways.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::game::constants::net::MAX_OUTBOUND_FRAME;
use crate::lobby::directory::SessionDirectory;
use crate::lobby::SubmitError;
use crate::metrics::Metrics;
use crate::net::connection::{self, Connection, Liveness};
use crate::net::framing::write_frame;
use crate::net::protocol::{encode, ErrorKind, JoinRequest, ServerMessage, WireError};
use crate::net::tls::TlsConfig;

/// Shared state handed to every session task
struct EndpointContext {
    directory: Arc<SessionDirectory>,
    metrics: Arc<Metrics>,
    liveness: Liveness,
    mailbox_capacity: usize,
}

/// WebTransport server
pub struct WebTransportServer {
    port: u16,
    tls_config: TlsConfig,
    context: Arc<EndpointContext>,
}

impl WebTransportServer {
    pub async fn new(
        config: &ServerConfig,
        directory: Arc<SessionDirectory>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let tls_config =
            TlsConfig::load(config.tls_cert_path.as_deref(), config.tls_key_path.as_deref())
                .await?;

        Ok(Self {
            port: config.port,
            tls_config,
            context: Arc::new(EndpointContext {
                directory,
                metrics,
                liveness: config.liveness(),
                mailbox_capacity: config.connection_mailbox_capacity,
            }),
        })
    }

    /// Certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        &self.tls_config.cert_hash
    }

    /// Accept sessions until the endpoint fails
    pub async fn run(self) -> anyhow::Result<()> {
        use wtransport::Endpoint;
        use wtransport::ServerConfig as EndpointConfig;

        // Dual-stack bind (IPv4 + IPv6)
        let endpoint_config = EndpointConfig::builder()
            .with_bind_default(self.port)
            .with_identity(self.tls_config.identity)
            .build();

        let server = Endpoint::server(endpoint_config)?;
        info!("WebTransport server listening on port {}", self.port);

        loop {
            let incoming = server.accept().await;
            let context = self.context.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_session(incoming, context).await {
                    warn!("Connection error: {}", e);
                }
            });
        }
    }
}

/// Write a single error frame; used before any connection is registered
async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, error: WireError) {
    let frame = match encode(&ServerMessage::error(error)) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to encode rejection: {}", e);
            return;
        }
    };
    if let Err(e) = write_frame(writer, &frame, MAX_OUTBOUND_FRAME).await {
        debug!("Failed to send rejection: {}", e);
    }
}

/// Validate the handshake, register with the session actor and pump frames
async fn handle_session(
    incoming: wtransport::endpoint::IncomingSession,
    context: Arc<EndpointContext>,
) -> anyhow::Result<()> {
    let session_request = incoming.await?;
    let path = session_request.path().to_string();
    debug!("New session from {:?}, path: {}", session_request.authority(), path);

    let connection = session_request.accept().await?;
    let (mut send, recv) = connection.accept_bi().await?;

    let join = match JoinRequest::from_path(&path) {
        Ok(join) => join,
        Err(e) => {
            warn!("Rejected handshake {}: {}", path, e);
            reject(&mut send, WireError::from(&e)).await;
            return Ok(());
        }
    };

    let Some(session) = context.directory.get(join.session_id) else {
        debug!(session_id = %join.session_id, "Join for unknown session");
        reject(
            &mut send,
            WireError::new(ErrorKind::NotFound, format!("session {} not found", join.session_id)),
        )
        .await;
        return Ok(());
    };

    let (handle, outbox) = connection::channel(join.participant_id, context.mailbox_capacity);
    let driver = Connection::new(session.clone(), &handle, context.liveness, context.metrics.clone());

    if let Err(e) = session.join(handle, join.name.clone()) {
        let kind = match e {
            SubmitError::Busy => ErrorKind::Busy,
            SubmitError::Closed => ErrorKind::NotFound,
        };
        reject(&mut send, WireError::new(kind, e.to_string())).await;
        return Ok(());
    }

    info!(
        session_id = %join.session_id,
        participant_id = %join.participant_id,
        "'{}' connected", join.name
    );
    driver.serve(recv, send, outbox).await;

    drop(connection);
    Ok(())
}
