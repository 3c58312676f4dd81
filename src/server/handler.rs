//! Connection handler for the protocol bridge
//!
//! The handler owns the socket of one client. It runs the startup exchange
//! itself, then relays every tagged frame to the engine and writes back the
//! engine's reply untouched. Frames are handled strictly one at a time: the
//! reply to frame N is flushed before frame N+1 is read.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{AuthMode, Session};
use super::ServerError;
use crate::engine::{ContextId, EngineHandle};
use crate::protocol::message::{frontend, ErrorFields};
use crate::protocol::startup::{StartupParams, StartupRequest, ENCRYPTION_NOT_SUPPORTED};
use crate::protocol::{
    sqlstate, BackendMessage, Frame, FrameReader, FrameWriter, ProtocolError, ProtocolResult,
};

/// Handle a bridged client connection until it closes
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    connection_id: u32,
    engine: EngineHandle,
    auth_mode: AuthMode,
    shutdown: watch::Receiver<bool>,
) {
    info!(%peer_addr, connection_id, "Client connected");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer_addr, connection_id, error = %e, "Could not disable Nagle");
    }
    let (read_half, write_half) = stream.into_split();
    let mut conn = BridgeConnection::new(
        read_half,
        write_half,
        connection_id,
        engine.clone(),
        auth_mode,
        shutdown,
    );

    match conn.run().await {
        Ok(()) | Err(ServerError::Protocol(ProtocolError::ConnectionClosed)) => {}
        Err(e) => warn!(%peer_addr, connection_id, error = %e, "Connection error"),
    }

    if let Some(context) = conn.context {
        if let Err(e) = engine.release(context).await {
            debug!(connection_id, error = %e, "Could not release execution context");
        }
    }

    info!(%peer_addr, connection_id, "Client disconnected");
}

/// Relay state of one connection
pub(crate) struct BridgeConnection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    connection_id: u32,
    engine: EngineHandle,
    auth_mode: AuthMode,
    shutdown: watch::Receiver<bool>,
    /// Engine context, created lazily by the first forwarded frame
    context: Option<ContextId>,
}

impl<R, W> BridgeConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        connection_id: u32,
        engine: EngineHandle,
        auth_mode: AuthMode,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            connection_id,
            engine,
            auth_mode,
            shutdown,
            context: None,
        }
    }

    pub async fn run(&mut self) -> Result<(), ServerError> {
        let Some(params) = self.startup().await? else {
            return Ok(());
        };
        let mut session = Session::new(self.connection_id, &params, rand::random());
        debug!(
            connection_id = self.connection_id,
            user = %session.user,
            database = %session.database,
            "Startup received"
        );

        // Nothing reaches the engine before it reports ready
        if let Err(e) = self.engine.ready().await {
            self.send(&[Session::engine_unavailable(&e.to_string())])
                .await?;
            return Err(e.into());
        }

        match self.auth_mode {
            AuthMode::Trust => {
                session.authenticate();
                self.send(&session.welcome()).await?;
            }
            AuthMode::AnyPassword => {
                self.send(&[BackendMessage::AuthenticationCleartextPassword])
                    .await?;
            }
        }

        while let Some(frame) = self.next_frame().await? {
            let tag = frame.tag();
            if tag == frontend::TERMINATE {
                debug!(connection_id = self.connection_id, "Terminate received");
                return Ok(());
            }

            if !session.is_authenticated() {
                if tag == frontend::PASSWORD {
                    session.authenticate();
                    self.send(&session.welcome()).await?;
                } else {
                    warn!(
                        connection_id = self.connection_id,
                        tag = %(tag as char),
                        "Dropping frame received before authentication"
                    );
                }
                continue;
            }

            self.forward(session.context(), frame).await?;
        }
        Ok(())
    }

    /// Read startup frames until a real startup request arrives
    ///
    /// Returns `None` for cancel requests, which close the connection.
    async fn startup(&mut self) -> Result<Option<StartupParams>, ServerError> {
        loop {
            let body = tokio::select! {
                body = self.reader.read_startup() => body?,
                _ = self.shutdown.changed() => return Ok(None),
            };

            match StartupRequest::parse(&body) {
                Ok(StartupRequest::Startup(params)) => return Ok(Some(params)),
                Ok(StartupRequest::SslRequest) | Ok(StartupRequest::GssEncRequest) => {
                    self.writer.write_raw(&[ENCRYPTION_NOT_SUPPORTED]).await?;
                    self.writer.flush().await?;
                }
                Ok(StartupRequest::Cancel { process_id, .. }) => {
                    debug!(
                        connection_id = self.connection_id,
                        process_id, "Cancel request ignored"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    let code = match e {
                        ProtocolError::Unsupported(_) => sqlstate::FEATURE_NOT_SUPPORTED,
                        _ => sqlstate::PROTOCOL_VIOLATION,
                    };
                    self.send(&[BackendMessage::ErrorResponse(ErrorFields::fatal(
                        code,
                        e.to_string(),
                    ))])
                    .await?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Next tagged frame, or `None` once the bridge is shutting down
    async fn next_frame(&mut self) -> Result<Option<Frame>, ServerError> {
        tokio::select! {
            frame = self.reader.read_frame() => Ok(Some(frame?)),
            _ = self.shutdown.changed() => {
                debug!(connection_id = self.connection_id, "Closing connection for shutdown");
                Ok(None)
            }
        }
    }

    async fn forward(&mut self, context: ContextId, frame: Frame) -> Result<(), ServerError> {
        debug!(
            connection_id = self.connection_id,
            tag = %(frame.tag() as char),
            len = frame.len(),
            "Forwarding frame"
        );
        self.context = Some(context);

        let reply = self.engine.exec_protocol(context, frame.into_bytes()).await?;
        self.writer.write_raw(&reply).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send(&mut self, messages: &[BackendMessage]) -> ProtocolResult<()> {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode(&mut buf);
        }
        self.writer.write_raw(&buf).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EmbeddedEngine, EngineConfig};
    use crate::protocol::message::backend;
    use crate::protocol::startup::{PROTOCOL_VERSION_3, SSL_REQUEST_CODE};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn startup_frame() -> Vec<u8> {
        let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
        body.extend_from_slice(b"user\0tester\0\0");
        let mut frame = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    async fn read_message(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let tag = client.read_u8().await.unwrap();
        let len = client.read_u32().await.unwrap() as usize;
        let mut body = vec![0; len - 4];
        client.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    async fn read_until_ready(client: &mut DuplexStream) -> Vec<u8> {
        let mut tags = Vec::new();
        loop {
            let (tag, _) = read_message(client).await;
            tags.push(tag);
            if tag == backend::READY_FOR_QUERY {
                return tags;
            }
        }
    }

    fn spawn_bridge(
        engine: &EmbeddedEngine,
        auth_mode: AuthMode,
    ) -> (DuplexStream, watch::Sender<bool>) {
        let (client, server) = duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (read, write) = tokio::io::split(server);
        let mut conn = BridgeConnection::new(read, write, 1, engine.handle(), auth_mode, shutdown_rx);
        tokio::spawn(async move {
            let _ = conn.run().await;
        });
        (client, shutdown_tx)
    }

    #[tokio::test]
    async fn test_ssl_request_then_trust_handshake() {
        let engine = EmbeddedEngine::start(EngineConfig::default()).unwrap();
        let (mut client, _shutdown) = spawn_bridge(&engine, AuthMode::Trust);

        let mut ssl_request = 8u32.to_be_bytes().to_vec();
        ssl_request.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        client.write_all(&ssl_request).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), ENCRYPTION_NOT_SUPPORTED);

        client.write_all(&startup_frame()).await.unwrap();
        let tags = read_until_ready(&mut client).await;
        assert_eq!(tags.first(), Some(&backend::AUTHENTICATION));
        assert!(tags.contains(&backend::BACKEND_KEY_DATA));

        client
            .write_all(&Frame::new(frontend::QUERY, b"SELECT 1\0").into_bytes())
            .await
            .unwrap();
        let tags = read_until_ready(&mut client).await;
        assert_eq!(
            tags,
            vec![
                backend::ROW_DESCRIPTION,
                backend::DATA_ROW,
                backend::COMMAND_COMPLETE,
                backend::READY_FOR_QUERY
            ]
        );

        drop(client);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let engine = EmbeddedEngine::start(EngineConfig::default()).unwrap();
        let (mut client, shutdown) = spawn_bridge(&engine, AuthMode::Trust);

        client.write_all(&startup_frame()).await.unwrap();
        read_until_ready(&mut client).await;

        shutdown.send_replace(true);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        engine.shutdown().await.unwrap();
    }
}
