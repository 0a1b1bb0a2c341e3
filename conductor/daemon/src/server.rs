//! Daemon Server Implementation
//!
//! This module provides the server loop for the coauthor daemon:
//! - Accepts connections on a Unix socket
//! - Reads a handshake and attaches the connection to its session
//! - Spawns handler tasks per connection
//! - Runs periodic session cleanup
//! - Supports graceful shutdown
//!
//! # Connections and Sessions
//!
//! A connection is a window onto a session, nothing more. Closing it detaches
//! the session; generations keep running and their events are replayed to
//! the next connection that names the same session.
//!
//! ```text
//!                      DaemonServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!        conn-1          conn-2          conn-3
//!      (chat-a)         (chat-b)       (chat-a, later)
//!           │               │               │
//!           └───────────────┴───────────────┘
//!                           │
//!                Conductor + SessionRegistry
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use coauthor_core::{
    transport::encode, ClientMessage, Conductor, ConnectionId, FrameDecoder, FrameError, Handshake,
    LlmBackend, ServerMessage, SessionId,
};

/// Read buffer size per connection
const READ_BUFFER_SIZE: usize = 8192;

/// Connection state tracking (internal to server)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Session attached after the handshake
    session_id: Option<SessionId>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// How long a new connection may take to send its handshake
    pub handshake_timeout: Duration,
    /// How often expired sessions are swept
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            handshake_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Why a connection handler stopped
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,
}

/// The main daemon server
pub struct DaemonServer<B: LlmBackend> {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// Shared conductor
    conductor: Arc<Conductor<B>>,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl<B: LlmBackend + 'static> DaemonServer<B> {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, conductor: Arc<Conductor<B>>) -> Self {
        Self {
            socket_path,
            server_config: ServerConfig::default(),
            conductor,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Replace the server configuration
    #[must_use]
    pub fn with_server_config(mut self, server_config: ServerConfig) -> Self {
        self.server_config = server_config;
        self
    }

    /// Get peer credentials from Unix socket
    #[cfg(unix)]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the daemon server until `shutdown` is set
    ///
    /// Setting `dump_status` logs connection and session statistics once.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>, dump_status: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, "Listening for connections");

        // Owner-only socket
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)
                .with_context(|| format!("Failed to set permissions on {:?}", self.socket_path))?;
        }

        let maintenance = self
            .conductor
            .spawn_maintenance(self.server_config.cleanup_interval);

        let our_uid = unsafe { libc::getuid() };

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            if dump_status.swap(false, Ordering::SeqCst) {
                self.log_status();
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.conductor),
                    Arc::clone(&self.connection_states),
                    self.server_config.handshake_timeout,
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    session_id: None,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            // The handler may already have finished and cleaned up
            if task_handle.is_finished() {
                self.connection_states.remove(&conn_id);
            }
        }

        maintenance.abort();
        self.shutdown().await
    }

    /// Handle a single client connection
    ///
    /// The first frame must be a [`Handshake`]. After that, client frames go
    /// to the Conductor and session events go back out, until either side
    /// closes.
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: UnixStream,
        conductor: Arc<Conductor<B>>,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
        handshake_timeout: Duration,
    ) {
        info!("Connection handler started");

        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

        let handshake = match tokio::time::timeout(
            handshake_timeout,
            Self::read_handshake(&mut reader, &mut decoder, &mut read_buf),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                warn!(error = %e, "Handshake failed");
                if matches!(&e, ConnectionError::Frame(f) if f.is_recoverable()) {
                    let reply = ServerMessage::error("invalid_message", e.to_string());
                    let _ = Self::write_message(&mut writer, &reply).await;
                }
                connection_states.remove(&conn_id);
                return;
            }
            Err(_) => {
                warn!(error = %ConnectionError::HandshakeTimeout(handshake_timeout), "Handshake failed");
                connection_states.remove(&conn_id);
                return;
            }
        };

        let (sink, mut outgoing) = mpsc::unbounded_channel::<ServerMessage>();
        let session_id = conductor.connect(handshake, sink.clone()).await;
        if let Some(mut state) = connection_states.get_mut(&conn_id) {
            state.session_id = Some(session_id.clone());
        }
        info!(session_id = %session_id, "Session attached");

        // Frames that arrived with the handshake
        let mut result = Self::dispatch_frames(&conductor, &session_id, &mut decoder).await;

        while result.is_ok() {
            tokio::select! {
                read_result = reader.read(&mut read_buf) => {
                    match read_result {
                        Ok(0) => {
                            info!("Client disconnected (EOF)");
                            break;
                        }
                        Ok(n) => {
                            decoder.push(&read_buf[..n]);
                            result = Self::dispatch_frames(&conductor, &session_id, &mut decoder).await;
                        }
                        Err(e) => result = Err(e.into()),
                    }
                }

                msg = outgoing.recv() => {
                    match msg {
                        Some(message) => {
                            debug!(kind = message.kind(), "Sending message");
                            result = Self::write_message(&mut writer, &message).await;
                        }
                        None => {
                            info!("Session channel closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = result {
            warn!(error = %e, "Connection ended with error");
        }

        conductor.disconnect_sink(&session_id, &sink);
        connection_states.remove(&conn_id);

        info!(
            session_id = %session_id,
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    async fn read_handshake(
        reader: &mut OwnedReadHalf,
        decoder: &mut FrameDecoder,
        read_buf: &mut [u8],
    ) -> Result<Handshake, ConnectionError> {
        loop {
            if let Some(handshake) = decoder.decode::<Handshake>()? {
                return Ok(handshake);
            }
            let n = reader.read(read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::ClosedBeforeHandshake);
            }
            decoder.push(&read_buf[..n]);
        }
    }

    /// Hand every complete frame to the Conductor
    ///
    /// A frame whose JSON is not a valid client message is answered with an
    /// `invalid_message` error; a corrupt frame ends the connection.
    async fn dispatch_frames(
        conductor: &Arc<Conductor<B>>,
        session_id: &SessionId,
        decoder: &mut FrameDecoder,
    ) -> Result<(), ConnectionError> {
        loop {
            match decoder.decode::<ClientMessage>() {
                Ok(Some(message)) => {
                    debug!(kind = message.kind(), "Received client message");
                    conductor.handle_client_message(session_id, message).await;
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Invalid client frame");
                    conductor
                        .registry()
                        .emit(session_id, ServerMessage::error("invalid_message", e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_message(
        writer: &mut OwnedWriteHalf,
        message: &ServerMessage,
    ) -> Result<(), ConnectionError> {
        let frame = encode(message)?;
        writer.write_all(&frame).await?;
        Ok(())
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, session_id = ?conn_state.session_id, "Aborting connection");
                conn_state.abort_handle.abort();
                if let Some(session_id) = conn_state.session_id {
                    self.conductor.disconnect(&session_id);
                }
            }
        }

        // Wait a bit for handlers to finish
        tokio::time::sleep(Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        let summary = self.conductor.registry().summary();
        info!(
            sessions = summary.total_sessions,
            running = summary.running,
            "Shutdown complete"
        );
        Ok(())
    }

    fn log_status(&self) {
        let summary = self.conductor.registry().summary();
        info!(
            connections = self.connection_count(),
            sessions = summary.total_sessions,
            attached = summary.attached,
            running = summary.running,
            queued_events = summary.queued_events,
            dropped_events = summary.dropped_events,
            "Status"
        );
        for (conn_id, stats) in self.connection_stats() {
            info!(
                conn_id = %conn_id,
                session_id = ?stats.session_id,
                peer_uid = ?stats.peer_uid,
                uptime_secs = stats.uptime_secs,
                "Connection"
            );
        }
    }

    /// Get number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_id = *r.key();
                let conn_state = r.value();
                (
                    conn_id,
                    ConnectionStats {
                        connected_at: conn_state.connected_at,
                        peer_uid: conn_state.peer_uid,
                        session_id: conn_state.session_id.clone(),
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was established
    pub connected_at: Instant,
    /// Peer UID
    pub peer_uid: Option<u32>,
    /// Attached session, once the handshake is done
    pub session_id: Option<SessionId>,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use coauthor_core::backend::{ScriptedBackend, ScriptedReply};
    use coauthor_core::{CoauthorConfig, MemoryDocuments, TypingConfig};
    use tempfile::TempDir;

    struct Harness {
        socket_path: PathBuf,
        shutdown: Arc<AtomicBool>,
        server: tokio::task::JoinHandle<Result<()>>,
        _dir: TempDir,
    }

    async fn start(backend: ScriptedBackend, server_config: ServerConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("coauthor.sock");
        let mut config = CoauthorConfig::default();
        config.typing = TypingConfig::instant();
        let conductor = Arc::new(Conductor::new(backend, Arc::new(MemoryDocuments::new()), config));
        let mut server =
            DaemonServer::new(socket_path.clone(), conductor).with_server_config(server_config);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move { server.run(flag, Arc::new(AtomicBool::new(false))).await });

        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Harness {
            socket_path,
            shutdown,
            server: handle,
            _dir: dir,
        }
    }

    async fn read_message(stream: &mut UnixStream, decoder: &mut FrameDecoder) -> ServerMessage {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(msg) = decoder.decode::<ServerMessage>().unwrap() {
                return msg;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "daemon closed the connection");
            decoder.push(&buf[..n]);
        }
    }

    async fn read_until_complete(stream: &mut UnixStream, decoder: &mut FrameDecoder) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let msg = read_message(stream, decoder).await;
            let done = matches!(msg, ServerMessage::MessageComplete { .. });
            seen.push(msg);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_handshake_greeting_and_chat() {
        let backend = ScriptedBackend::new().with_reply(ScriptedReply::text("Hello from the agent"));
        let harness = start(backend, ServerConfig::default()).await;

        let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
        let mut decoder = FrameDecoder::new();
        stream
            .write_all(&encode(&Handshake::for_session("chat-1")).unwrap())
            .await
            .unwrap();

        let greeting = read_message(&mut stream, &mut decoder).await;
        assert!(matches!(greeting, ServerMessage::Greeting { .. }), "got {greeting:?}");

        let message = ClientMessage::Message {
            content: "hi".to_string(),
            context: None,
            room_ref: None,
        };
        stream.write_all(&encode(&message).unwrap()).await.unwrap();

        let events = read_until_complete(&mut stream, &mut decoder).await;
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                ServerMessage::TextChunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Hello from the agent");
        assert!(matches!(
            events.last(),
            Some(ServerMessage::MessageComplete { content, .. }) if content == "Hello from the agent"
        ));

        harness.shutdown.store(true, Ordering::SeqCst);
        harness.server.await.unwrap().unwrap();
        assert!(!harness.socket_path.exists());
    }

    #[tokio::test]
    async fn test_invalid_frame_keeps_connection_open() {
        let harness = start(ScriptedBackend::new(), ServerConfig::default()).await;

        let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
        let mut decoder = FrameDecoder::new();
        stream
            .write_all(&encode(&Handshake::for_session("chat-2")).unwrap())
            .await
            .unwrap();
        read_message(&mut stream, &mut decoder).await;

        let bogus = serde_json::json!({ "type": "launch_rockets" });
        stream.write_all(&encode(&bogus).unwrap()).await.unwrap();
        match read_message(&mut stream, &mut decoder).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_message"),
            other => panic!("expected error, got {other:?}"),
        }

        // still usable
        stream
            .write_all(&encode(&ClientMessage::Message {
                content: "still there?".to_string(),
                context: None,
                room_ref: None,
            })
            .unwrap())
            .await
            .unwrap();
        let events = read_until_complete(&mut stream, &mut decoder).await;
        assert!(matches!(events.last(), Some(ServerMessage::MessageComplete { .. })));

        harness.shutdown.store(true, Ordering::SeqCst);
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_replays_history() {
        let backend = ScriptedBackend::new().with_reply(ScriptedReply::text("First answer"));
        let harness = start(backend, ServerConfig::default()).await;

        {
            let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
            let mut decoder = FrameDecoder::new();
            stream
                .write_all(&encode(&Handshake::for_session("chat-3")).unwrap())
                .await
                .unwrap();
            read_message(&mut stream, &mut decoder).await;
            stream
                .write_all(&encode(&ClientMessage::Message {
                    content: "question".to_string(),
                    context: None,
                    room_ref: None,
                })
                .unwrap())
                .await
                .unwrap();
            read_until_complete(&mut stream, &mut decoder).await;
        }

        let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
        let mut decoder = FrameDecoder::new();
        stream
            .write_all(&encode(&Handshake::for_session("chat-3")).unwrap())
            .await
            .unwrap();
        match read_message(&mut stream, &mut decoder).await {
            ServerMessage::History { messages } => {
                let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["question", "First answer"]);
            }
            other => panic!("expected history, got {other:?}"),
        }

        harness.shutdown.store(true, Ordering::SeqCst);
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_connection() {
        let config = ServerConfig {
            handshake_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let harness = start(ScriptedBackend::new(), config).await;

        let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        harness.shutdown.store(true, Ordering::SeqCst);
        harness.server.await.unwrap().unwrap();
    }
}
