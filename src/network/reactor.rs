//! Reactor
//!
//! Single-threaded network event loop. Owns the listener and every socket,
//! runs the login handshake, assembles frames and queues them for the engine.
//! It never touches game state: everything it learns becomes a
//! [`NetworkEvent`] on the ingress channel.
//!
//! One task per connection, all on one current-thread runtime:
//!
//! ```text
//!           accept
//! listener ───────► connection task ──► ingress (bounded) ──► engine
//!                        ▲    │
//!           notify ──────┘    └── write outbound on wake-up
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::IsaacCipher;
use crate::network::frame::{Frame, FrameAssembler, FrameError, FrameSizes, MAX_FRAME_LEN};
use crate::network::handshake::{Handshake, HandshakeError, HandshakeStep, LoginRequest};
use crate::network::session::{Session, SessionId, SessionState};

/// Pause before retrying a full ingress queue.
const INGRESS_RETRY: Duration = Duration::from_millis(5);

/// Grace period for connection tasks to flush on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Stop reading a socket while this much input is waiting to be framed.
const MAX_INBOUND_BYTES: usize = 4 * MAX_FRAME_LEN;

/// Something the engine must apply during its next ingress step.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A login block arrived; the engine picks the response.
    Login {
        /// Connection the block arrived on.
        session: Arc<Session>,
        /// Decoded block.
        request: LoginRequest,
    },
    /// A complete frame from an established session.
    Frame {
        /// Connection the frame arrived on.
        session: Arc<Session>,
        /// The frame.
        frame: Frame,
    },
    /// The connection is gone. Sent exactly once per connection.
    Disconnected {
        /// The closed connection.
        session: Arc<Session>,
    },
}

/// Why a connection ended.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("idle for {0:?}")]
    Idle(Duration),

    #[error("engine stopped consuming events")]
    EngineGone,
}

/// A bound, not yet running reactor.
pub struct Reactor {
    listener: std::net::TcpListener,
    config: ServerConfig,
    sizes: Arc<FrameSizes>,
    ingress: Sender<NetworkEvent>,
}

impl Reactor {
    /// Bind the listening socket.
    ///
    /// Binding happens here, on the caller's thread, so a port that is
    /// already taken fails startup instead of a background thread.
    pub fn bind(config: &ServerConfig, sizes: FrameSizes, ingress: Sender<NetworkEvent>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            config: config.clone(),
            sizes: Arc::new(sizes),
            ingress,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the `reactor` thread.
    pub fn spawn(self) -> io::Result<ReactorHandle> {
        let local_addr = self.listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let signal = shutdown_tx.clone();
        let thread = std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || runtime.block_on(self.run(signal, shutdown_rx)))?;

        Ok(ReactorHandle {
            local_addr,
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }

    #[instrument(name = "reactor", skip_all, fields(addr = %self.config.bind_addr))]
    async fn run(self, signal: broadcast::Sender<()>, mut shutdown_rx: broadcast::Receiver<()>) {
        let listener = match TcpListener::from_std(self.listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to register listener: {}", e);
                return;
            }
        };

        let connections = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if connections.load(Ordering::Acquire) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("set_nodelay failed for {}: {}", addr, e);
                            }

                            next_id += 1;
                            let session = Arc::new(Session::new(
                                SessionId(next_id),
                                addr,
                                self.config.max_outbound_bytes,
                            ));
                            info!(session = %session.id(), "New connection from {}", addr);

                            let connection = Connection::new(stream, session, &self.config, self.sizes.clone(), self.ingress.clone());
                            let shutdown = signal.subscribe();
                            let connections = connections.clone();
                            connections.fetch_add(1, Ordering::AcqRel);
                            tasks.spawn(async move {
                                connection.run(shutdown).await;
                                connections.fetch_sub(1, Ordering::AcqRel);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        let drained = timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Connections did not close in time, aborting");
            tasks.abort_all();
        }
        info!("Reactor stopped");
    }
}

/// Running reactor. Dropping it stops the thread.
pub struct ReactorHandle {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ReactorHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every connection and join the thread.
    pub fn terminate(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Reactor thread panicked");
            }
        }
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

struct Connection {
    stream: TcpStream,
    session: Arc<Session>,
    inbound: BytesMut,
    handshake: Handshake,
    decryptor: Option<IsaacCipher>,
    assembler: FrameAssembler,
    sizes: Arc<FrameSizes>,
    ingress: Sender<NetworkEvent>,
    idle_timeout: Duration,
    max_frames_per_read: usize,
}

impl Connection {
    fn new(
        stream: TcpStream,
        session: Arc<Session>,
        config: &ServerConfig,
        sizes: Arc<FrameSizes>,
        ingress: Sender<NetworkEvent>,
    ) -> Self {
        Self {
            stream,
            session,
            inbound: BytesMut::with_capacity(512),
            handshake: Handshake::new(config.revision, rand::random()),
            decryptor: None,
            assembler: FrameAssembler::new(),
            sizes,
            ingress,
            idle_timeout: config.idle_timeout,
            max_frames_per_read: config.max_frames_per_read.max(1),
        }
    }

    #[instrument(name = "connection", skip_all, fields(session = %self.session.id(), addr = %self.session.addr()))]
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        self.session.advance(SessionState::Handshaking);

        match self.serve(&mut shutdown).await {
            Ok(()) => debug!("Connection closed"),
            Err(e @ (ConnectionError::Io(_) | ConnectionError::Idle(_) | ConnectionError::EngineGone)) => {
                debug!("Connection dropped: {}", e)
            }
            Err(e) => warn!("Closing connection: {}", e),
        }

        self.session.close();
        if let Err(e) = self.flush().await {
            debug!("Final flush failed: {}", e);
        }
        let _ = self.stream.shutdown().await;
        self.session.advance(SessionState::Closed);

        let session = self.session.clone();
        if send_event(&self.ingress, NetworkEvent::Disconnected { session }).await.is_err() {
            debug!("Engine gone, disconnect not delivered");
        }
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ConnectionError> {
        let mut last_read = Instant::now();

        loop {
            if !self.session.is_open() {
                return Ok(());
            }
            let can_read = self.inbound.len() < MAX_INBOUND_BYTES;

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = self.session.notified() => {
                    self.flush().await?;
                    if !self.session.is_open() {
                        return Ok(());
                    }
                    self.process_inbound().await?;
                }
                read = timeout_at(last_read + self.idle_timeout, self.stream.read_buf(&mut self.inbound)), if can_read => {
                    match read {
                        Err(_) => return Err(ConnectionError::Idle(self.idle_timeout)),
                        Ok(Ok(0)) => return Ok(()),
                        Ok(Ok(_)) => {
                            last_read = Instant::now();
                            self.process_inbound().await?;
                        }
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Turn buffered input into events for the current state.
    async fn process_inbound(&mut self) -> Result<(), ConnectionError> {
        match self.session.state() {
            SessionState::Handshaking => self.process_handshake().await,
            SessionState::Established => self.process_frames().await,
            _ => Ok(()),
        }
    }

    async fn process_handshake(&mut self) -> Result<(), ConnectionError> {
        while let Some(step) = self.handshake.advance(&mut self.inbound)? {
            match step {
                HandshakeStep::Reply(reply) => {
                    self.stream.write_all(&reply).await?;
                }
                HandshakeStep::Complete(request) => {
                    let (decryptor, encryptor) = request.ciphers();
                    self.decryptor = Some(decryptor);
                    self.session.set_encryptor(encryptor);
                    debug!(username = %request.username, "Login block received");

                    let session = self.session.clone();
                    send_event(&self.ingress, NetworkEvent::Login { session, request }).await?;
                    // Anything else waits until the engine answers.
                    break;
                }
            }
        }
        Ok(())
    }

    async fn process_frames(&mut self) -> Result<(), ConnectionError> {
        let Some(decryptor) = self.decryptor.as_mut() else {
            return Ok(());
        };

        let mut frames = Vec::new();
        while frames.len() < self.max_frames_per_read {
            match self.assembler.next_frame(&mut self.inbound, decryptor, &self.sizes)? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        let capped = frames.len() == self.max_frames_per_read && !self.inbound.is_empty();

        for frame in frames {
            #[cfg(feature = "debug-tracing")]
            tracing::trace!(opcode = frame.opcode, len = frame.len(), "Frame assembled");
            let session = self.session.clone();
            send_event(&self.ingress, NetworkEvent::Frame { session, frame }).await?;
        }

        // Come back for the rest after other connections had a turn.
        if capped {
            self.session.wake();
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        while let Some(out) = self.session.take_outbound() {
            self.stream.write_all(&out).await?;
        }
        self.stream.flush().await
    }
}

/// Queue `event`, waiting (without blocking the thread) while the queue is full.
async fn send_event(ingress: &Sender<NetworkEvent>, mut event: NetworkEvent) -> Result<(), ConnectionError> {
    loop {
        match ingress.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(returned)) => {
                event = returned;
                sleep(INGRESS_RETRY).await;
            }
            Err(TrySendError::Disconnected(_)) => return Err(ConnectionError::EngineGone),
        }
    }
}
