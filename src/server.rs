//! Server Facade
//!
//! Wires the engine and the reactor together and owns their threads.
//!
//! ```text
//! start():    bind listener ─► build engine ─► spawn engine ─► spawn reactor
//! shutdown(): stop engine ─► drop engine (pool, ingress) ─► stop reactor
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rayon::ThreadPoolBuildError;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::game::content::Content;
use crate::game::engine::{Engine, EngineHandle};
use crate::network::frame::FrameSizes;
use crate::network::reactor::{Reactor, ReactorHandle};

/// Startup failures. All of them are fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),

    /// The decoder table is inconsistent.
    #[error("invalid decoder registry: {0}")]
    Registry(#[from] ConfigError),

    /// A server thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

struct Running {
    engine: EngineHandle,
    reactor: ReactorHandle,
}

/// A game server: one engine thread, one reactor thread and the worker pool.
pub struct Server {
    config: ServerConfig,
    content: Arc<dyn Content>,
    running: Option<Running>,
    started: bool,
}

impl Server {
    /// Create a stopped server.
    pub fn new(config: ServerConfig, content: impl Content) -> Self {
        Self {
            config,
            content: Arc::new(content),
            running: None,
            started: false,
        }
    }

    /// Bind, build and start every thread.
    ///
    /// Only the first call does anything; a server is started at most once.
    pub fn start(&mut self) -> Result<(), StartupError> {
        if self.started {
            warn!("Server already started");
            return Ok(());
        }

        let (tx, rx) = crossbeam_channel::bounded(self.config.ingress_capacity.max(1));
        let reactor = Reactor::bind(&self.config, FrameSizes::legacy(), tx).map_err(|source| StartupError::Bind {
            addr: self.config.bind_addr,
            source,
        })?;
        let local_addr = reactor.local_addr().map_err(|source| StartupError::Bind {
            addr: self.config.bind_addr,
            source,
        })?;

        let engine = Engine::new(&self.config, self.content.clone(), rx)?;
        let engine = engine
            .spawn()
            .map_err(|source| StartupError::Spawn { name: "engine", source })?;
        let reactor = reactor
            .spawn()
            .map_err(|source| StartupError::Spawn { name: "reactor", source })?;

        self.started = true;
        self.running = Some(Running { engine, reactor });
        info!(
            "{} listening on {} (tick {:?}, {} workers)",
            self.config.server_name, local_addr, self.config.tick_period, self.config.worker_threads
        );
        Ok(())
    }

    /// Address the reactor is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.reactor.local_addr())
    }

    /// True between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop ticking, log everyone out and close every socket.
    pub fn shutdown(&mut self) {
        let Some(Running { engine, reactor }) = self.running.take() else {
            return;
        };
        info!("Shutting down");

        // The engine, and with it the ingress receiver, is gone before the
        // reactor stops.
        if let Some(engine) = engine.stop() {
            info!(ticks = engine.ticks(), "Engine stopped");
        }
        reactor.terminate();
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.config.bind_addr)
            .field("running", &self.is_running())
            .finish()
    }
}
