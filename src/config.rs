//! Server Configuration
//!
//! Every tunable the server reads at startup. `ServerConfig::default()` is a
//! working single-box setup; `ServerConfig::from_env()` overrides any field
//! from `RS2_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::game::engine::OverrunPolicy;

/// Default game port of the legacy client.
pub const DEFAULT_PORT: u16 = 43594;

/// Client revision this server speaks.
pub const DEFAULT_REVISION: u16 = 317;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two decoders claimed the same opcode.
    #[error("opcode {opcode} registered twice ({first} and {second})")]
    DuplicateOpcode {
        /// Contested opcode.
        opcode: u8,
        /// Decoder registered first.
        first: &'static str,
        /// Decoder that tried to register it again.
        second: &'static str,
    },

    /// An environment variable did not parse.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Interval between tick starts.
    pub tick_period: Duration,
    /// Worker pool size for the parallel phases.
    pub worker_threads: usize,
    /// Player capacity.
    pub max_players: usize,
    /// Npc capacity.
    pub max_npcs: usize,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Client revision accepted at login.
    pub revision: u16,
    /// Close a connection that sent nothing for this long.
    pub idle_timeout: Duration,
    /// Capacity of the reactor to engine queue.
    pub ingress_capacity: usize,
    /// Frames assembled per read wake-up.
    pub max_frames_per_read: usize,
    /// Pending output past which a session is closed.
    pub max_outbound_bytes: usize,
    /// What to do when a tick runs past its deadline.
    pub overrun_policy: OverrunPolicy,
    /// Name shown in the startup banner.
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tick_period: Duration::from_millis(crate::TICK_PERIOD_MS),
            worker_threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            max_players: 2000,
            max_npcs: 4000,
            max_connections: 2048,
            revision: DEFAULT_REVISION,
            idle_timeout: Duration::from_secs(15),
            ingress_capacity: 16_384,
            max_frames_per_read: 10,
            max_outbound_bytes: 64 * 1024,
            overrun_policy: OverrunPolicy::Skip,
            server_name: "RS2 Engine".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `RS2_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `RS2_BIND_ADDR` | `bind_addr` |
    /// | `RS2_TICK_PERIOD_MS` | `tick_period` |
    /// | `RS2_WORKER_THREADS` | `worker_threads` |
    /// | `RS2_MAX_PLAYERS` | `max_players` |
    /// | `RS2_MAX_NPCS` | `max_npcs` |
    /// | `RS2_MAX_CONNECTIONS` | `max_connections` |
    /// | `RS2_REVISION` | `revision` |
    /// | `RS2_IDLE_TIMEOUT_SECS` | `idle_timeout` |
    /// | `RS2_INGRESS_CAPACITY` | `ingress_capacity` |
    /// | `RS2_MAX_FRAMES_PER_READ` | `max_frames_per_read` |
    /// | `RS2_MAX_OUTBOUND_BYTES` | `max_outbound_bytes` |
    /// | `RS2_OVERRUN_POLICY` | `overrun_policy` (`skip`, `burst`, `delay`) |
    /// | `RS2_SERVER_NAME` | `server_name` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let source = Lookup(&lookup);

        source.apply("RS2_BIND_ADDR", &mut config.bind_addr)?;
        if let Some(ms) = source.parse::<u64>("RS2_TICK_PERIOD_MS")? {
            config.tick_period = Duration::from_millis(ms);
        }
        source.apply("RS2_WORKER_THREADS", &mut config.worker_threads)?;
        source.apply("RS2_MAX_PLAYERS", &mut config.max_players)?;
        source.apply("RS2_MAX_NPCS", &mut config.max_npcs)?;
        source.apply("RS2_MAX_CONNECTIONS", &mut config.max_connections)?;
        source.apply("RS2_REVISION", &mut config.revision)?;
        if let Some(secs) = source.parse::<u64>("RS2_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        source.apply("RS2_INGRESS_CAPACITY", &mut config.ingress_capacity)?;
        source.apply("RS2_MAX_FRAMES_PER_READ", &mut config.max_frames_per_read)?;
        source.apply("RS2_MAX_OUTBOUND_BYTES", &mut config.max_outbound_bytes)?;
        source.apply("RS2_OVERRUN_POLICY", &mut config.overrun_policy)?;
        if let Some(name) = lookup("RS2_SERVER_NAME") {
            config.server_name = name;
        }

        if config.tick_period.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RS2_TICK_PERIOD_MS",
                value: "0".into(),
            });
        }
        Ok(config)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        }
    }

    fn apply<T: FromStr>(&self, key: &'static str, field: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.parse(key)? {
            *field = value;
        }
        Ok(())
    }
}
