//! Tick Orchestrator
//!
//! The engine owns the world and runs one tick per period on its own
//! thread. Every tick performs, strictly in order:
//!
//! ```text
//!  1. scheduler pulse        serial   engine thread
//!  2. drain ingress          serial   engine thread
//!  3. entity pulse           serial   engine thread (players, then npcs)
//!  4. apply registry ops     serial   engine thread
//!  5. snapshot               serial   engine thread
//!  6. player update          parallel worker pool, barrier
//!  7. player reset           parallel worker pool, barrier
//!  8. npc reset              parallel worker pool, barrier
//! ```
//!
//! Entities that fault during steps 2-3 are removed in step 4, before the
//! parallel phases are sized. Entities that fault in a parallel phase are
//! removed once the last barrier opens.

use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::game::content::{Content, EntityError, PulseContext, WorldView};
use crate::game::entity::{Entity, EntityKey, Player, Position};
use crate::game::phase::{guarded, panic_message, Phase, PhaseReport, WorkerPool};
use crate::game::task::Scheduler;
use crate::game::world::{RegistryOp, RegistryOps, Removed, World, WorldError};
use crate::network::dispatch::DecoderRegistry;
use crate::network::encoder::PacketEncoder;
use crate::network::frame::Frame;
use crate::network::handshake::{LoginRequest, LoginResponse};
use crate::network::reactor::NetworkEvent;
use crate::network::session::{Session, SessionState};
use crate::server::StartupError;

/// Where new players appear.
pub const SPAWN_POSITION: Position = Position::new(3222, 3218, 0);

// =============================================================================
// TICK CLOCK
// =============================================================================

/// What to do with deadlines missed by a late tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Drop missed deadlines and stay on the period grid.
    #[default]
    Skip,
    /// Run missed ticks back to back until caught up.
    Burst,
    /// Restart the period from the end of the late tick.
    Delay,
}

impl FromStr for OverrunPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(OverrunPolicy::Skip),
            "burst" => Ok(OverrunPolicy::Burst),
            "delay" => Ok(OverrunPolicy::Delay),
            other => Err(format!("unknown overrun policy: {}", other)),
        }
    }
}

/// Tick deadlines.
///
/// Pure bookkeeping: the caller waits for [`TickClock::deadline`], runs the
/// tick, then reports the finish time to [`TickClock::complete`].
#[derive(Debug, Clone)]
pub struct TickClock {
    period: Duration,
    policy: OverrunPolicy,
    deadline: Instant,
}

impl TickClock {
    /// Clock whose first deadline is `start`.
    pub fn new(period: Duration, policy: OverrunPolicy, start: Instant) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            policy,
            deadline: start,
        }
    }

    /// When the next tick should start.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Overrun policy.
    pub fn policy(&self) -> OverrunPolicy {
        self.policy
    }

    /// The tick due at the current deadline finished at `now`. Moves the
    /// deadline and returns how many later deadlines had already passed.
    pub fn complete(&mut self, now: Instant) -> u32 {
        let due = self.deadline;
        let elapsed = now.saturating_duration_since(due);
        let missed = u32::try_from(elapsed.as_nanos() / self.period.as_nanos()).unwrap_or(u32::MAX);

        self.deadline = match self.policy {
            OverrunPolicy::Skip => due + self.period * missed.saturating_add(1),
            OverrunPolicy::Burst => due + self.period,
            OverrunPolicy::Delay if missed > 0 => now + self.period,
            OverrunPolicy::Delay => due + self.period,
        };
        missed
    }
}

// =============================================================================
// TICK REPORT
// =============================================================================

/// What one tick did.
#[derive(Debug)]
pub struct TickReport {
    /// Tick number, from zero.
    pub tick: u64,
    /// Scheduled tasks that fired.
    pub tasks_fired: usize,
    /// Network events applied.
    pub events: usize,
    /// Faults raised by decode or pulse, before the parallel phases.
    pub faults: Vec<(EntityKey, EntityError)>,
    /// Parallel phases in execution order.
    pub phases: Vec<PhaseReport>,
    /// Entities removed this tick for any reason.
    pub removed: usize,
    /// Wall time spent.
    pub elapsed: Duration,
}

impl TickReport {
    /// Faults from every step, parallel phases included.
    pub fn fault_count(&self) -> usize {
        self.faults.len() + self.phases.iter().map(|p| p.failures.len()).sum::<usize>()
    }

    /// Report of `phase`, if it ran.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|report| report.phase == phase)
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// The authoritative simulation.
pub struct Engine {
    config: ServerConfig,
    world: World,
    scheduler: Scheduler,
    registry: RegistryOps,
    decoders: DecoderRegistry,
    encoder: PacketEncoder,
    pool: WorkerPool,
    content: Arc<dyn Content>,
    ingress: Receiver<NetworkEvent>,
    tick: u64,
}

impl Engine {
    /// Build the world, decoder table and worker pool.
    pub fn new(
        config: &ServerConfig,
        content: Arc<dyn Content>,
        ingress: Receiver<NetworkEvent>,
    ) -> Result<Self, StartupError> {
        let decoders = DecoderRegistry::with_builtins(content.decoders())?;
        let pool = WorkerPool::new(config.worker_threads)?;
        debug!(opcodes = decoders.len(), workers = pool.threads(), "Engine built");

        Ok(Self {
            config: config.clone(),
            world: World::new(config.max_players, config.max_npcs),
            scheduler: Scheduler::new(),
            registry: RegistryOps::new(),
            decoders,
            encoder: PacketEncoder::new(),
            pool,
            content,
            ingress,
            tick: 0,
        })
    }

    /// The world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// The world, for setup outside a tick.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// The task scheduler.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Run one full tick.
    #[instrument(name = "tick", skip_all, fields(tick = self.tick))]
    pub fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        let tick = self.tick;
        let mut faults = Vec::new();
        let mut removed = 0;

        // 1. Deferred tasks
        let tasks_fired = self.scheduler.pulse(tick, &mut self.world, &mut self.registry);

        // 2. Network input
        let events = self.drain_ingress(&mut faults, &mut removed);

        // 3. Serial pulse
        self.pulse(tick, &mut faults);

        // 4. Registry changes, faulted entities included
        removed += self.apply_registry();

        // 5. Snapshot; membership is fixed from here on
        let view = WorldView::capture(tick, &self.world);
        let phases = self.run_phases(&view);

        let failed: Vec<EntityKey> = phases
            .iter()
            .flat_map(|report| report.failures.iter())
            .map(|(key, error)| {
                warn!(entity = %key, "Entity fault: {}", error);
                *key
            })
            .collect();
        for key in failed {
            if self.remove(key) {
                removed += 1;
            }
        }

        self.tick += 1;
        let report = TickReport {
            tick,
            tasks_fired,
            events,
            faults,
            phases,
            removed,
            elapsed: started.elapsed(),
        };
        debug!(
            tasks = report.tasks_fired,
            events = report.events,
            faults = report.fault_count(),
            removed = report.removed,
            elapsed = ?report.elapsed,
            "Tick complete"
        );
        report
    }

    fn drain_ingress(&mut self, faults: &mut Vec<(EntityKey, EntityError)>, removed: &mut usize) -> usize {
        // Only what was queued when the step began; later events wait a tick.
        let queued = self.ingress.len();
        let mut applied = 0;
        for _ in 0..queued {
            let Ok(event) = self.ingress.try_recv() else {
                break;
            };
            applied += 1;
            match event {
                NetworkEvent::Login { session, request } => self.login(&session, &request),
                NetworkEvent::Frame { session, frame } => {
                    if let Some((key, error)) = self.apply_frame(&session, &frame) {
                        warn!(entity = %key, session = %session.id(), "Entity fault: {}", error);
                        if self.remove(key) {
                            *removed += 1;
                        }
                        faults.push((key, error));
                    }
                }
                NetworkEvent::Disconnected { session } => {
                    if let Some(key) = self.world.player_by_session(session.id()) {
                        if self.remove(key) {
                            *removed += 1;
                        }
                    }
                }
            }
        }
        applied
    }

    fn apply_frame(&mut self, session: &Session, frame: &Frame) -> Option<(EntityKey, EntityError)> {
        let Some(key) = self.world.player_by_session(session.id()) else {
            debug!(session = %session.id(), opcode = frame.opcode, "Frame for a session with no player");
            return None;
        };
        let player = self.world.player_mut(key)?;
        let decoders = &self.decoders;
        guarded(|| decoders.dispatch(player, frame).map(|_| ()).map_err(EntityError::from))
            .err()
            .map(|error| (key, error))
    }

    fn login(&mut self, session: &Arc<Session>, request: &LoginRequest) {
        if !session.is_open() {
            debug!(session = %session.id(), "Session closed before login was answered");
            return;
        }

        match self.admit(session, request) {
            Ok(key) => {
                let rights = self.world.player(key).map_or(0, |player| player.rights);
                session.bind_player(key);
                session.advance(SessionState::Established);
                if let Err(e) = session.queue_raw(&LoginResponse::Success.to_bytes(rights)) {
                    warn!(session = %session.id(), "Login response not queued: {}", e);
                    self.remove(key);
                    return;
                }
                info!(session = %session.id(), player = %key, "{} logged in", request.display_name());
            }
            Err(response) => {
                if let Err(e) = session.queue_raw(&response.to_bytes(0)) {
                    debug!(session = %session.id(), "Refusal code not queued: {}", e);
                }
                session.close();
                info!(session = %session.id(), code = response.code(), "Login refused for {}", request.display_name());
            }
        }
    }

    fn admit(&mut self, session: &Arc<Session>, request: &LoginRequest) -> Result<EntityKey, LoginResponse> {
        request.validate()?;

        let name = request.display_name();
        if self.world.player_count() >= self.config.max_players {
            return Err(LoginResponse::WorldFull);
        }
        if self.world.player_by_name(&name).is_some() {
            return Err(LoginResponse::AlreadyOnline);
        }

        let mut player = Player::new(name, SPAWN_POSITION).with_session(session.clone());
        let content = &*self.content;
        match catch_unwind(AssertUnwindSafe(|| content.on_login(&mut player, request))) {
            Ok(result) => result?,
            Err(payload) => {
                error!(session = %session.id(), "Login hook panicked: {}", panic_message(payload.as_ref()));
                return Err(LoginResponse::InvalidCredentials);
            }
        }

        self.world.register_player(player).map_err(|e| match e {
            WorldError::Full { .. } => LoginResponse::WorldFull,
            WorldError::AlreadyOnline(_) => LoginResponse::AlreadyOnline,
        })
    }

    fn pulse(&mut self, tick: u64, faults: &mut Vec<(EntityKey, EntityError)>) {
        let content = &*self.content;
        let mut ctx = PulseContext::new(tick, &mut self.scheduler, &mut self.registry);
        let mut failed = Vec::new();

        for player in self.world.players_mut() {
            let key = player.key();
            let result = guarded(|| {
                player.steps = player.movement.process(&mut player.position);
                content.pulse_player(player, &mut ctx)
            });
            if let Err(error) = result {
                warn!(entity = %key, player = %player.username, "Entity fault: {}", error);
                failed.push((key, error));
            }
        }

        for npc in self.world.npcs_mut() {
            let key = npc.key();
            let result = guarded(|| {
                npc.steps = npc.movement.process(&mut npc.position);
                content.pulse_npc(npc, &mut ctx)
            });
            if let Err(error) = result {
                warn!(entity = %key, "Entity fault: {}", error);
                failed.push((key, error));
            }
        }

        for (key, error) in failed {
            ctx.unregister(key);
            faults.push((key, error));
        }
    }

    fn apply_registry(&mut self) -> usize {
        let ops: Vec<RegistryOp> = self.registry.drain().collect();
        let mut removed = 0;
        for op in ops {
            match op {
                RegistryOp::RegisterNpc(npc) => {
                    if let Err(e) = self.world.register_npc(npc) {
                        warn!("Npc spawn dropped: {}", e);
                    }
                }
                RegistryOp::Unregister(key) => {
                    if self.remove(key) {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    fn run_phases(&mut self, view: &WorldView) -> Vec<PhaseReport> {
        let content = &*self.content;
        let encoder = &self.encoder;
        let (players, npcs) = self.world.split_mut();

        let update = self.pool.run_phase(Phase::PlayerUpdate, players.iter_mut().collect(), |player| {
            content.update_player(player, view)?;
            if player.session().is_some_and(|session| !session.is_open()) {
                player.take_outbox();
                return Ok(());
            }
            encoder.flush(player)?;
            Ok(())
        });

        let player_reset = self.pool.run_phase(Phase::PlayerReset, players.iter_mut().collect(), |player| {
            player.reset();
            content.reset_player(player)
        });

        let npc_reset = self.pool.run_phase(Phase::NpcReset, npcs.iter_mut().collect(), |npc| {
            npc.reset();
            content.reset_npc(npc)
        });

        vec![update, player_reset, npc_reset]
    }

    /// Remove an entity, closing its session and cancelling its tasks.
    /// Returns false if it was already gone.
    fn remove(&mut self, key: EntityKey) -> bool {
        self.scheduler.cancel_attached(key);
        match self.world.unregister(key) {
            Some(Removed::Player(player)) => {
                if let Some(session) = player.session() {
                    session.close();
                }
                let content = &*self.content;
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| content.on_logout(&player))) {
                    error!(player = %key, "Logout hook panicked: {}", panic_message(payload.as_ref()));
                }
                info!(player = %key, "{} logged out", player.username);
                true
            }
            Some(Removed::Npc(_)) => true,
            None => false,
        }
    }

    /// Log everyone out and drop every task.
    pub fn terminate(&mut self) {
        let keys: Vec<EntityKey> = self.world.players().map(Entity::key).collect();
        let online = keys.len();
        for key in keys {
            self.remove(key);
        }
        self.world.terminate();
        self.scheduler.terminate();
        info!(online, ticks = self.tick, "Engine terminated");
    }

    /// Start ticking on the `engine` thread.
    pub fn spawn(self) -> io::Result<EngineHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("engine".into())
            .spawn(move || self.run(stop_rx))?;
        Ok(EngineHandle {
            stop: stop_tx,
            thread: Some(thread),
        })
    }

    fn run(mut self, stop: Receiver<()>) -> Engine {
        let mut clock = TickClock::new(self.config.tick_period, self.config.overrun_policy, Instant::now());
        info!(period = ?clock.period(), policy = ?clock.policy(), "Engine started");

        loop {
            match stop.recv_deadline(clock.deadline()) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let report = self.tick();
            let missed = clock.complete(Instant::now());
            if missed > 0 {
                warn!(
                    tick = report.tick,
                    elapsed = ?report.elapsed,
                    period = ?clock.period(),
                    missed,
                    "Tick overran its period"
                );
            }
        }

        self.terminate();
        self
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tick", &self.tick)
            .field("players", &self.world.player_count())
            .field("npcs", &self.world.npc_count())
            .field("tasks", &self.scheduler.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Running engine thread.
pub struct EngineHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<Engine>>,
}

impl EngineHandle {
    /// Stop ticking and join the thread. The returned engine has already
    /// logged everyone out; `None` if the thread panicked.
    pub fn stop(mut self) -> Option<Engine> {
        self.join()
    }

    fn join(&mut self) -> Option<Engine> {
        let _ = self.stop.try_send(());
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                error!("Engine thread panicked");
                None
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ByteOrder, IsaacCipher, ValueType, WriteBuffer};
    use crate::game::entity::{EntityKind, Npc, UpdateFlag};
    use crate::game::task::Task;
    use crate::network::decoders::WALK_GROUND;
    use crate::network::encoder::OutboundPacket;
    use crate::network::session::SessionId;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ServerConfig {
        ServerConfig {
            worker_threads: 4,
            max_players: 200,
            max_npcs: 200,
            ..ServerConfig::default()
        }
    }

    fn engine(content: impl Content) -> (Engine, Sender<NetworkEvent>) {
        let (tx, rx) = bounded(1024);
        (Engine::new(&config(), Arc::new(content), rx).unwrap(), tx)
    }

    fn session(id: u64) -> Arc<Session> {
        let session = Arc::new(Session::new(SessionId(id), "127.0.0.1:1".parse().unwrap(), 4096));
        session.advance(SessionState::Handshaking);
        session.set_encryptor(IsaacCipher::new(&[1, 2, 3, 4]));
        session
    }

    fn request(name: &str) -> LoginRequest {
        LoginRequest {
            reconnecting: false,
            revision: 317,
            low_memory: false,
            client_key: 1,
            server_key: 2,
            uid: 0,
            username: name.into(),
            password: "hunter2".into(),
        }
    }

    fn login(engine: &mut Engine, tx: &Sender<NetworkEvent>, id: u64, name: &str) -> (Arc<Session>, EntityKey) {
        let session = session(id);
        tx.send(NetworkEvent::Login { session: session.clone(), request: request(name) }).unwrap();
        engine.tick();
        let key = engine.world().player_by_session(session.id()).unwrap();
        (session, key)
    }

    #[derive(Default)]
    struct Faulty {
        updated: AtomicUsize,
        reset: AtomicUsize,
    }

    impl Content for Faulty {
        fn pulse_player(&self, player: &mut Player, _ctx: &mut PulseContext<'_>) -> Result<(), EntityError> {
            match player.username.as_str() {
                "Broken" => Err(EntityError::content("broken pulse")),
                "Panicky" => panic!("pulse exploded"),
                _ => Ok(()),
            }
        }

        fn pulse_npc(&self, npc: &mut Npc, _ctx: &mut PulseContext<'_>) -> Result<(), EntityError> {
            if npc.npc_id == 13 {
                return Err(EntityError::content("unlucky"));
            }
            Ok(())
        }

        fn update_player(&self, player: &mut Player, view: &WorldView) -> Result<(), EntityError> {
            assert!(view.players().iter().all(|s| s.key != player.key() || s.position == player.position));
            self.updated.fetch_add(1, Ordering::SeqCst);
            player.send(OutboundPacket::message("tick"));
            Ok(())
        }

        fn reset_player(&self, _player: &mut Player) -> Result<(), EntityError> {
            self.reset.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_login_success_and_duplicate() {
        let (mut engine, tx) = engine(Faulty::default());
        let (session, key) = login(&mut engine, &tx, 1, "alice");

        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.player(), Some(key));
        assert_eq!(engine.world().player(key).unwrap().username, "Alice");
        let out = session.take_outbound().unwrap();
        assert_eq!(&out[..3], &[2, 0, 0]);

        let second = self::session(2);
        tx.send(NetworkEvent::Login { session: second.clone(), request: request("ALICE") }).unwrap();
        engine.tick();
        assert_eq!(second.take_outbound().unwrap().as_ref(), &[5]);
        assert!(!second.is_open());
        assert_eq!(engine.world().player_count(), 1);
    }

    #[test]
    fn test_login_refusals() {
        let (tx, rx) = bounded(16);
        let config = ServerConfig { max_players: 1, ..config() };
        let mut engine = Engine::new(&config, Arc::new(Faulty::default()), rx).unwrap();

        let bad = session(1);
        let mut req = request("bob");
        req.password.clear();
        tx.send(NetworkEvent::Login { session: bad.clone(), request: req }).unwrap();
        login(&mut engine, &tx, 2, "carol");
        assert_eq!(bad.take_outbound().unwrap().as_ref(), &[3]);

        let full = session(3);
        tx.send(NetworkEvent::Login { session: full.clone(), request: request("dave") }).unwrap();
        engine.tick();
        assert_eq!(full.take_outbound().unwrap().as_ref(), &[7]);
        assert_eq!(full.state(), SessionState::Closing);
    }

    #[test]
    fn test_pulse_fault_is_isolated() {
        let content = Arc::new(Faulty::default());
        let (tx, rx) = bounded(64);
        let mut engine = Engine::new(&config(), content.clone(), rx).unwrap();

        let _tx = tx;
        let mut sessions = Vec::new();
        for (id, name) in ["One", "Broken", "Two", "Panicky", "Three"].iter().enumerate() {
            let session = session(id as u64 + 1);
            session.advance(SessionState::Established);
            let player = Player::new(*name, SPAWN_POSITION).with_session(session.clone());
            engine.world_mut().register_player(player).unwrap();
            sessions.push(session);
        }
        let unlucky = engine.world_mut().register_npc(Npc::new(13, SPAWN_POSITION)).unwrap();
        engine.world_mut().register_npc(Npc::new(14, SPAWN_POSITION)).unwrap();
        let report = engine.tick();

        assert_eq!(report.faults.len(), 3);
        let update = report.phase(Phase::PlayerUpdate).unwrap();
        assert_eq!((update.expected, update.submitted, update.completed), (3, 3, 3));
        assert_eq!(report.phase(Phase::NpcReset).unwrap().expected, 1);
        assert_eq!(content.updated.load(Ordering::SeqCst), 3);
        assert_eq!(content.reset.load(Ordering::SeqCst), 3);

        let names: Vec<_> = engine.world().players().map(|p| p.username.clone()).collect();
        assert_eq!(names, vec!["One", "Two", "Three"]);
        assert!(engine.world().npc(unlucky).is_none());
        assert!(!sessions[1].is_open());
        assert!(!sessions[3].is_open());
        // Faulted players get no further packets; the rest get their update.
        assert!(sessions[1].take_outbound().is_none());
        assert!(sessions[0].is_open());
        assert!(sessions[0].take_outbound().is_some());

        let next = engine.tick();
        assert!(next.faults.is_empty());
        assert_eq!(next.phase(Phase::PlayerUpdate).unwrap().expected, 3);
    }

    #[test]
    fn test_hundred_player_phases() {
        let content = Arc::new(Faulty::default());
        let (_tx, rx) = bounded(1);
        let mut engine = Engine::new(&config(), content.clone(), rx).unwrap();
        for i in 0..100 {
            let mut player = Player::new(format!("p{}", i), SPAWN_POSITION);
            player.update_flags.set(UpdateFlag::Appearance);
            engine.world_mut().register_player(player).unwrap();
        }

        let report = engine.tick();
        for phase in [Phase::PlayerUpdate, Phase::PlayerReset] {
            let phase = report.phase(phase).unwrap();
            assert_eq!((phase.expected, phase.submitted, phase.completed), (100, 100, 100));
        }
        assert_eq!(content.updated.load(Ordering::SeqCst), 100);
        assert_eq!(content.reset.load(Ordering::SeqCst), 100);
        assert!(engine.world().players().all(|p| !p.update_flags.is_update_required()));
    }

    #[test]
    fn test_walk_frame_moves_player() {
        let (mut engine, tx) = engine(Faulty::default());
        let (session, key) = login(&mut engine, &tx, 1, "walker");

        let mut payload = WriteBuffer::new();
        payload.write_u16(SPAWN_POSITION.x + 3, ValueType::A, ByteOrder::Little).unwrap();
        payload.write_u16(SPAWN_POSITION.y, ValueType::Standard, ByteOrder::Little).unwrap();
        payload.write_u8(0, ValueType::C);
        tx.send(NetworkEvent::Frame { session: session.clone(), frame: Frame::new(WALK_GROUND, payload.freeze()) })
            .unwrap();
        // Unknown opcodes are dropped without closing anything.
        tx.send(NetworkEvent::Frame { session: session.clone(), frame: Frame::new(200, vec![1, 2, 3]) }).unwrap();

        let report = engine.tick();
        assert!(report.faults.is_empty());
        assert!(session.is_open());
        let player = engine.world().player(key).unwrap();
        assert_eq!(player.position, Position::new(SPAWN_POSITION.x + 1, SPAWN_POSITION.y, 0));
        assert_eq!(player.movement.len(), 2);
    }

    #[test]
    fn test_malformed_frame_disconnects() {
        let (mut engine, tx) = engine(Faulty::default());
        let (session, key) = login(&mut engine, &tx, 1, "cheater");

        tx.send(NetworkEvent::Frame { session: session.clone(), frame: Frame::new(WALK_GROUND, vec![1, 2]) }).unwrap();
        let report = engine.tick();

        assert_eq!(report.faults.len(), 1);
        assert!(matches!(report.faults[0].1, EntityError::Decode(_)));
        assert!(!engine.world().contains(key));
        assert!(!session.is_open());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut engine, tx) = engine(Faulty::default());
        let (session, key) = login(&mut engine, &tx, 1, "leaver");
        let handle = engine.scheduler_mut().submit(Task::new(5, true, |_| Ok(())).attach(key));

        tx.send(NetworkEvent::Disconnected { session: session.clone() }).unwrap();
        tx.send(NetworkEvent::Disconnected { session }).unwrap();
        let report = engine.tick();

        assert_eq!(report.events, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(engine.world().player_count(), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_tasks_run_before_pulse() {
        let (mut engine, _tx) = engine(Faulty::default());
        engine.scheduler_mut().submit(Task::new(0, false, |ctx| {
            ctx.spawn_npc(Npc::new(7, SPAWN_POSITION));
            Ok(())
        }));

        let report = engine.tick();
        assert_eq!(report.tasks_fired, 1);
        // Spawned during the tick, sized into the same tick's npc phase.
        assert_eq!(report.phase(Phase::NpcReset).unwrap().expected, 1);
        assert_eq!(engine.world().npcs().next().unwrap().key().kind, EntityKind::Npc);
        assert_eq!(engine.ticks(), 1);
    }

    #[test]
    fn test_engine_thread_stops_promptly() {
        let (tx, rx) = bounded(16);
        let config = ServerConfig { tick_period: Duration::from_millis(10), ..config() };
        let engine = Engine::new(&config, Arc::new(Faulty::default()), rx).unwrap();
        let session = session(1);
        tx.send(NetworkEvent::Login { session: session.clone(), request: request("stayer") }).unwrap();

        let handle = engine.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let engine = handle.stop().unwrap();

        assert!(engine.ticks() >= 1);
        assert_eq!(engine.world().player_count(), 0);
        assert!(!session.is_open());
    }

    #[derive(Default)]
    struct Slow {
        pulses: parking_lot::Mutex<Vec<(u64, Instant, Instant)>>,
        updates: parking_lot::Mutex<Vec<(u64, Instant)>>,
    }

    impl Content for Slow {
        fn pulse_player(&self, _player: &mut Player, ctx: &mut PulseContext<'_>) -> Result<(), EntityError> {
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(25));
            self.pulses.lock().push((ctx.tick(), start, Instant::now()));
            Ok(())
        }

        fn update_player(&self, _player: &mut Player, view: &WorldView) -> Result<(), EntityError> {
            self.updates.lock().push((view.tick(), Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn test_slow_ticks_never_overlap() {
        let content = Arc::new(Slow::default());
        let (_tx, rx) = bounded(1);
        let config = ServerConfig { tick_period: Duration::from_millis(10), ..config() };
        let mut engine = Engine::new(&config, content.clone(), rx).unwrap();
        engine.world_mut().register_player(Player::new("Sloth", SPAWN_POSITION)).unwrap();

        let handle = engine.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let engine = handle.stop().unwrap();

        let pulses = content.pulses.lock().clone();
        let updates = content.updates.lock().clone();
        assert!(pulses.len() >= 2, "only {} ticks ran", pulses.len());
        assert_eq!(pulses.len() as u64, engine.ticks());
        assert_eq!(updates.len(), pulses.len());

        for (i, (tick, _, _)) in pulses.iter().enumerate() {
            assert_eq!(*tick, i as u64);
            assert_eq!(updates[i].0, i as u64);
        }
        // Each tick starts only after the previous one's last phase is done.
        for pair in 0..pulses.len() - 1 {
            let (_, _, pulse_end) = pulses[pair];
            let (_, update_end) = updates[pair];
            let (_, next_start, _) = pulses[pair + 1];
            assert!(update_end >= pulse_end);
            assert!(next_start >= update_end);
        }
    }

    #[test]
    fn test_clock_on_time() {
        let start = Instant::now();
        let period = Duration::from_millis(600);
        for policy in [OverrunPolicy::Skip, OverrunPolicy::Burst, OverrunPolicy::Delay] {
            let mut clock = TickClock::new(period, policy, start);
            assert_eq!(clock.complete(start + Duration::from_millis(100)), 0);
            assert_eq!(clock.deadline(), start + period);
        }
    }

    #[test]
    fn test_clock_skip_realigns() {
        let start = Instant::now();
        let period = Duration::from_millis(600);
        let mut clock = TickClock::new(period, OverrunPolicy::Skip, start);
        assert_eq!(clock.complete(start + Duration::from_millis(1500)), 2);
        assert_eq!(clock.deadline(), start + Duration::from_millis(1800));
    }

    #[test]
    fn test_clock_burst_catches_up() {
        let start = Instant::now();
        let period = Duration::from_millis(600);
        let mut clock = TickClock::new(period, OverrunPolicy::Burst, start);
        let late = start + Duration::from_millis(1500);
        assert_eq!(clock.complete(late), 2);
        assert_eq!(clock.deadline(), start + period);
        // Next two ticks are already due.
        assert!(clock.deadline() < late);
        clock.complete(late);
        assert!(clock.deadline() < late);
        clock.complete(late);
        assert!(clock.deadline() > late);
    }

    #[test]
    fn test_clock_delay_restarts_period() {
        let start = Instant::now();
        let period = Duration::from_millis(600);
        let mut clock = TickClock::new(period, OverrunPolicy::Delay, start);
        let late = start + Duration::from_millis(700);
        assert_eq!(clock.complete(late), 1);
        assert_eq!(clock.deadline(), late + period);
    }

    #[test]
    fn test_overrun_policy_parse() {
        assert_eq!("Skip".parse::<OverrunPolicy>(), Ok(OverrunPolicy::Skip));
        assert_eq!("delay".parse::<OverrunPolicy>(), Ok(OverrunPolicy::Delay));
        assert!("later".parse::<OverrunPolicy>().is_err());
    }
}
