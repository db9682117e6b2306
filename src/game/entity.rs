//! Entity Model
//!
//! Players and NPCs plus the small value types they are built from.
//! Entities are plain data: the engine decides which thread may touch them
//! and when.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::network::encoder::OutboundPacket;
use crate::network::session::Session;

/// Distance (in tiles, per axis) at which entities can see each other.
pub const VIEW_DISTANCE: i32 = 15;

/// Longest walking queue a single path request may build.
pub const MAX_PATH_STEPS: usize = 100;

/// Commands a player may have queued before the oldest is dropped.
pub const MAX_PENDING_COMMANDS: usize = 32;

// =============================================================================
// KEYS
// =============================================================================

/// Which collection an entity lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Connected player.
    Player,
    /// Server-controlled character.
    Npc,
}

/// Generational slot key.
///
/// The generation changes every time a slot is reused, so a key held past
/// its entity's removal never resolves to the slot's next occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Owning collection.
    pub kind: EntityKind,
    /// Slot index.
    pub index: u32,
    /// Slot generation at registration time.
    pub generation: u32,
}

impl EntityKey {
    /// Key carried by an entity that has not been registered.
    pub const fn detached(kind: EntityKind) -> Self {
        Self {
            kind,
            index: u32::MAX,
            generation: 0,
        }
    }

    /// True once the world has assigned a slot.
    pub fn is_attached(&self) -> bool {
        self.index != u32::MAX
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntityKind::Player => "player",
            EntityKind::Npc => "npc",
        };
        write!(f, "{}#{}v{}", kind, self.index, self.generation)
    }
}

// =============================================================================
// POSITION
// =============================================================================

/// Tile coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// West to east.
    pub x: u16,
    /// South to north.
    pub y: u16,
    /// Height level.
    pub z: u8,
}

impl Position {
    /// Create a position.
    pub const fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Per-axis offset from `self` to `other`.
    pub fn delta(&self, other: &Position) -> (i32, i32) {
        (
            other.x as i32 - self.x as i32,
            other.y as i32 - self.y as i32,
        )
    }

    /// Same plane and within `distance` tiles on both axes.
    pub fn within_distance(&self, other: &Position, distance: i32) -> bool {
        if self.z != other.z {
            return false;
        }
        let (dx, dy) = self.delta(other);
        dx.abs() <= distance && dy.abs() <= distance
    }

    /// Within [`VIEW_DISTANCE`].
    pub fn is_viewable_from(&self, other: &Position) -> bool {
        self.within_distance(other, VIEW_DISTANCE)
    }

    /// Position one step in `direction`.
    pub fn step(&self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position {
            x: (self.x as i32 + dx) as u16,
            y: (self.y as i32 + dy) as u16,
            z: self.z,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One of the eight walking directions.
///
/// Discriminants are the client's direction ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// -x, +y
    NorthWest = 0,
    /// +y
    North = 1,
    /// +x, +y
    NorthEast = 2,
    /// -x
    West = 3,
    /// +x
    East = 4,
    /// -x, -y
    SouthWest = 5,
    /// -y
    South = 6,
    /// +x, -y
    SouthEast = 7,
}

impl Direction {
    /// Unit offset of this direction.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }

    /// Direction of a unit offset; `None` for `(0, 0)` or non-unit offsets.
    pub fn from_delta(dx: i32, dy: i32) -> Option<Direction> {
        Some(match (dx, dy) {
            (-1, 1) => Direction::NorthWest,
            (0, 1) => Direction::North,
            (1, 1) => Direction::NorthEast,
            (-1, 0) => Direction::West,
            (1, 0) => Direction::East,
            (-1, -1) => Direction::SouthWest,
            (0, -1) => Direction::South,
            (1, -1) => Direction::SouthEast,
            _ => return None,
        })
    }

    /// Client direction id.
    pub fn id(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// FLAGS
// =============================================================================

/// Activities an entity can be busy with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Activity {
    /// Gathering or producing.
    Skilling = 0,
    /// Fighting.
    Combat = 1,
    /// In a trade window.
    Trading = 2,
    /// Bank open.
    Banking = 3,
    /// Shop open.
    Shopping = 4,
    /// Talking to an npc.
    Dialogue = 5,
    /// Mid-teleport.
    Teleporting = 6,
}

impl Activity {
    /// Every activity.
    pub const ALL: [Activity; 7] = [
        Activity::Skilling,
        Activity::Combat,
        Activity::Trading,
        Activity::Banking,
        Activity::Shopping,
        Activity::Dialogue,
        Activity::Teleporting,
    ];

    #[inline]
    fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// Busy flags, one per [`Activity`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFlags(u16);

impl ActivityFlags {
    /// True if busy with `activity`.
    #[inline]
    pub fn is_busy(&self, activity: Activity) -> bool {
        self.0 & activity.bit() != 0
    }

    /// True if busy with anything.
    pub fn is_any_busy(&self) -> bool {
        self.0 != 0
    }

    /// Mark `activity` busy.
    pub fn set_busy(&mut self, activity: Activity) {
        self.0 |= activity.bit();
    }

    /// Mark `activity` idle.
    pub fn clear(&mut self, activity: Activity) {
        self.0 &= !activity.bit();
    }

    /// Mark everything idle.
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Iterate busy activities.
    pub fn iter(&self) -> impl Iterator<Item = Activity> + '_ {
        Activity::ALL.into_iter().filter(|a| self.is_busy(*a))
    }
}

/// Per-tick update markers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpdateFlag {
    /// Looks changed.
    Appearance = 0,
    /// Animation started.
    Animation = 1,
    /// Graphic started.
    Graphic = 2,
    /// Public chat.
    Chat = 3,
    /// Overhead text.
    ForcedChat = 4,
    /// Turned toward an entity.
    FaceEntity = 5,
    /// Turned toward a tile.
    FacePosition = 6,
    /// Took a hit.
    Hit = 7,
}

/// Set of [`UpdateFlag`]s raised this tick. Cleared by the reset phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFlags(u16);

impl UpdateFlags {
    /// Raise `flag`.
    pub fn set(&mut self, flag: UpdateFlag) {
        self.0 |= 1 << flag as u16;
    }

    /// True if `flag` is raised.
    pub fn contains(&self, flag: UpdateFlag) -> bool {
        self.0 & (1 << flag as u16) != 0
    }

    /// True if any update block must be sent.
    pub fn is_update_required(&self) -> bool {
        self.0 != 0
    }

    /// Drop every flag.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

// =============================================================================
// MOVEMENT
// =============================================================================

/// Directions walked during one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Steps {
    /// Walking step.
    pub primary: Option<Direction>,
    /// Second step when running.
    pub secondary: Option<Direction>,
}

/// Queue of unit steps toward a destination.
#[derive(Debug, Default, Clone)]
pub struct MovementQueue {
    steps: VecDeque<Position>,
    tail: Option<Position>,
    /// Run for every path, toggled by the client's run button.
    pub running: bool,
    run_path: bool,
    locked: bool,
}

impl MovementQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current path and start a new one from `origin`.
    pub fn begin_path(&mut self, origin: Position, run_path: bool) {
        self.steps.clear();
        self.tail = Some(origin);
        self.run_path = run_path;
    }

    /// Extend the path to `target`, one tile at a time.
    ///
    /// Diagonal segments are walked diagonally until one axis lines up, then
    /// straight. Steps past [`MAX_PATH_STEPS`] are dropped.
    pub fn add_to_path(&mut self, target: Position) {
        let mut current = match self.tail {
            Some(tail) => tail,
            None => {
                self.tail = Some(target);
                return;
            }
        };

        while current.x != target.x || current.y != target.y {
            if self.steps.len() >= MAX_PATH_STEPS {
                break;
            }
            let (dx, dy) = current.delta(&target);
            let Some(direction) = Direction::from_delta(dx.signum(), dy.signum()) else {
                break;
            };
            current = current.step(direction);
            self.steps.push_back(current);
        }
        self.tail = Some(current);
    }

    /// Clear the path.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.tail = None;
        self.run_path = false;
    }

    /// Queued steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when there is nowhere to walk.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True while walking requests are ignored.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lock or unlock walking. Locking clears the path.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
        if locked {
            self.reset();
        }
    }

    /// True if the current path is being run.
    pub fn is_running(&self) -> bool {
        self.running || self.run_path
    }

    /// Walk one step (two when running) from `position`.
    pub fn process(&mut self, position: &mut Position) -> Steps {
        let mut steps = Steps::default();
        if self.locked {
            return steps;
        }

        steps.primary = self.next_step(position);
        if steps.primary.is_some() && self.is_running() {
            steps.secondary = self.next_step(position);
        }
        if self.steps.is_empty() {
            self.run_path = false;
        }
        steps
    }

    fn next_step(&mut self, position: &mut Position) -> Option<Direction> {
        while let Some(next) = self.steps.pop_front() {
            let (dx, dy) = position.delta(&next);
            if let Some(direction) = Direction::from_delta(dx, dy) {
                *position = Position { z: position.z, ..next };
                return Some(direction);
            }
        }
        None
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// A typed `::command`, queued for content to consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Lower-cased command name.
    pub name: String,
    /// Lower-cased arguments.
    pub args: Vec<String>,
}

impl Command {
    /// Split raw input on whitespace. `None` for blank input.
    pub fn parse(raw: &str) -> Option<Command> {
        let lowered = raw.to_lowercase();
        let mut parts = lowered.split_whitespace().map(str::to_owned);
        let name = parts.next()?;
        Some(Command {
            name,
            args: parts.collect(),
        })
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Shared surface of players and NPCs.
pub trait Entity: Send {
    /// Collection this type lives in.
    const KIND: EntityKind;

    /// Current key; detached until registered.
    fn key(&self) -> EntityKey;

    /// Called by the world on registration.
    fn assign_key(&mut self, key: EntityKey);

    /// Current tile.
    fn position(&self) -> Position;

    /// Update markers raised this tick.
    fn update_flags(&self) -> UpdateFlags;
}

/// A logged-in player.
#[derive(Debug)]
pub struct Player {
    key: EntityKey,
    /// Formatted display name.
    pub username: String,
    session: Option<Arc<Session>>,
    /// Current tile.
    pub position: Position,
    /// Busy flags.
    pub activity: ActivityFlags,
    /// Update markers for this tick.
    pub update_flags: UpdateFlags,
    /// Walking queue.
    pub movement: MovementQueue,
    /// Steps taken this tick.
    pub steps: Steps,
    /// Staff rights level sent at login.
    pub rights: u8,
    /// Moved by teleport this tick.
    pub teleporting: bool,
    /// Crossed into a new map region this tick.
    pub region_changed: bool,
    commands: VecDeque<Command>,
    outbox: Vec<OutboundPacket>,
}

impl Player {
    /// Create an unregistered player.
    pub fn new(username: impl Into<String>, position: Position) -> Self {
        Self {
            key: EntityKey::detached(EntityKind::Player),
            username: username.into(),
            session: None,
            position,
            activity: ActivityFlags::default(),
            update_flags: UpdateFlags::default(),
            movement: MovementQueue::new(),
            steps: Steps::default(),
            rights: 0,
            teleporting: false,
            region_changed: false,
            commands: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    /// Attach the connection this player logged in on.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Connection, if any.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Queue a command for content.
    ///
    /// Holds at most [`MAX_PENDING_COMMANDS`]; past that the oldest command
    /// is dropped and returned.
    pub fn queue_command(&mut self, command: Command) -> Option<Command> {
        let dropped = if self.commands.len() >= MAX_PENDING_COMMANDS {
            self.commands.pop_front()
        } else {
            None
        };
        self.commands.push_back(command);
        dropped
    }

    /// Commands waiting for content.
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Take every queued command.
    pub fn take_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    /// Queue an outbound packet; the encoder sends it during the update phase.
    pub fn send(&mut self, packet: OutboundPacket) {
        self.outbox.push(packet);
    }

    /// Packets queued since the last flush.
    pub fn outbox(&self) -> &[OutboundPacket] {
        &self.outbox
    }

    /// Take queued packets.
    pub fn take_outbox(&mut self) -> Vec<OutboundPacket> {
        std::mem::take(&mut self.outbox)
    }

    /// End-of-tick cleanup.
    pub fn reset(&mut self) {
        self.update_flags.clear();
        self.teleporting = false;
        self.region_changed = false;
        self.steps = Steps::default();
    }
}

impl Entity for Player {
    const KIND: EntityKind = EntityKind::Player;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn assign_key(&mut self, key: EntityKey) {
        self.key = key;
    }

    fn position(&self) -> Position {
        self.position
    }

    fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player[{} {}]", self.username, self.key)
    }
}

/// A server-controlled character.
#[derive(Debug, Clone)]
pub struct Npc {
    key: EntityKey,
    /// Definition id.
    pub npc_id: u16,
    /// Current tile.
    pub position: Position,
    /// Busy flags.
    pub activity: ActivityFlags,
    /// Update markers for this tick.
    pub update_flags: UpdateFlags,
    /// Walking queue.
    pub movement: MovementQueue,
    /// Steps taken this tick.
    pub steps: Steps,
}

impl Npc {
    /// Create an unregistered npc.
    pub fn new(npc_id: u16, position: Position) -> Self {
        Self {
            key: EntityKey::detached(EntityKind::Npc),
            npc_id,
            position,
            activity: ActivityFlags::default(),
            update_flags: UpdateFlags::default(),
            movement: MovementQueue::new(),
            steps: Steps::default(),
        }
    }

    /// End-of-tick cleanup.
    pub fn reset(&mut self) {
        self.update_flags.clear();
        self.steps = Steps::default();
    }
}

impl Entity for Npc {
    const KIND: EntityKind = EntityKind::Npc;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn assign_key(&mut self, key: EntityKey) {
        self.key = key;
    }

    fn position(&self) -> Position {
        self.position
    }

    fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }
}

impl fmt::Display for Npc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "npc[{} {}]", self.npc_id, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_distance() {
        let origin = Position::new(3222, 3218, 0);
        assert!(origin.is_viewable_from(&Position::new(3237, 3203, 0)));
        assert!(!origin.is_viewable_from(&Position::new(3238, 3218, 0)));
        assert!(!origin.is_viewable_from(&Position::new(3222, 3218, 1)));
    }

    #[test]
    fn test_direction_ids_round_trip() {
        for id in 0..8u8 {
            let dir = [
                Direction::NorthWest,
                Direction::North,
                Direction::NorthEast,
                Direction::West,
                Direction::East,
                Direction::SouthWest,
                Direction::South,
                Direction::SouthEast,
            ][id as usize];
            assert_eq!(dir.id(), id);
            let (dx, dy) = dir.delta();
            assert_eq!(Direction::from_delta(dx, dy), Some(dir));
        }
        assert_eq!(Direction::from_delta(0, 0), None);
        assert_eq!(Direction::from_delta(2, 0), None);
    }

    #[test]
    fn test_activity_flags() {
        let mut flags = ActivityFlags::default();
        assert!(!flags.is_any_busy());
        flags.set_busy(Activity::Skilling);
        flags.set_busy(Activity::Trading);
        assert!(flags.is_busy(Activity::Skilling));
        assert!(!flags.is_busy(Activity::Combat));
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![Activity::Skilling, Activity::Trading]);

        flags.clear(Activity::Skilling);
        assert!(!flags.is_busy(Activity::Skilling));
        flags.clear_all();
        assert!(!flags.is_any_busy());
    }

    #[test]
    fn test_update_flags() {
        let mut flags = UpdateFlags::default();
        assert!(!flags.is_update_required());
        flags.set(UpdateFlag::Hit);
        assert!(flags.contains(UpdateFlag::Hit));
        assert!(!flags.contains(UpdateFlag::Chat));
        flags.clear();
        assert!(!flags.is_update_required());
    }

    #[test]
    fn test_path_decomposes_diagonals() {
        let start = Position::new(100, 100, 0);
        let mut queue = MovementQueue::new();
        queue.begin_path(start, false);
        queue.add_to_path(Position::new(103, 101, 0));
        assert_eq!(queue.len(), 3);

        let mut position = start;
        assert_eq!(queue.process(&mut position).primary, Some(Direction::NorthEast));
        assert_eq!(position, Position::new(101, 101, 0));
        assert_eq!(queue.process(&mut position).primary, Some(Direction::East));
        assert_eq!(queue.process(&mut position).primary, Some(Direction::East));
        assert_eq!(position, Position::new(103, 101, 0));
        assert_eq!(queue.process(&mut position), Steps::default());
    }

    #[test]
    fn test_running_takes_two_steps() {
        let start = Position::new(50, 50, 0);
        let mut queue = MovementQueue::new();
        queue.begin_path(start, true);
        queue.add_to_path(Position::new(50, 53, 0));

        let mut position = start;
        let steps = queue.process(&mut position);
        assert_eq!(steps.primary, Some(Direction::North));
        assert_eq!(steps.secondary, Some(Direction::North));
        assert_eq!(position, Position::new(50, 52, 0));

        let steps = queue.process(&mut position);
        assert_eq!(steps.secondary, None);
        assert!(!queue.is_running());
    }

    #[test]
    fn test_locked_queue_does_not_move() {
        let start = Position::new(10, 10, 0);
        let mut queue = MovementQueue::new();
        queue.begin_path(start, false);
        queue.add_to_path(Position::new(12, 10, 0));
        queue.set_locked(true);

        let mut position = start;
        assert_eq!(queue.process(&mut position), Steps::default());
        assert_eq!(position, start);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_path_is_capped() {
        let mut queue = MovementQueue::new();
        queue.begin_path(Position::new(0, 0, 0), false);
        queue.add_to_path(Position::new(1000, 0, 0));
        assert_eq!(queue.len(), MAX_PATH_STEPS);
    }

    #[test]
    fn test_command_parse() {
        let command = Command::parse("Tele 3222  3218").unwrap();
        assert_eq!(command.name, "tele");
        assert_eq!(command.args, vec!["3222", "3218"]);
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn test_player_reset_clears_tick_state() {
        let mut player = Player::new("Zezima", Position::default());
        player.update_flags.set(UpdateFlag::Animation);
        player.teleporting = true;
        player.region_changed = true;
        player.activity.set_busy(Activity::Banking);
        player.reset();

        assert!(!player.update_flags.is_update_required());
        assert!(!player.teleporting);
        assert!(!player.region_changed);
        // Busy flags persist across ticks.
        assert!(player.activity.is_busy(Activity::Banking));
        assert!(!player.key().is_attached());
    }

    #[test]
    fn test_command_queue_is_bounded() {
        let mut player = Player::new("Spammer", Position::default());
        for i in 0..500 {
            let dropped = player.queue_command(Command::parse(&format!("yell {}", i)).unwrap());
            assert_eq!(dropped.is_some(), i >= MAX_PENDING_COMMANDS);
        }
        assert_eq!(player.pending_commands(), MAX_PENDING_COMMANDS);

        // The newest commands survive.
        let commands = player.take_commands();
        assert_eq!(commands[0].args, vec![(500 - MAX_PENDING_COMMANDS).to_string()]);
        assert_eq!(commands[MAX_PENDING_COMMANDS - 1].args, vec!["499"]);
        assert_eq!(player.pending_commands(), 0);
    }
}
