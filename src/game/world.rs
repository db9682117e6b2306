//! Entity Registry
//!
//! Owns every live player and npc. Entities live in fixed-capacity slot
//! lists addressed by generational [`EntityKey`]s. Only the engine thread
//! mutates the world; worker tasks get exclusive `&mut` access to single
//! entities for the length of a phase and never see the registry itself.

use std::collections::HashMap;

use thiserror::Error;

use crate::game::entity::{Entity, EntityKey, EntityKind, Npc, Player};
use crate::network::session::SessionId;

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// Every slot of the collection is taken.
    #[error("no free {kind:?} slot (capacity {capacity})")]
    Full {
        /// Collection that is full.
        kind: EntityKind,
        /// Its capacity.
        capacity: usize,
    },

    /// A player with this name is already registered.
    #[error("{0} is already online")]
    AlreadyOnline(String),
}

// =============================================================================
// SLOT LIST
// =============================================================================

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entity: Option<T>,
}

/// Fixed-capacity slot list with generational keys.
///
/// Insert and remove are constant time: freed slots go on a stack and the
/// most recently freed one is reused first. Iteration is in slot order.
#[derive(Debug)]
pub struct EntityList<T: Entity> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<T: Entity> EntityList<T> {
    /// Create a list holding at most `capacity` entities.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    /// Live entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum live entities.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `entity` and assign its key.
    pub fn insert(&mut self, mut entity: T) -> Result<EntityKey, WorldError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    entity: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => {
                return Err(WorldError::Full {
                    kind: T::KIND,
                    capacity: self.capacity,
                })
            }
        };

        let slot = &mut self.slots[index as usize];
        let key = EntityKey {
            kind: T::KIND,
            index,
            generation: slot.generation,
        };
        entity.assign_key(key);
        slot.entity = Some(entity);
        self.len += 1;
        Ok(key)
    }

    fn slot(&self, key: EntityKey) -> Option<&Slot<T>> {
        if key.kind != T::KIND {
            return None;
        }
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }

    /// Remove the entity behind `key`. Stale or unknown keys return `None`.
    pub fn remove(&mut self, key: EntityKey) -> Option<T> {
        self.slot(key)?;
        let slot = &mut self.slots[key.index as usize];
        let entity = slot.entity.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(entity)
    }

    /// True if `key` resolves to a live entity.
    pub fn contains(&self, key: EntityKey) -> bool {
        self.get(key).is_some()
    }

    /// Entity behind `key`.
    pub fn get(&self, key: EntityKey) -> Option<&T> {
        self.slot(key)?.entity.as_ref()
    }

    /// Mutable entity behind `key`.
    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut T> {
        self.slot(key)?;
        self.slots[key.index as usize].entity.as_mut()
    }

    /// Live entities in slot order. Restartable: each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.entity.as_ref())
    }

    /// Mutable live entities in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.entity.as_mut())
    }

    /// Keys of live entities in slot order.
    pub fn keys(&self) -> Vec<EntityKey> {
        self.iter().map(Entity::key).collect()
    }
}

// =============================================================================
// WORLD
// =============================================================================

/// Entity removed from the world.
#[derive(Debug)]
pub enum Removed {
    /// A player.
    Player(Player),
    /// An npc.
    Npc(Npc),
}

/// Registry of all live entities.
#[derive(Debug)]
pub struct World {
    players: EntityList<Player>,
    npcs: EntityList<Npc>,
    by_name: HashMap<String, EntityKey>,
    by_session: HashMap<SessionId, EntityKey>,
}

impl World {
    /// Create an empty world.
    pub fn new(max_players: usize, max_npcs: usize) -> Self {
        Self {
            players: EntityList::with_capacity(max_players),
            npcs: EntityList::with_capacity(max_npcs),
            by_name: HashMap::new(),
            by_session: HashMap::new(),
        }
    }

    fn name_key(name: &str) -> String {
        name.trim().to_lowercase().replace('_', " ")
    }

    /// Register a player, indexing it by name and session.
    pub fn register_player(&mut self, player: Player) -> Result<EntityKey, WorldError> {
        let name = Self::name_key(&player.username);
        if self.by_name.contains_key(&name) {
            return Err(WorldError::AlreadyOnline(player.username));
        }
        let session = player.session().map(|session| session.id());
        let key = self.players.insert(player)?;
        self.by_name.insert(name, key);
        if let Some(session) = session {
            self.by_session.insert(session, key);
        }
        Ok(key)
    }

    /// Register an npc.
    pub fn register_npc(&mut self, npc: Npc) -> Result<EntityKey, WorldError> {
        self.npcs.insert(npc)
    }

    /// Remove whatever `key` refers to.
    ///
    /// Unregistering something that is already gone is a no-op.
    pub fn unregister(&mut self, key: EntityKey) -> Option<Removed> {
        match key.kind {
            EntityKind::Player => {
                let player = self.players.remove(key)?;
                self.by_name.remove(&Self::name_key(&player.username));
                if let Some(session) = player.session() {
                    self.by_session.remove(&session.id());
                }
                Some(Removed::Player(player))
            }
            EntityKind::Npc => self.npcs.remove(key).map(Removed::Npc),
        }
    }

    /// True if `key` is live.
    pub fn contains(&self, key: EntityKey) -> bool {
        match key.kind {
            EntityKind::Player => self.players.contains(key),
            EntityKind::Npc => self.npcs.contains(key),
        }
    }

    /// Player behind `key`.
    pub fn player(&self, key: EntityKey) -> Option<&Player> {
        self.players.get(key)
    }

    /// Mutable player behind `key`.
    pub fn player_mut(&mut self, key: EntityKey) -> Option<&mut Player> {
        self.players.get_mut(key)
    }

    /// Npc behind `key`.
    pub fn npc(&self, key: EntityKey) -> Option<&Npc> {
        self.npcs.get(key)
    }

    /// Mutable npc behind `key`.
    pub fn npc_mut(&mut self, key: EntityKey) -> Option<&mut Npc> {
        self.npcs.get_mut(key)
    }

    /// Online player with this name (case and underscore insensitive).
    pub fn player_by_name(&self, name: &str) -> Option<EntityKey> {
        self.by_name.get(&Self::name_key(name)).copied()
    }

    /// Player logged in on `session`.
    pub fn player_by_session(&self, session: SessionId) -> Option<EntityKey> {
        self.by_session.get(&session).copied()
    }

    /// Live players in slot order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.iter()
    }

    /// Live npcs in slot order.
    pub fn npcs(&self) -> impl Iterator<Item = &Npc> {
        self.npcs.iter()
    }

    /// Mutable live players in slot order.
    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.iter_mut()
    }

    /// Mutable live npcs in slot order.
    pub fn npcs_mut(&mut self) -> impl Iterator<Item = &mut Npc> {
        self.npcs.iter_mut()
    }

    /// Both collections at once, for phases that need them side by side.
    pub fn split_mut(&mut self) -> (&mut EntityList<Player>, &mut EntityList<Npc>) {
        (&mut self.players, &mut self.npcs)
    }

    /// Live player count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Live npc count.
    pub fn npc_count(&self) -> usize {
        self.npcs.len()
    }

    /// Close every session and drop every entity. Returns how many players
    /// were online.
    pub fn terminate(&mut self) -> usize {
        let online = self.players.len();
        for player in self.players.iter() {
            if let Some(session) = player.session() {
                session.close();
            }
        }
        for key in self.players.keys().into_iter().chain(self.npcs.keys()) {
            self.unregister(key);
        }
        online
    }
}

// =============================================================================
// DEFERRED REGISTRY CHANGES
// =============================================================================

/// A registry change requested during the serial pulse.
#[derive(Debug)]
pub enum RegistryOp {
    /// Spawn an npc.
    RegisterNpc(Npc),
    /// Remove an entity.
    Unregister(EntityKey),
}

/// Registry changes queued during the pulse and applied by the engine
/// before the parallel phases are sized.
#[derive(Debug, Default)]
pub struct RegistryOps {
    ops: Vec<RegistryOp>,
}

impl RegistryOps {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an npc spawn.
    pub fn register_npc(&mut self, npc: Npc) {
        self.ops.push(RegistryOp::RegisterNpc(npc));
    }

    /// Queue a removal.
    pub fn unregister(&mut self, key: EntityKey) {
        self.ops.push(RegistryOp::Unregister(key));
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Take queued changes in request order.
    pub fn drain(&mut self) -> impl Iterator<Item = RegistryOp> + '_ {
        self.ops.drain(..)
    }
}
