//! Deferred Task Scheduler
//!
//! Delayed and recurring callbacks driven by the tick, independent of
//! entity pulses. Tasks run inline on the engine thread at the start of each
//! tick, so they are serialized with input handling and the pulse, never with
//! the parallel phases.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::error;

use crate::game::entity::{EntityKey, Npc, Player};
use crate::game::phase::panic_message;
use crate::game::world::{RegistryOps, World};

/// Task failures. A failed task is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task reported an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Delay units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkRate {
    /// One tick.
    #[default]
    Tick,
    /// Two ticks (1.2 seconds at the default period).
    ApproximateSecond,
    /// A hundred ticks (one minute at the default period).
    ApproximateMinute,
}

impl WorkRate {
    /// Ticks per unit.
    pub fn ticks(self) -> u32 {
        match self {
            WorkRate::Tick => 1,
            WorkRate::ApproximateSecond => 2,
            WorkRate::ApproximateMinute => 100,
        }
    }
}

type Work = Box<dyn FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send>;

/// External cancellation handle.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Stop the task before its next firing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A unit of deferred work.
pub struct Task {
    name: &'static str,
    delay: u32,
    remaining: u32,
    repeat: bool,
    owner: Option<EntityKey>,
    cancelled: Arc<AtomicBool>,
    work: Work,
}

impl Task {
    /// Task firing after `delay` ticks, and every `delay` ticks after that
    /// if `repeat` is set. A delay of zero fires on the first pulse.
    pub fn new<F>(delay: u32, repeat: bool, work: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            name: "task",
            delay,
            remaining: delay,
            repeat,
            owner: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            work: Box::new(work),
        }
    }

    /// Like [`Task::new`] with the delay counted in `rate` units.
    pub fn with_rate<F>(delay: u32, rate: WorkRate, repeat: bool, work: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + 'static,
    {
        Self::new(delay.saturating_mul(rate.ticks()), repeat, work)
    }

    /// Tie the task to an entity; it stops once that entity is gone.
    pub fn attach(mut self, key: EntityKey) -> Self {
        self.owner = Some(key);
        self
    }

    /// Name used in logs.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Handle for cancelling from outside.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Entity this task is attached to.
    pub fn owner(&self) -> Option<EntityKey> {
        self.owner
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Count one tick down; true if the task is due.
    fn countdown(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = self.delay;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("remaining", &self.remaining)
            .field("repeat", &self.repeat)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// What a firing task may touch.
pub struct TaskContext<'a> {
    tick: u64,
    world: &'a mut World,
    registry: &'a mut RegistryOps,
    follow_ups: &'a mut Vec<Task>,
    cancelled: bool,
}

impl<'a> TaskContext<'a> {
    /// Current tick number.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Read-only world.
    pub fn world(&self) -> &World {
        self.world
    }

    /// Mutable player.
    pub fn player_mut(&mut self, key: EntityKey) -> Option<&mut Player> {
        self.world.player_mut(key)
    }

    /// Mutable npc.
    pub fn npc_mut(&mut self, key: EntityKey) -> Option<&mut Npc> {
        self.world.npc_mut(key)
    }

    /// Spawn an npc at the end of the pulse step.
    pub fn spawn_npc(&mut self, npc: Npc) {
        self.registry.register_npc(npc);
    }

    /// Remove an entity at the end of the pulse step.
    pub fn unregister(&mut self, key: EntityKey) {
        self.registry.unregister(key);
    }

    /// Schedule another task, first counted down on the next pulse.
    pub fn submit(&mut self, task: Task) -> TaskHandle {
        let handle = task.handle();
        self.follow_ups.push(task);
        handle
    }

    /// Stop this task once the current firing returns.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}

/// Pending deferred tasks.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
    pending: Vec<Task>,
}

impl Scheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. It is first counted down on the next pulse.
    pub fn submit(&mut self, task: Task) -> TaskHandle {
        let handle = task.handle();
        self.pending.push(task);
        handle
    }

    /// Tasks not yet finished.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.pending.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task attached to `key`.
    pub fn cancel_attached(&mut self, key: EntityKey) {
        for task in self.tasks.iter().chain(self.pending.iter()) {
            if task.owner == Some(key) {
                task.cancelled.store(true, Ordering::Release);
            }
        }
    }

    /// Advance every task one tick and fire the ones that are due.
    /// Returns how many fired.
    pub fn pulse(&mut self, tick: u64, world: &mut World, registry: &mut RegistryOps) -> usize {
        self.tasks.append(&mut self.pending);

        let mut fired = 0;
        let mut follow_ups = Vec::new();

        self.tasks.retain_mut(|task| {
            if task.is_cancelled() {
                return false;
            }
            if let Some(owner) = task.owner {
                if !world.contains(owner) {
                    return false;
                }
            }
            if !task.countdown() {
                return true;
            }

            let mut ctx = TaskContext {
                tick,
                world: &mut *world,
                registry: &mut *registry,
                follow_ups: &mut follow_ups,
                cancelled: false,
            };
            let outcome = match catch_unwind(AssertUnwindSafe(|| (task.work)(&mut ctx))) {
                Ok(result) => result,
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            fired += 1;

            if let Err(e) = outcome {
                error!(task = task.name, tick, "Dropping failed task: {}", e);
                return false;
            }
            task.repeat && !ctx.cancelled && !task.is_cancelled()
        });

        self.pending.extend(follow_ups);
        fired
    }

    /// Drop every task.
    pub fn terminate(&mut self) {
        self.tasks.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Position;
    use std::sync::atomic::AtomicU32;

    fn run(scheduler: &mut Scheduler, world: &mut World, ticks: u64) {
        let mut registry = RegistryOps::new();
        for tick in 0..ticks {
            scheduler.pulse(tick, world, &mut registry);
        }
    }

    fn counter() -> (Arc<AtomicU32>, impl FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        (count, move |_: &mut TaskContext<'_>| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_zero_delay_fires_first_pulse() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        scheduler.submit(Task::new(0, false, work));

        run(&mut scheduler, &mut world, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_delay_and_repeat() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        scheduler.submit(Task::new(3, true, work));

        run(&mut scheduler, &mut world, 2);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        run(&mut scheduler, &mut world, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        run(&mut scheduler, &mut world, 6);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_work_rate_scales_delay() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        scheduler.submit(Task::with_rate(2, WorkRate::ApproximateSecond, false, work));

        run(&mut scheduler, &mut world, 3);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        run(&mut scheduler, &mut world, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(WorkRate::ApproximateMinute.ticks(), 100);
    }

    #[test]
    fn test_self_cancel_after_firing() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        scheduler.submit(Task::new(1, true, move |ctx| {
            if inner.fetch_add(1, Ordering::SeqCst) == 1 {
                ctx.cancel();
            }
            Ok(())
        }));

        run(&mut scheduler, &mut world, 10);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_handle_cancel() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        let handle = scheduler.submit(Task::new(1, true, work));

        run(&mut scheduler, &mut world, 2);
        handle.cancel();
        run(&mut scheduler, &mut world, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(handle.is_cancelled());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_failure_is_isolated() {
        let mut world = World::new(1, 1);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        scheduler.submit(Task::new(1, true, |_| Err(TaskError::failed("broken"))).named("broken"));
        scheduler.submit(Task::new(1, true, |_| panic!("task blew up")).named("panicky"));
        scheduler.submit(Task::new(1, true, work));

        run(&mut scheduler, &mut world, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_attached_task_stops_with_entity() {
        let mut world = World::new(1, 1);
        let key = world.register_npc(Npc::new(1, Position::default())).unwrap();
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        scheduler.submit(Task::new(1, true, work).attach(key));

        run(&mut scheduler, &mut world, 2);
        world.unregister(key);
        run(&mut scheduler, &mut world, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_empty());

        let other = world.register_npc(Npc::new(2, Position::default())).unwrap();
        let task = Task::new(1, true, |_| Ok(())).attach(other);
        let handle = scheduler.submit(task);
        scheduler.cancel_attached(other);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_follow_up_runs_next_pulse() {
        let mut world = World::new(1, 4);
        let mut scheduler = Scheduler::new();
        let (count, work) = counter();
        let mut work = Some(work);
        scheduler.submit(Task::new(0, false, move |ctx| {
            if let Some(work) = work.take() {
                ctx.submit(Task::new(0, false, work));
            }
            ctx.spawn_npc(Npc::new(9, Position::default()));
            Ok(())
        }));

        let mut registry = RegistryOps::new();
        assert_eq!(scheduler.pulse(0, &mut world, &mut registry), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(scheduler.pulse(1, &mut world, &mut registry), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_context_mutates_world() {
        let mut world = World::new(1, 1);
        let key = world.register_player(Player::new("Target", Position::default())).unwrap();
        let mut scheduler = Scheduler::new();
        scheduler.submit(Task::new(0, false, move |ctx| {
            let player = ctx.player_mut(key).ok_or_else(|| TaskError::failed("gone"))?;
            player.rights = 2;
            Ok(())
        }));
        run(&mut scheduler, &mut world, 1);
        assert_eq!(world.player(key).unwrap().rights, 2);
    }
}
