//! Parallel Phases
//!
//! Parallel-for with a countdown barrier. The engine hands a phase the
//! exact set of entities it snapshotted, one task per entity runs on the
//! worker pool, and the engine thread blocks until the barrier hits zero.
//! The barrier is sized from the same vector the tasks are submitted from,
//! so the two counts cannot drift apart.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::game::content::EntityError;
use crate::game::entity::{Entity, EntityKey};

// =============================================================================
// COUNTDOWN LATCH
// =============================================================================

/// One-shot barrier released when its count reaches zero.
#[derive(Debug)]
pub struct CountdownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    /// Latch expecting `count` arrivals.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Record one arrival. Extra arrivals past zero are ignored.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Arrivals still outstanding.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until zero or `timeout`. Returns true if the latch opened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

// =============================================================================
// PHASES
// =============================================================================

/// Parallel phases of a tick, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Per-player update and packet flush.
    PlayerUpdate,
    /// Per-player end-of-tick reset.
    PlayerReset,
    /// Per-npc end-of-tick reset.
    NpcReset,
}

/// Outcome of one parallel phase.
#[derive(Debug)]
pub struct PhaseReport {
    /// Which phase.
    pub phase: Phase,
    /// Barrier size at phase start.
    pub expected: usize,
    /// Tasks handed to the pool.
    pub submitted: usize,
    /// Tasks that reported completion.
    pub completed: usize,
    /// Entities whose task failed or panicked.
    pub failures: Vec<(EntityKey, EntityError)>,
}

impl PhaseReport {
    /// True if every entity's task succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run `f`, turning a panic into [`EntityError::Panicked`].
pub fn guarded<F>(f: F) -> Result<(), EntityError>
where
    F: FnOnce() -> Result<(), EntityError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(EntityError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Fixed-size pool for the parallel phases.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Build a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("worker-{}", index))
            .build()?;
        Ok(Self { pool })
    }

    /// Worker count.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `task` once per entity in `items` and block until all are done.
    ///
    /// Each task gets exclusive access to its entity. Failures and panics
    /// are collected per entity and never cut the phase short.
    pub fn run_phase<T, F>(&self, phase: Phase, items: Vec<&mut T>, task: F) -> PhaseReport
    where
        T: Entity,
        F: Fn(&mut T) -> Result<(), EntityError> + Sync,
    {
        let expected = items.len();
        let latch = CountdownLatch::new(expected);
        let failures = Mutex::new(Vec::new());
        let mut submitted = 0;

        if expected > 0 {
            let (latch, failures, task) = (&latch, &failures, &task);
            self.pool.in_place_scope(|scope| {
                for item in items {
                    submitted += 1;
                    scope.spawn(move |_| {
                        let key = item.key();
                        if let Err(error) = guarded(|| task(item)) {
                            failures.lock().push((key, error));
                        }
                        latch.count_down();
                    });
                }
                latch.wait();
            });
        }

        PhaseReport {
            phase,
            expected,
            submitted,
            completed: expected - latch.count(),
            failures: failures.into_inner(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{Npc, Player, Position};
    use crate::game::world::World;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latch_opens_at_zero() {
        let latch = Arc::new(CountdownLatch::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down())
            })
            .collect();
        latch.wait();
        assert_eq!(latch.count(), 0);
        for handle in handles {
            handle.join().unwrap();
        }

        // Extra arrivals do not underflow.
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_latch_timeout() {
        let latch = CountdownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
        assert!(CountdownLatch::new(0).wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_hundred_players_barrier_then_reset() {
        let pool = WorkerPool::new(4).unwrap();
        let mut world = World::new(200, 0);
        for i in 0..100 {
            world.register_player(Player::new(format!("p{}", i), Position::default())).unwrap();
        }

        let log = Mutex::new(Vec::new());
        let updated = AtomicUsize::new(0);

        let players: Vec<&mut Player> = world.players_mut().collect();
        let update = pool.run_phase(Phase::PlayerUpdate, players, |player| {
            thread::sleep(Duration::from_micros(200));
            player.rights = 1;
            updated.fetch_add(1, Ordering::SeqCst);
            log.lock().push(Phase::PlayerUpdate);
            Ok(())
        });

        // The barrier released only after every update finished.
        assert_eq!(updated.load(Ordering::SeqCst), 100);
        assert_eq!((update.expected, update.submitted, update.completed), (100, 100, 100));
        assert!(update.is_clean());

        let players: Vec<&mut Player> = world.players_mut().collect();
        let reset = pool.run_phase(Phase::PlayerReset, players, |player| {
            assert_eq!(player.rights, 1);
            log.lock().push(Phase::PlayerReset);
            Ok(())
        });
        assert_eq!(reset.completed, 100);

        let log = log.into_inner();
        assert_eq!(log.len(), 200);
        assert!(log[..100].iter().all(|p| *p == Phase::PlayerUpdate));
        assert!(log[100..].iter().all(|p| *p == Phase::PlayerReset));
    }

    #[test]
    fn test_failures_and_panics_are_isolated() {
        let pool = WorkerPool::new(2).unwrap();
        let mut world = World::new(0, 10);
        for id in 0..10u16 {
            world.register_npc(Npc::new(id, Position::default())).unwrap();
        }

        let npcs: Vec<&mut Npc> = world.npcs_mut().collect();
        let report = pool.run_phase(Phase::NpcReset, npcs, |npc| match npc.npc_id {
            3 => Err(EntityError::Content("bad npc".into())),
            7 => panic!("npc 7 exploded"),
            _ => {
                npc.position.x = 1;
                Ok(())
            }
        });

        assert_eq!(report.completed, 10);
        assert_eq!(report.failures.len(), 2);
        let mut failed: Vec<u32> = report.failures.iter().map(|(key, _)| key.index).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![3, 7]);
        assert!(report
            .failures
            .iter()
            .any(|(_, e)| matches!(e, EntityError::Panicked(msg) if msg.contains("exploded"))));
        assert_eq!(world.npcs().filter(|npc| npc.position.x == 1).count(), 8);
    }

    #[test]
    fn test_empty_phase() {
        let pool = WorkerPool::new(1).unwrap();
        let report = pool.run_phase::<Npc, _>(Phase::NpcReset, Vec::new(), |_| Ok(()));
        assert_eq!((report.expected, report.submitted, report.completed), (0, 0, 0));
    }

    #[test]
    fn test_guarded_passes_errors_through() {
        assert!(guarded(|| Ok(())).is_ok());
        assert!(matches!(
            guarded(|| Err(EntityError::Content("x".into()))),
            Err(EntityError::Content(_))
        ));
        assert!(matches!(guarded(|| panic!("boom")), Err(EntityError::Panicked(m)) if m == "boom"));
    }
}
