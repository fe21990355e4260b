//! Box slot pool
//!
//! Hands out exclusive sandbox slot ids in `0..=max_id`. Callers that find no
//! free slot wait in FIFO order. Every lease carries an idle timer that
//! reclaims the slot if the holder neither renews nor releases it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cloneable handle to a shared slot pool
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<Inner>,
}

/// Proof of holding slot `id`.
///
/// Release and renewal only act while this is still the slot's current
/// lease, so a holder whose slot was reclaimed cannot touch the next owner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    pub id: u32,
    generation: u64,
}

struct Inner {
    max_id: u32,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
}

struct HeldSlot {
    /// Distinguishes this lease from earlier leases of the same id
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    held: BTreeMap<u32, HeldSlot>,
    waiters: VecDeque<oneshot::Sender<SlotLease>>,
    next_generation: u64,
}

impl SlotPool {
    pub fn new(max_id: u32, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_id,
                idle_timeout,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn max_id(&self) -> u32 {
        self.inner.max_id
    }

    /// Acquire the lowest free slot, waiting in FIFO order if none is free
    pub async fn acquire(&self) -> SlotLease {
        loop {
            let rx = {
                let mut state = self.lock();
                let free = (0..=self.inner.max_id).find(|id| !state.held.contains_key(id));
                if let Some(id) = free {
                    let lease = self.grant(&mut state, id);
                    debug!(slot = id, "Acquired slot");
                    return lease;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            // The sender is only dropped unsent if the pool itself goes away
            if let Ok(lease) = rx.await {
                debug!(slot = lease.id, "Acquired slot after waiting");
                return lease;
            }
        }
    }

    /// Release a lease. Returns false (and does nothing) if it is no longer
    /// the slot's current lease.
    pub fn release(&self, lease: SlotLease) -> bool {
        let mut state = self.lock();
        if !Self::is_current(&state, lease) {
            return false;
        }
        if let Some(held) = state.held.remove(&lease.id) {
            held.timer.abort();
        }
        debug!(slot = lease.id, "Released slot");
        self.hand_off(&mut state, lease.id);
        true
    }

    /// Restart the idle timer of a lease that is still current.
    ///
    /// Returns false if the slot was already reclaimed from this holder.
    pub fn renew(&self, lease: SlotLease) -> bool {
        let mut state = self.lock();
        if !Self::is_current(&state, lease) {
            return false;
        }
        let timer = spawn_idle_timer(
            Arc::downgrade(&self.inner),
            self.inner.idle_timeout,
            lease.id,
            lease.generation,
        );
        if let Some(held) = state.held.get_mut(&lease.id) {
            std::mem::replace(&mut held.timer, timer).abort();
        }
        true
    }

    /// Ids currently held, ascending
    pub fn held(&self) -> Vec<u32> {
        self.lock().held.keys().copied().collect()
    }

    /// Number of callers queued in `acquire`
    pub fn waiting(&self) -> usize {
        self.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(state: &PoolState, lease: SlotLease) -> bool {
        state
            .held
            .get(&lease.id)
            .is_some_and(|held| held.generation == lease.generation)
    }

    fn grant(&self, state: &mut PoolState, id: u32) -> SlotLease {
        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = spawn_idle_timer(
            Arc::downgrade(&self.inner),
            self.inner.idle_timeout,
            id,
            generation,
        );
        state.held.insert(id, HeldSlot { generation, timer });
        SlotLease { id, generation }
    }

    /// Give a freshly freed slot to the first waiter that is still listening
    fn hand_off(&self, state: &mut PoolState, id: u32) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let lease = self.grant(state, id);
            if waiter.send(lease).is_ok() {
                return;
            }
            if let Some(held) = state.held.remove(&id) {
                held.timer.abort();
            }
        }
    }

    fn reclaim(&self, lease: SlotLease) {
        let mut state = self.lock();
        if !Self::is_current(&state, lease) {
            return;
        }
        state.held.remove(&lease.id);
        warn!(
            slot = lease.id,
            timeout_secs = self.inner.idle_timeout.as_secs(),
            "Slot was never released, reclaiming"
        );
        self.hand_off(&mut state, lease.id);
    }
}

fn spawn_idle_timer(
    pool: Weak<Inner>,
    timeout: Duration,
    id: u32,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = pool.upgrade() {
            SlotPool { inner }.reclaim(SlotLease { id, generation });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::{assert_pending, assert_ready, task};

    const IDLE: Duration = Duration::from_secs(120);

    #[tokio::test]
    async fn test_acquire_prefers_low_ids() {
        let pool = SlotPool::new(2, IDLE);
        assert_eq!(pool.acquire().await.id, 0);
        let one = pool.acquire().await;
        assert_eq!(one.id, 1);
        assert_eq!(pool.acquire().await.id, 2);

        assert!(pool.release(one));
        assert_eq!(pool.acquire().await.id, 1);
        assert_eq!(pool.held(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_waiters_resume_in_fifo_order() {
        let pool = SlotPool::new(0, IDLE);
        let held = pool.acquire().await;

        let mut first = task::spawn(pool.acquire());
        let mut second = task::spawn(pool.acquire());
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(pool.waiting(), 2);

        pool.release(held);
        assert!(first.is_woken());
        let first_lease = assert_ready!(first.poll());
        assert_eq!(first_lease.id, 0);
        assert_pending!(second.poll());

        pool.release(first_lease);
        assert_eq!(assert_ready!(second.poll()).id, 0);
        assert_eq!(pool.held(), vec![0]);
    }

    #[tokio::test]
    async fn test_release_of_unheld_id_is_noop() {
        let pool = SlotPool::new(0, IDLE);
        pool.acquire().await;

        let mut waiter = task::spawn(pool.acquire());
        assert_pending!(waiter.poll());

        let never_granted = SlotLease {
            id: 5,
            generation: 99,
        };
        assert!(!pool.release(never_granted));
        assert!(!waiter.is_woken());
        assert_pending!(waiter.poll());
        assert_eq!(pool.waiting(), 1);
        assert_eq!(pool.held(), vec![0]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = SlotPool::new(1, IDLE);
        let lease = pool.acquire().await;
        assert!(pool.release(lease));
        assert!(!pool.release(lease));
        assert!(pool.held().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let pool = SlotPool::new(0, IDLE);
        let lease = pool.acquire().await;

        let mut abandoned = task::spawn(pool.acquire());
        assert_pending!(abandoned.poll());
        drop(abandoned);

        pool.release(lease);
        assert!(pool.held().is_empty());
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_reclaims_leaked_slot() {
        let pool = SlotPool::new(0, IDLE);
        let leaked = pool.acquire().await;
        assert_eq!(leaked.id, 0);

        // Paused clock auto-advances to the idle deadline
        let lease = tokio::time::timeout(IDLE * 2, pool.acquire())
            .await
            .expect("leaked slot should be reclaimed");
        assert_eq!(lease.id, 0);
        assert_ne!(lease, leaked);
        assert_eq!(pool.held(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_reclaim_new_lease() {
        let pool = SlotPool::new(0, IDLE);
        let first = pool.acquire().await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        pool.release(first);
        pool.acquire().await;

        // Past the first lease's deadline, inside the second's
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(pool.held(), vec![0]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(pool.held().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimed_holder_cannot_release_next_owner() {
        let pool = SlotPool::new(0, IDLE);
        let stale = pool.acquire().await;

        tokio::time::sleep(IDLE + Duration::from_secs(10)).await;
        let current = pool.acquire().await;
        assert_eq!(current.id, stale.id);

        assert!(!pool.release(stale));
        assert!(!pool.renew(stale));
        assert_eq!(pool.held(), vec![0]);

        // A third caller still has to wait for the real owner
        let mut third = task::spawn(pool.acquire());
        assert_pending!(third.poll());
        assert!(pool.release(current));
        assert_eq!(assert_ready!(third.poll()).id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_postpones_reclaim() {
        let pool = SlotPool::new(0, IDLE);
        let lease = pool.acquire().await;

        for _ in 0..5 {
            tokio::time::sleep(IDLE - Duration::from_secs(10)).await;
            assert!(pool.renew(lease));
        }
        assert_eq!(pool.held(), vec![0]);

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert!(pool.held().is_empty());
        assert!(!pool.renew(lease));
    }

    #[tokio::test]
    async fn test_random_sequence_keeps_invariants() {
        let max_id = 3;
        let pool = SlotPool::new(max_id, IDLE);
        let mut outstanding: Vec<SlotLease> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let want_acquire = seed % 3 != 0;
            if want_acquire && outstanding.len() <= max_id as usize {
                let lease = pool.acquire().await;
                assert!(lease.id <= max_id);
                assert!(
                    !outstanding.iter().any(|l| l.id == lease.id),
                    "slot {} handed out twice",
                    lease.id
                );
                outstanding.push(lease);
            } else if !outstanding.is_empty() {
                let idx = (seed as usize / 3) % outstanding.len();
                let lease = outstanding.swap_remove(idx);
                assert!(pool.release(lease));
            } else {
                let bogus = SlotLease {
                    id: (seed % 8) as u32,
                    generation: 0,
                };
                assert!(!pool.release(bogus));
            }

            let held = pool.held();
            let unique: HashSet<_> = held.iter().collect();
            assert_eq!(unique.len(), held.len());
            assert!(held.len() <= max_id as usize + 1);
            let mut expected: Vec<u32> = outstanding.iter().map(|l| l.id).collect();
            expected.sort_unstable();
            assert_eq!(held, expected);
        }
    }
}
