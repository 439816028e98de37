use parking_lot::Mutex;
use smol::lock::{Mutex as AsyncMutex, MutexGuardArc};
use smol::Timer;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Paces a stream of sequential operations: at least `min_gap` between two
/// operations, but never more than `max_total` of added latency across the
/// whole backlog: under load the per-operation gap shrinks so the queue
/// drains.
pub struct ThrottledSequencer {
    min_gap: Duration,
    max_total: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last_run: Option<Instant>,
    pending: usize,
}

impl ThrottledSequencer {
    pub fn new(min_gap: Duration, max_total: Duration) -> Self {
        Self {
            min_gap,
            max_total,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Registers one queued operation. Call before awaiting [`Self::throttle`]
    /// so the backlog size is visible to the gap computation.
    pub fn enqueue(&self) {
        self.state.lock().pending += 1;
    }

    /// Waits until the next operation may run. Callers are expected to be
    /// already serialized; this only inserts the pacing delay.
    pub async fn throttle(&self) {
        let wait_until = {
            let state = self.state.lock();
            let gap = self
                .min_gap
                .min(self.max_total / state.pending.max(1) as u32);
            state.last_run.map(|last| last + gap)
        };
        if let Some(wait_until) = wait_until {
            if wait_until > Instant::now() {
                Timer::at(wait_until).await;
            }
        }
        let mut state = self.state.lock();
        state.last_run = Some(Instant::now());
        state.pending = state.pending.saturating_sub(1);
    }
}

/// Hands out one async mutex per key. Holding a key's guard guarantees no
/// other holder for that key; waiters queue in acquisition order.
pub struct SequencerByKey<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> SequencerByKey<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: K) -> MutexGuardArc<()> {
        let lock = self.locks.lock().entry(key).or_default().clone();
        lock.lock_arc().await
    }
}

impl<K: Eq + Hash + Clone> Default for SequencerByKey<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequencer_by_key_serializes_per_key() {
        smol::block_on(async {
            let sequencer = Arc::new(SequencerByKey::new());
            let log = Arc::new(Mutex::new(Vec::new()));

            let guard = sequencer.acquire("a").await;
            let task = smol::spawn({
                let sequencer = sequencer.clone();
                let log = log.clone();
                async move {
                    let _guard = sequencer.acquire("a").await;
                    log.lock().push("second");
                }
            });

            // An unrelated key is not blocked.
            let _other = sequencer.acquire("b").await;

            log.lock().push("first");
            drop(guard);
            task.await;

            assert_eq!(*log.lock(), vec!["first", "second"]);
        });
    }

    #[test]
    fn test_throttle_spaces_operations() {
        smol::block_on(async {
            let sequencer =
                ThrottledSequencer::new(Duration::from_millis(10), Duration::from_millis(1000));
            for _ in 0..3 {
                sequencer.enqueue();
            }
            let started = Instant::now();
            for _ in 0..3 {
                sequencer.throttle().await;
            }
            // First run is immediate; the following two wait ~10ms each.
            assert!(started.elapsed() >= Duration::from_millis(15));
        });
    }

    #[test]
    fn test_throttle_shrinks_gap_under_load() {
        smol::block_on(async {
            let sequencer =
                ThrottledSequencer::new(Duration::from_millis(50), Duration::from_millis(100));
            for _ in 0..10 {
                sequencer.enqueue();
            }
            let started = Instant::now();
            for _ in 0..10 {
                sequencer.throttle().await;
            }
            // 10 queued operations share the 100ms cap instead of paying
            // 50ms each.
            assert!(started.elapsed() < Duration::from_millis(300));
        });
    }
}
