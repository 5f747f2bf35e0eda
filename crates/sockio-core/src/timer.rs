//! Keyed one-shot timers.
//!
//! Each key holds at most one armed timer. Re-arming a key supersedes the
//! previous timer, and every timer carries a generation stamp so a fire that
//! raced with a cancel or a re-arm is recognized and discarded.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A set of keyed, cancellable timers delivering their fires as messages.
pub struct TimerSet<K> {
    armed: HashMap<K, Armed>,
    generation: u64,
    tx: mpsc::UnboundedSender<(K, u64)>,
    rx: mpsc::UnboundedReceiver<(K, u64)>,
}

impl<K> TimerSet<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            armed: HashMap::new(),
            generation: 0,
            tx,
            rx,
        }
    }

    /// Arm `key` to fire after `delay`, replacing any timer already armed
    /// for it.
    pub fn arm(&mut self, key: K, delay: Duration) {
        self.cancel(key);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((key, generation));
        });
        trace!(timer = ?key, delay_ms = delay.as_millis() as u64, "Timer armed");
        self.armed.insert(key, Armed { generation, handle });
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: K) -> bool {
        match self.armed.remove(&key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every armed timer.
    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    #[must_use]
    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }

    fn claim(&mut self, key: K, generation: u64) -> bool {
        match self.armed.get(&key) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(&key);
                true
            }
            _ => {
                trace!(timer = ?key, generation, "Discarding stale timer fire");
                false
            }
        }
    }

    /// Wait for the next live timer fire.
    ///
    /// Cancel safe: a fire is only consumed when this returns it.
    pub async fn next(&mut self) -> K {
        while let Some((key, generation)) = self.rx.recv().await {
            if self.claim(key, generation) {
                return key;
            }
        }
        // The set holds a sender, so the channel never closes.
        std::future::pending().await
    }
}

impl<K> Default for TimerSet<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let mut timers = TimerSet::new();
        let start = Instant::now();
        timers.arm(Key::A, Duration::from_millis(250));
        assert!(timers.is_armed(Key::A));

        assert_eq!(timers.next().await, Key::A);
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(!timers.is_armed(Key::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut timers = TimerSet::new();
        timers.arm(Key::A, Duration::from_millis(100));
        assert!(timers.cancel(Key::A));
        assert!(!timers.cancel(Key::A));

        let fired = timeout(Duration::from_secs(10), timers.next()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes_previous() {
        let mut timers = TimerSet::new();
        timers.arm(Key::A, Duration::from_millis(100));
        timers.arm(Key::B, Duration::from_millis(200));
        timers.arm(Key::A, Duration::from_millis(300));

        let start = Instant::now();
        assert_eq!(timers.next().await, Key::B);
        assert_eq!(timers.next().await, Key::A);
        assert!(start.elapsed() >= Duration::from_millis(300));

        let again = timeout(Duration::from_secs(10), timers.next()).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_racing_cancel_is_discarded() {
        let mut timers = TimerSet::new();
        timers.arm(Key::A, Duration::from_millis(10));
        // Let the sleep complete and queue its fire before cancelling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        timers.cancel(Key::A);

        let fired = timeout(Duration::from_secs(1), timers.next()).await;
        assert!(fired.is_err());
    }
}
