//! Reconnect timer: periodic re-announcement of lost peers.
//!
//! Entries are keyed `host@port`. Each entry is one task ticking every
//! `interval` until `timeout` has elapsed, after which it removes itself.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

struct Entry {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Entries {
    next_generation: u64,
    map: HashMap<String, Entry>,
}

/// Registry of reconnect entries
#[derive(Clone)]
pub struct ReconnectTimer {
    interval: Duration,
    timeout: Duration,
    entries: Arc<Mutex<Entries>>,
}

/// Key of a reconnect entry
pub fn reconnect_key(host: IpAddr, port: u16) -> String {
    format!("{}@{}", host, port)
}

impl ReconnectTimer {
    /// Create a timer ticking every `interval` for at most `timeout`
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    /// Whether entries would ever fire; a zero interval or timeout disables
    /// reconnecting
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero() && !self.timeout.is_zero()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm an entry for `host@port`, replacing any existing one.
    ///
    /// `on_interval` runs at every multiple of the interval until the
    /// timeout elapses or the entry is removed.
    pub fn add<F>(&self, host: IpAddr, port: u16, on_interval: F)
    where
        F: Fn() + Send + 'static,
    {
        if !self.is_enabled() {
            return;
        }

        let key = reconnect_key(host, port);
        let mut entries = self.lock();
        entries.next_generation += 1;
        let generation = entries.next_generation;

        let (interval, timeout) = (self.interval, self.timeout);
        let registry = self.entries.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let expiry = sleep(timeout);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut expiry => break,
                    _ = ticks.tick() => {
                        trace!("Reconnect tick for {}", task_key);
                        on_interval();
                    }
                }
            }

            let mut entries = registry.lock().unwrap_or_else(|e| e.into_inner());
            if entries.map.get(&task_key).map(|e| e.generation) == Some(generation) {
                entries.map.remove(&task_key);
                trace!("Reconnect entry {} expired", task_key);
            }
        });

        if let Some(previous) = entries.map.insert(key, Entry { generation, task }) {
            previous.task.abort();
        }
    }

    /// Cancel the entry for `host@port`, if any
    pub fn remove(&self, host: IpAddr, port: u16) {
        if let Some(entry) = self.lock().map.remove(&reconnect_key(host, port)) {
            entry.task.abort();
        }
    }

    /// Cancel every entry
    pub fn remove_all(&self) {
        for (_, entry) in self.lock().map.drain() {
            entry.task.abort();
        }
    }

    /// Number of armed entries
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether no entry is armed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const INTERVAL: Duration = Duration::from_millis(1234);

    fn timeout() -> Duration {
        // 4.5 intervals
        INTERVAL * 9 / 2
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        (calls, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_until_timeout_then_removes_itself() {
        let timer = ReconnectTimer::new(INTERVAL, timeout());
        let (calls, cb) = counter();
        timer.add(HOST, 4816, cb);
        assert_eq!(timer.len(), 1);

        sleep(timeout() * 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_firing() {
        let timer = ReconnectTimer::new(INTERVAL, timeout());
        let (calls, cb) = counter();
        timer.add(HOST, 4816, cb);

        sleep(timeout() / 2).await;
        timer.remove(HOST, 4816);
        sleep(timeout()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(timer.is_empty());

        // Removing twice is harmless
        timer.remove(HOST, 4816);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_all() {
        let timer = ReconnectTimer::new(INTERVAL, timeout());
        let (calls, cb) = counter();
        let (other_calls, other_cb) = counter();
        timer.add(HOST, 4816, cb);
        timer.add(HOST, 4817, other_cb);
        assert_eq!(timer.len(), 2);

        timer.remove_all();
        sleep(timeout()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_re_add_restarts_from_zero() {
        let timer = ReconnectTimer::new(INTERVAL, timeout());
        let (calls, cb) = counter();
        timer.add(HOST, 4816, cb);
        sleep(INTERVAL * 3 + INTERVAL / 2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (new_calls, new_cb) = counter();
        timer.add(HOST, 4816, new_cb);
        assert_eq!(timer.len(), 1);
        sleep(timeout() * 2).await;
        // The replaced entry stopped; the new one ran a full cycle
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(new_calls.load(Ordering::SeqCst), 4);
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timer_never_arms() {
        let timer = ReconnectTimer::new(Duration::ZERO, timeout());
        let (calls, cb) = counter();
        timer.add(HOST, 4816, cb);
        assert!(timer.is_empty());
        sleep(timeout()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(reconnect_key(HOST, 4816), "10.0.0.1@4816");
        assert_eq!(reconnect_key("::1".parse().unwrap(), 1), "::1@1");
    }
}
