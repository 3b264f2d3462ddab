//! # replica
//!
//! why: one long-lived worker per peer or zone that runs "replicate one unit" on demand
//! relations: raft/ runs a data pool and a heartbeat pool, federation.rs runs a zone pool
//! what: RetryPolicy, ReplicaPool, worker loop with exponential backoff

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Retry timer bounds of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub floor: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(floor: Duration, max: Duration) -> Self {
        Self { floor, max }
    }

    /// Next timer after a failure: doubled, capped at `max`
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

type ReplicateFn<K> = Arc<dyn Fn(K) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Signal {
    pending: bool,
    finalize: bool,
}

#[derive(Default)]
struct WorkerShared {
    signal: Mutex<Signal>,
    cond: Condvar,
}

impl WorkerShared {
    fn notify(&self, finalize: bool) {
        let mut signal = self.signal.lock();
        if finalize {
            signal.finalize = true;
        } else {
            signal.pending = true;
        }
        self.cond.notify_one();
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Signal termination and join, unless the caller is this worker itself
    fn finalize(mut self) {
        self.shared.notify(true);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run_worker<K>(name: &'static str, key: K, shared: Arc<WorkerShared>, retry: RetryPolicy, replicate: ReplicateFn<K>)
where
    K: Copy + Display,
{
    let mut timer = retry.floor;
    let mut retrying = false;

    loop {
        {
            let mut signal = shared.signal.lock();
            while !signal.pending && !signal.finalize {
                if retrying {
                    if shared.cond.wait_for(&mut signal, timer).timed_out() {
                        break;
                    }
                } else {
                    shared.cond.wait(&mut signal);
                }
            }

            if signal.finalize {
                trace!(pool = name, %key, "replica worker exiting");
                return;
            }
            signal.pending = false;
        }

        match replicate(key) {
            Ok(()) => {
                timer = retry.floor;
                retrying = false;
            }
            Err(e) => {
                timer = retry.backoff(timer);
                retrying = true;
                if e.is_retryable() {
                    debug!(pool = name, %key, error = %e, retry_in = ?timer, "replication failed, backing off");
                } else {
                    warn!(pool = name, %key, error = %e, retry_in = ?timer, "replication failed, backing off");
                }
            }
        }
    }
}

/// Workers keyed by peer (or zone) id, all running the same callback.
pub struct ReplicaPool<K> {
    name: &'static str,
    retry: RetryPolicy,
    replicate: ReplicateFn<K>,
    workers: Mutex<HashMap<K, Worker>>,
}

impl<K> ReplicaPool<K>
where
    K: Copy + Eq + Hash + Display + Send + 'static,
{
    pub fn new<F>(name: &'static str, retry: RetryPolicy, replicate: F) -> Self
    where
        F: Fn(K) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name,
            retry,
            replicate: Arc::new(replicate),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, key: K) -> Worker {
        let shared = Arc::new(WorkerShared::default());
        let replicate = self.replicate.clone();
        let (name, retry, worker_shared) = (self.name, self.retry, shared.clone());

        let handle = thread::Builder::new()
            .name(format!("{name}-{key}"))
            .spawn(move || run_worker(name, key, worker_shared, retry, replicate));

        match handle {
            Ok(handle) => Worker {
                shared,
                handle: Some(handle),
            },
            Err(e) => {
                warn!(pool = name, %key, error = %e, "cannot spawn replica worker");
                Worker { shared, handle: None }
            }
        }
    }

    /// Start the worker for `key` if it is not running yet
    pub fn start_worker(&self, key: K) {
        let mut workers = self.workers.lock();
        if !workers.contains_key(&key) {
            let worker = self.spawn(key);
            workers.insert(key, worker);
        }
    }

    /// Wake the worker for `key`, starting it on demand
    pub fn add_request(&self, key: K) {
        let mut workers = self.workers.lock();
        let worker = workers.entry(key).or_insert_with(|| self.spawn(key));
        worker.shared.notify(false);
    }

    /// Wake every worker
    pub fn add_request_all(&self) {
        for worker in self.workers.lock().values() {
            worker.shared.notify(false);
        }
    }

    /// Stop and join the worker for `key`
    pub fn stop_worker(&self, key: K) {
        let worker = self.workers.lock().remove(&key);
        if let Some(worker) = worker {
            worker.finalize();
        }
    }

    /// Stop and join every worker
    pub fn finalize(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.finalize();
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.workers.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for ReplicaPool<K> {
    fn drop(&mut self) {
        for (_, worker) in self.workers.get_mut().drain() {
            worker.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HaError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = policy();
        assert_eq!(p.backoff(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(p.backoff(Duration::from_millis(20)), Duration::from_millis(40));
        assert_eq!(p.backoff(Duration::from_millis(40)), Duration::from_millis(40));
    }

    #[test]
    fn runs_callback_once_per_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pool = ReplicaPool::new("test", policy(), move |_peer: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        pool.add_request(2);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
        pool.add_request(2);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2));

        // no spontaneous wake-ups after success
        thread::sleep(Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        pool.finalize();
        assert!(pool.is_empty());
    }

    #[test]
    fn failing_callback_retries_without_signal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pool = ReplicaPool::new("test", policy(), move |peer: u64| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(HaError::transport(peer, "unreachable"))
            } else {
                Ok(())
            }
        });

        pool.add_request(3);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) >= 4));

        // recovered: back to waiting for signals
        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn workers_are_independent_per_key() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = ReplicaPool::new("test", policy(), move |peer: u64| {
            sink.lock().push(peer);
            Ok(())
        });

        pool.add_request(1);
        pool.add_request(2);
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));

        let mut keys = pool.keys();
        keys.sort();
        assert_eq!(keys, vec![1, 2]);

        pool.stop_worker(1);
        assert_eq!(pool.keys(), vec![2]);
    }

    #[test]
    fn finalize_from_inside_a_worker_does_not_deadlock() {
        let pool: Arc<Mutex<Option<Arc<ReplicaPool<u64>>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicUsize::new(0));

        let slot = pool.clone();
        let flag = done.clone();
        let replica = Arc::new(ReplicaPool::new("test", policy(), move |_peer: u64| {
            let me = slot.lock().clone();
            if let Some(me) = me {
                me.finalize();
            }
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        *pool.lock() = Some(replica.clone());

        replica.add_request(1);
        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 1));
        assert!(replica.is_empty());
        pool.lock().take();
    }
}
