use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

pub type TimeoutCallback = Arc<dyn Fn(i64) + Send + Sync>;

#[derive(Default)]
struct TimeoutQueue {
    ordered: BTreeSet<(Instant, i64)>,
    deadlines: HashMap<i64, Instant>,
    closed: bool,
}

struct Shared {
    queue: Mutex<TimeoutQueue>,
    notify: Notify,
}

/// One timer multiplexed over many integer keys, monotonic clock. Arming an
/// existing key keeps the earlier of the two deadlines; a fire for a key that
/// was cancelled in the meantime is a no-op.
pub struct MultiTimeout {
    shared: Arc<Shared>,
}

impl MultiTimeout {
    pub fn new(callback: TimeoutCallback) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TimeoutQueue::default()),
            notify: Notify::new(),
        });
        tokio::spawn(run(shared.clone(), callback));
        Self { shared }
    }

    pub fn set(&self, key: i64, at: Instant) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&current) = queue.deadlines.get(&key) {
            if current <= at {
                return;
            }
            queue.ordered.remove(&(current, key));
        }
        queue.deadlines.insert(key, at);
        queue.ordered.insert((at, key));
        drop(queue);
        self.shared.notify.notify_one();
    }

    pub fn cancel(&self, key: i64) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = queue.deadlines.remove(&key) {
            queue.ordered.remove(&(at, key));
            drop(queue);
            self.shared.notify.notify_one();
        }
    }

    pub fn cancel_all(&self) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.ordered.clear();
        queue.deadlines.clear();
        drop(queue);
        self.shared.notify.notify_one();
    }

    pub fn has(&self, key: i64) -> bool {
        let queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.deadlines.contains_key(&key)
    }
}

impl Drop for MultiTimeout {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.closed = true;
        drop(queue);
        self.shared.notify.notify_one();
    }
}

async fn run(shared: Arc<Shared>, callback: TimeoutCallback) {
    loop {
        let next = {
            let queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.closed {
                return;
            }
            queue.ordered.iter().next().copied()
        };
        match next {
            Some((at, _)) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        for key in take_expired(&shared) {
                            callback(key);
                        }
                    }
                    _ = shared.notify.notified() => {}
                }
            }
            None => shared.notify.notified().await,
        }
    }
}

fn take_expired(shared: &Shared) -> Vec<i64> {
    let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
    let now = Instant::now();
    let mut expired = Vec::new();
    while let Some(&(at, key)) = queue.ordered.iter().next() {
        if at > now {
            break;
        }
        queue.ordered.remove(&(at, key));
        queue.deadlines.remove(&key);
        expired.push(key);
    }
    expired
}
