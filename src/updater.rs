//! The global flush driver.
//!
//! One process-wide thread walks a min-heap keyed on each session's next
//! flush deadline, runs the session's flush work, and reschedules it by the
//! interval the ARQ core asked for (clamped to 10..100 ms). Sessions join the
//! heap on creation and fall out when closed or deallocated; entries hold
//! only weak references so the heap never keeps a session alive.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::session::Session;

/// Fastest revisit cadence.
const MIN_INTERVAL: Duration = Duration::from_millis(10);
/// Slowest revisit cadence.
const MAX_INTERVAL: Duration = Duration::from_millis(100);
/// Idle wait when no sessions are registered.
const IDLE_WAIT: Duration = Duration::from_millis(500);

struct Entry {
    ts: Instant,
    sess: Weak<Session>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ts.cmp(&self.ts)
    }
}

struct Updater {
    heap: Mutex<BinaryHeap<Entry>>,
    cond: Condvar,
}

fn global() -> &'static Updater {
    static UPDATER: OnceLock<Updater> = OnceLock::new();
    UPDATER.get_or_init(|| {
        let updater = Updater {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
        };
        thread::spawn(run);
        updater
    })
}

/// Puts a freshly created session on the schedule.
pub(crate) fn register(sess: &std::sync::Arc<Session>) {
    let updater = global();
    updater.heap.lock().unwrap().push(Entry {
        ts: Instant::now(),
        sess: std::sync::Arc::downgrade(sess),
    });
    updater.cond.notify_one();
}

fn run() {
    let updater = global();
    let mut heap = updater.heap.lock().unwrap();
    loop {
        let now = Instant::now();

        let mut due = Vec::new();
        while let Some(top) = heap.peek() {
            if top.ts <= now {
                due.push(heap.pop().unwrap());
            } else {
                break;
            }
        }

        if !due.is_empty() {
            // Flushes run without the heap lock; update() takes session locks.
            drop(heap);
            let mut requeue = Vec::new();
            for entry in due {
                if let Some(sess) = entry.sess.upgrade() {
                    if let Some(interval) = sess.update() {
                        let interval = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
                        requeue.push(Entry {
                            ts: Instant::now() + interval,
                            sess: entry.sess,
                        });
                    }
                }
            }
            heap = updater.heap.lock().unwrap();
            for entry in requeue {
                heap.push(entry);
            }
            continue;
        }

        let wait = match heap.peek() {
            Some(top) => top.ts.saturating_duration_since(now),
            None => IDLE_WAIT,
        };
        let (guard, _timeout) = updater.cond.wait_timeout(heap, wait).unwrap();
        heap = guard;
    }
}
