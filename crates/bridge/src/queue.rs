//! Callback queue: ordered handoff from session threads to the host thread.
//!
//! Any thread may enqueue. Exactly one thread, the first one to drain, runs
//! the work. A drain swaps the whole backing `Vec` out under the lock and runs
//! the batch without holding it, so work enqueued while a batch runs (including
//! by the batch itself) lands in the next drain.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::host::HostError;

/// Depth at which a warning is logged (once per crossing).
pub const DEFAULT_WARN_THRESHOLD: usize = 1024;

/// A unit of work to run on the host thread.
pub type Work<H> = Box<dyn FnOnce(&mut H) -> Result<(), HostError> + Send>;

struct QueuedWork<H> {
    seq: u64,
    label: String,
    work: Work<H>,
}

struct QueueInner<H> {
    items: Mutex<Vec<QueuedWork<H>>>,
    consumer: Mutex<Option<ThreadId>>,
    next_seq: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    warn_threshold: usize,
    warned: AtomicBool,
}

/// Thread-safe queue of host callbacks. Cheap to clone; clones share state.
pub struct CallbackQueue<H> {
    inner: Arc<QueueInner<H>>,
}

impl<H> Clone for CallbackQueue<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One queued item that failed during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackFailure {
    pub seq: u64,
    pub label: String,
    pub message: String,
}

/// Outcome of one `drain_and_run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items executed, failed ones included.
    pub ran: usize,
    pub failures: Vec<CallbackFailure>,
    /// Items enqueued during the drain, left for the next one.
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Drain attempted from a thread other than the queue's consumer.
    WrongThread,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::WrongThread => {
                write!(f, "callback queue can only be drained from the host thread")
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl<H: 'static> CallbackQueue<H> {
    pub fn new() -> Self {
        Self::with_warn_threshold(DEFAULT_WARN_THRESHOLD)
    }

    pub fn with_warn_threshold(warn_threshold: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(Vec::new()),
                consumer: Mutex::new(None),
                next_seq: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                warn_threshold: warn_threshold.max(1),
                warned: AtomicBool::new(false),
            }),
        }
    }

    /// Append work. Never blocks beyond the short critical section.
    ///
    /// Returns the item's sequence number (starting at 1).
    pub fn enqueue<F>(&self, label: impl Into<String>, work: F) -> u64
    where
        F: FnOnce(&mut H) -> Result<(), HostError> + Send + 'static,
    {
        let label = label.into();
        let (seq, depth) = {
            let mut items = self.inner.items.lock();
            // Assigned under the lock so sequence order equals queue order.
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            items.push(QueuedWork {
                seq,
                label,
                work: Box::new(work),
            });
            (seq, items.len())
        };

        if depth >= self.inner.warn_threshold && !self.inner.warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Callback queue depth reached {} (threshold {}); is the host draining?",
                depth,
                self.inner.warn_threshold
            );
        }

        seq
    }

    /// Make the calling thread the consumer. Idempotent for that thread.
    pub fn bind_consumer(&self) -> Result<(), QueueError> {
        let current = thread::current().id();
        let mut consumer = self.inner.consumer.lock();
        match *consumer {
            None => {
                *consumer = Some(current);
                Ok(())
            }
            Some(id) if id == current => Ok(()),
            Some(_) => Err(QueueError::WrongThread),
        }
    }

    /// Remove everything queued right now and run it, in order, on this thread.
    ///
    /// A failing item (error or panic) is recorded and the batch continues.
    pub fn drain_and_run(&self, host: &mut H) -> Result<DrainReport, QueueError> {
        self.bind_consumer()?;

        let batch = std::mem::take(&mut *self.inner.items.lock());
        let mut report = DrainReport::default();

        for item in batch {
            let QueuedWork { seq, label, work } = item;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut *host)));
            report.ran += 1;
            self.inner.executed.fetch_add(1, Ordering::Relaxed);

            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            log::warn!("Host callback #{} ({}) failed: {}", seq, label, message);
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            report.failures.push(CallbackFailure { seq, label, message });
        }

        report.remaining = self.len();
        if report.remaining < self.inner.warn_threshold {
            self.inner.warned.store(false, Ordering::Relaxed);
        }

        Ok(report)
    }

    /// Items currently waiting.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items ever enqueued.
    pub fn enqueued_total(&self) -> u64 {
        self.inner.next_seq.load(Ordering::Relaxed)
    }

    /// Total items run by drains (failed ones included).
    pub fn executed_total(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// True if the calling thread is the bound consumer.
    pub fn is_consumer_thread(&self) -> bool {
        *self.inner.consumer.lock() == Some(thread::current().id())
    }
}

impl<H: 'static> Default for CallbackQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_runs_in_enqueue_order() {
        let queue: CallbackQueue<Vec<u32>> = CallbackQueue::new();
        for i in 0..5 {
            queue.enqueue(format!("push {}", i), move |log: &mut Vec<u32>| {
                log.push(i);
                Ok(())
            });
        }

        let mut log = Vec::new();
        let report = queue.drain_and_run(&mut log).unwrap();
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.ran, 5);
        assert!(report.is_clean());
        assert!(queue.is_empty());

        // Nothing runs twice
        let report = queue.drain_and_run(&mut log).unwrap();
        assert_eq!(report.ran, 0);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_work_enqueued_during_drain_is_deferred() {
        let queue: CallbackQueue<Vec<&'static str>> = CallbackQueue::new();
        let requeue = queue.clone();
        queue.enqueue("outer", move |log: &mut Vec<&'static str>| {
            log.push("outer");
            requeue.enqueue("inner", |log: &mut Vec<&'static str>| {
                log.push("inner");
                Ok(())
            });
            Ok(())
        });

        let mut log = Vec::new();
        let report = queue.drain_and_run(&mut log).unwrap();
        assert_eq!(log, vec!["outer"]);
        assert_eq!(report.remaining, 1);

        queue.drain_and_run(&mut log).unwrap();
        assert_eq!(log, vec!["outer", "inner"]);
    }

    #[test]
    fn test_failures_do_not_stop_the_batch() {
        let queue: CallbackQueue<Vec<u32>> = CallbackQueue::new();
        queue.enqueue("first", |log: &mut Vec<u32>| {
            log.push(1);
            Ok(())
        });
        queue.enqueue("errors", |_: &mut Vec<u32>| Err(HostError::Other("boom".to_string())));
        queue.enqueue("panics", |_: &mut Vec<u32>| panic!("kaboom"));
        queue.enqueue("last", |log: &mut Vec<u32>| {
            log.push(4);
            Ok(())
        });

        let mut log = Vec::new();
        let report = queue.drain_and_run(&mut log).unwrap();
        assert_eq!(log, vec![1, 4]);
        assert_eq!(report.ran, 4);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].seq, 2);
        assert_eq!(report.failures[0].message, "boom");
        assert_eq!(report.failures[1].label, "panics");
        assert!(report.failures[1].message.contains("kaboom"));
        assert_eq!(queue.failed_total(), 2);
        assert_eq!(queue.executed_total(), 4);
    }

    #[test]
    fn test_drain_from_other_thread_is_refused() {
        let queue: CallbackQueue<u32> = CallbackQueue::new();
        let mut host = 0;
        queue.drain_and_run(&mut host).unwrap();
        assert!(queue.is_consumer_thread());

        queue.enqueue("inc", |n: &mut u32| {
            *n += 1;
            Ok(())
        });

        let other = queue.clone();
        let result = thread::spawn(move || {
            let mut host = 0;
            let result = other.drain_and_run(&mut host);
            (result, host)
        })
        .join()
        .unwrap();

        assert_eq!(result.0, Err(QueueError::WrongThread));
        assert_eq!(result.1, 0);
        // The refused drain took nothing
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        let queue: CallbackQueue<Vec<(usize, usize)>> = CallbackQueue::new();
        let mut handles = Vec::new();
        for producer in 0..4 {
            let q = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    q.enqueue("push", move |log: &mut Vec<(usize, usize)>| {
                        log.push((producer, i));
                        Ok(())
                    });
                }
            }));
        }

        let mut log = Vec::new();
        // Drain while producers are still running
        while handles.iter().any(|h| !h.is_finished()) {
            queue.drain_and_run(&mut log).unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        queue.drain_and_run(&mut log).unwrap();

        assert_eq!(log.len(), 1000);
        assert_eq!(queue.enqueued_total(), 1000);
        for producer in 0..4 {
            let seen: Vec<usize> = log
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(seen, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_depth_warning_fires_once_and_rearms_after_drain() {
        let queue: CallbackQueue<()> = CallbackQueue::with_warn_threshold(2);
        let warned = || queue.inner.warned.load(Ordering::Relaxed);

        queue.enqueue("a", |_: &mut ()| Ok(()));
        assert!(!warned());
        queue.enqueue("b", |_: &mut ()| Ok(()));
        assert!(warned());
        queue.enqueue("c", |_: &mut ()| Ok(()));
        assert!(warned());

        queue.drain_and_run(&mut ()).unwrap();
        assert!(!warned());

        queue.enqueue("d", |_: &mut ()| Ok(()));
        queue.enqueue("e", |_: &mut ()| Ok(()));
        assert!(warned());
    }

    #[test]
    fn test_drain_leaving_backlog_keeps_warning_armed() {
        let queue: CallbackQueue<()> = CallbackQueue::with_warn_threshold(2);
        let requeue = queue.clone();
        queue.enqueue("refill", move |_: &mut ()| {
            for label in ["x", "y"] {
                requeue.enqueue(label, |_: &mut ()| Ok(()));
            }
            Ok(())
        });
        queue.enqueue("pad", |_: &mut ()| Ok(()));
        assert!(queue.inner.warned.load(Ordering::Relaxed));

        // Two items re-enqueued during the drain: still at the threshold
        let report = queue.drain_and_run(&mut ()).unwrap();
        assert_eq!(report.remaining, 2);
        assert!(queue.inner.warned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let queue: CallbackQueue<()> = CallbackQueue::with_warn_threshold(2);
        let seqs: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|label| queue.enqueue(*label, |_: &mut ()| Ok(())))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.enqueued_total(), 3);
    }
}
