use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;

/// A datum waiting for a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedDatum {
    /// Position of the datum in the job's record list
    pub index: usize,
    /// Attempts already made
    pub attempts: u32,
    /// Earliest time the datum may be claimed (retry backoff)
    pub not_before: Option<Instant>,
}

impl QueuedDatum {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            attempts: 0,
            not_before: None,
        }
    }
}

/// Result of trying to claim work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now exclusively owns this datum.
    Datum(QueuedDatum),
    /// Only backed-off datums are queued; the earliest becomes ready then.
    RetryAt(Instant),
    /// Nothing queued but datums are still in flight and may be pushed back.
    Wait,
    /// Every datum has been settled; the slot can exit.
    Drained,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<QueuedDatum>,
    delayed: Vec<QueuedDatum>,
    /// Datums not yet settled (queued, delayed or claimed)
    outstanding: usize,
    closed: bool,
}

/// Work queue shared by the dispatcher and every worker slot of one job.
///
/// Each claim hands a datum to exactly one slot. A slot that finishes with a
/// datum either settles it or pushes it back for a retry.
#[derive(Debug, Default)]
pub struct DatumQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl DatumQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new datum. It stays outstanding until [`settle`](Self::settle).
    pub fn push(&self, item: QueuedDatum) {
        {
            let mut inner = self.lock();
            inner.outstanding += 1;
            inner.ready.push_back(item);
        }
        self.notify.notify_waiters();
    }

    /// Return a claimed datum for another attempt.
    pub fn push_back(&self, item: QueuedDatum) {
        {
            let mut inner = self.lock();
            match item.not_before {
                Some(t) if t > Instant::now() => inner.delayed.push(item),
                _ => inner.ready.push_back(item),
            }
        }
        self.notify.notify_waiters();
    }

    /// Mark a claimed datum as done for good.
    pub fn settle(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.outstanding = inner.outstanding.saturating_sub(1);
            inner.outstanding == 0
        };
        if drained {
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out datums. Queued datums are dropped as they are.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.ready.clear();
            inner.delayed.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn claim(&self) -> Claim {
        let mut inner = self.lock();
        if inner.closed || inner.outstanding == 0 {
            return Claim::Drained;
        }

        let now = Instant::now();
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].not_before.map_or(true, |t| t <= now) {
                let item = inner.delayed.swap_remove(i);
                inner.ready.push_back(item);
            } else {
                i += 1;
            }
        }

        if let Some(item) = inner.ready.pop_front() {
            return Claim::Datum(item);
        }
        match inner.delayed.iter().filter_map(|d| d.not_before).min() {
            Some(at) => Claim::RetryAt(at),
            None => Claim::Wait,
        }
    }

    /// Resolves after the next push, push-back, settle-to-empty or close.
    ///
    /// Create the future before calling [`claim`](Self::claim) to not miss a
    /// wake-up that happens in between.
    pub fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Datums waiting for a slot, including backed-off ones.
    pub fn queued(&self) -> usize {
        let inner = self.lock();
        inner.ready.len() + inner.delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn claims_each_datum_once() {
        let queue = DatumQueue::new();
        for i in 0..3 {
            queue.push(QueuedDatum::new(i));
        }

        let mut claimed = Vec::new();
        while let Claim::Datum(d) = queue.claim() {
            claimed.push(d.index);
        }
        claimed.sort();
        assert_eq!(claimed, vec![0, 1, 2]);
        assert_eq!(queue.claim(), Claim::Wait);
        assert_eq!(queue.outstanding(), 3);
    }

    #[test]
    fn drained_after_all_settled() {
        let queue = DatumQueue::new();
        queue.push(QueuedDatum::new(0));
        queue.push(QueuedDatum::new(1));
        assert!(matches!(queue.claim(), Claim::Datum(_)));
        assert!(matches!(queue.claim(), Claim::Datum(_)));
        queue.settle();
        assert_eq!(queue.claim(), Claim::Wait);
        queue.settle();
        assert_eq!(queue.claim(), Claim::Drained);
    }

    #[test]
    fn empty_queue_is_drained() {
        assert_eq!(DatumQueue::new().claim(), Claim::Drained);
    }

    #[test]
    fn backed_off_datum_waits() {
        let queue = DatumQueue::new();
        queue.push(QueuedDatum::new(0));
        let Claim::Datum(mut d) = queue.claim() else {
            panic!("expected datum");
        };

        let at = Instant::now() + Duration::from_secs(60);
        d.attempts = 1;
        d.not_before = Some(at);
        queue.push_back(d);

        assert_eq!(queue.claim(), Claim::RetryAt(at));
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn matured_retry_is_claimable() {
        let queue = DatumQueue::new();
        queue.push(QueuedDatum::new(0));
        let Claim::Datum(mut d) = queue.claim() else {
            panic!("expected datum");
        };
        d.attempts = 1;
        d.not_before = Some(Instant::now());
        queue.push_back(d);

        match queue.claim() {
            Claim::Datum(again) => assert_eq!(again.attempts, 1),
            other => panic!("expected datum, got {:?}", other),
        }
    }

    #[test]
    fn close_drops_queued_work() {
        let queue = DatumQueue::new();
        queue.push(QueuedDatum::new(0));
        queue.push(QueuedDatum::new(1));
        queue.close();
        assert_eq!(queue.claim(), Claim::Drained);
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn push_back_wakes_waiters() {
        use std::sync::Arc;

        let queue = Arc::new(DatumQueue::new());
        queue.push(QueuedDatum::new(0));
        let Claim::Datum(d) = queue.claim() else {
            panic!("expected datum");
        };

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    let changed = queue.changed();
                    match queue.claim() {
                        Claim::Datum(d) => return d.index,
                        _ => changed.await,
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_back(d);
        let index = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index, 0);
    }
}
