//! When the handler's scheduled tasks are due.
//!
//! Every outgoing query schedules a timeout here and most of them are answered long before it
//! fires, so timeouts of answered queries are taken out again by transaction id.

use crate::{action::ScheduledTaskCheck, transaction::TransactionId};
use futures_util::Stream;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{self, Instant, Sleep};

// Deadline first, then scheduling order, so tasks due at the same instant fire FIFO.
type Key = (Instant, u64);

pub(crate) struct Timer {
    next_seq: u64,
    tasks: BTreeMap<Key, ScheduledTaskCheck>,
    query_timeouts: HashMap<TransactionId, Key>,
    // Armed for the earliest task. Created on first poll, so it needs a runtime only then.
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            tasks: BTreeMap::new(),
            query_timeouts: HashMap::new(),
            sleep: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn schedule_in(&mut self, delay: Duration, task: ScheduledTaskCheck) {
        self.schedule_at(Instant::now() + delay, task)
    }

    pub fn schedule_at(&mut self, deadline: Instant, task: ScheduledTaskCheck) {
        let key = (deadline, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);

        if let ScheduledTaskCheck::QueryTimeout(trans_id) = task {
            // An id that wrapped around replaces the timeout of its stale namesake.
            if let Some(old) = self.query_timeouts.insert(trans_id, key) {
                self.tasks.remove(&old);
            }
        }

        self.tasks.insert(key, task);
    }

    /// Forget the timeout of a query that got its answer. Returns whether there was one.
    pub fn cancel_query_timeout(&mut self, trans_id: TransactionId) -> bool {
        match self.query_timeouts.remove(&trans_id) {
            Some(key) => self.tasks.remove(&key).is_some(),
            None => false,
        }
    }
}

impl Stream for Timer {
    type Item = ScheduledTaskCheck;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        let deadline = match this.tasks.keys().next() {
            Some((deadline, _)) => *deadline,
            None => return Poll::Ready(None),
        };

        // Follow the earliest task, which changes as tasks come and go.
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(time::sleep_until(deadline)));
        if sleep.deadline() != deadline {
            sleep.as_mut().reset(deadline);
        }

        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        let task = this.tasks.pop_first().map(|(_, task)| task);

        if let Some(ScheduledTaskCheck::QueryTimeout(trans_id)) = task {
            this.query_timeouts.remove(&trans_id);
        }

        Poll::Ready(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn query_timeout(id: u16) -> ScheduledTaskCheck {
        ScheduledTaskCheck::QueryTimeout(TransactionId::from_bytes(&id.to_be_bytes()).unwrap())
    }

    fn trans_id(id: u16) -> TransactionId {
        TransactionId::from_bytes(&id.to_be_bytes()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(3), ScheduledTaskCheck::Maintenance);
        timer.schedule_in(Duration::from_secs(1), ScheduledTaskCheck::TableRefresh);
        timer.schedule_in(Duration::from_secs(2), ScheduledTaskCheck::BootstrapRetry);

        assert_eq!(timer.len(), 3);
        assert!(matches!(timer.next().await, Some(ScheduledTaskCheck::TableRefresh)));
        assert!(matches!(timer.next().await, Some(ScheduledTaskCheck::BootstrapRetry)));
        assert!(matches!(timer.next().await, Some(ScheduledTaskCheck::Maintenance)));
        assert!(timer.is_empty());
        assert!(timer.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_task_preempts_the_armed_one() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(10), ScheduledTaskCheck::Maintenance);

        // Start polling so the sleep is armed for the maintenance.
        let first = time::timeout(Duration::from_secs(1), timer.next()).await;
        assert!(first.is_err());

        timer.schedule_in(Duration::from_secs(1), ScheduledTaskCheck::TableRefresh);
        assert!(matches!(timer.next().await, Some(ScheduledTaskCheck::TableRefresh)));
        assert!(matches!(timer.next().await, Some(ScheduledTaskCheck::Maintenance)));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_query_never_times_out() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(1), query_timeout(1));
        timer.schedule_in(Duration::from_secs(2), query_timeout(2));

        assert!(timer.cancel_query_timeout(trans_id(1)));
        assert!(!timer.cancel_query_timeout(trans_id(1)));
        assert_eq!(timer.len(), 1);

        match timer.next().await {
            Some(ScheduledTaskCheck::QueryTimeout(id)) => assert_eq!(id, trans_id(2)),
            other => panic!("unexpected task {:?}", other),
        }

        // Fired timeouts are forgotten too.
        assert!(!timer.cancel_query_timeout(trans_id(2)));
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reused_transaction_id_replaces_the_old_timeout() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(1), query_timeout(7));
        timer.schedule_in(Duration::from_secs(5), query_timeout(7));

        assert_eq!(timer.len(), 1);

        let start = Instant::now();
        assert!(timer.next().await.is_some());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
