//! The retry queue: failed reconciliation actions are held and re-invoked
//! once per fixed period until they succeed.
//!
//! The queue is a message-passing actor. One task owns the pending list
//! exclusively and only ever touches it in response to its inbox (new
//! submissions) or its timer (drain cycles); submitters never share the
//! list. An entry that keeps failing is retried forever: a reconciliation
//! intent is never silently dropped, at the cost of unbounded queue growth
//! while a downstream system stays unreachable.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type RetryFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Submission handle for the retry queue.
///
/// Cloning is cheap; every clone feeds the same owning task.
#[derive(Clone)]
pub struct RetryQueue {
    sender: mpsc::UnboundedSender<RetryFn>,
}

impl RetryQueue {
    /// Spawns the queue's owning task, draining once per `interval` until
    /// the token is cancelled. Entries still queued at cancellation are
    /// dropped.
    pub fn spawn(interval: Duration, token: &CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(inbox, interval, token.clone()));
        (RetryQueue { sender }, handle)
    }

    /// Queues a reconciliation action for periodic re-attempt.
    ///
    /// Never blocks and is safe to call from any task. The queue owns the
    /// action exclusively after submission and drops it on the first
    /// drain cycle in which it succeeds.
    pub fn submit<F, Fut>(&self, action: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: RetryFn = Box::new(move || Box::pin(action()));
        if self.sender.send(action).is_err() {
            // The drain task has already stopped; shutdown is in
            // progress and the intent dies with it.
            debug!("retry queue is stopped, dropping submitted action");
        }
    }
}

async fn run(
    mut inbox: mpsc::UnboundedReceiver<RetryFn>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut pending: Vec<RetryFn> = Vec::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // An interval's first tick completes immediately; a fresh queue
    // should wait a full period before its first drain.
    ticker.tick().await;

    let mut inbox_open = true;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            received = inbox.recv(), if inbox_open => match received {
                Some(action) => pending.push(action),
                None => inbox_open = false,
            },
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                match drain(std::mem::take(&mut pending), &token).await {
                    Some(still_pending) => pending = still_pending,
                    None => return,
                }
            }
        }
    }
}

/// Invokes every queued action once, in insertion order, and builds the
/// next cycle's pending list. The drained list is never mutated while it
/// is being iterated. Returns `None` when cancelled mid-cycle; the
/// in-flight action completes but its outcome is discarded.
async fn drain(actions: Vec<RetryFn>, token: &CancellationToken) -> Option<Vec<RetryFn>> {
    let attempted = actions.len();
    let mut still_pending = Vec::new();
    for action in actions {
        if token.is_cancelled() {
            return None;
        }
        match action().await {
            Ok(()) => {}
            Err(error) => {
                warn!(error = ?error, "failed to complete queued action");
                still_pending.push(action);
            }
        }
    }
    debug!(
        attempted,
        still_pending = still_pending.len(),
        "drain cycle complete",
    );
    Some(still_pending)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn action_succeeding_on_third_attempt_is_invoked_exactly_three_times() {
        let token = CancellationToken::new();
        let (queue, _task) = RetryQueue::spawn(TICK, &token);

        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&invocations);
        queue.submit(move || {
            let invocations = Arc::clone(&counted);
            async move {
                let n = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("still failing");
                }
                Ok(())
            }
        });

        tokio::time::sleep(TICK * 10).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        // The entry is gone from the queue: no further invocations.
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        token.cancel();
    }

    #[tokio::test]
    async fn always_failing_action_is_never_evicted() {
        let token = CancellationToken::new();
        let (queue, _task) = RetryQueue::spawn(TICK, &token);

        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&invocations);
        queue.submit(move || {
            let invocations = Arc::clone(&counted);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("downstream is down")
            }
        });

        tokio::time::sleep(TICK * 8).await;
        assert!(invocations.load(Ordering::SeqCst) >= 5);
        token.cancel();
    }

    #[tokio::test]
    async fn drain_attempts_entries_in_insertion_order() {
        let token = CancellationToken::new();
        let (queue, _task) = RetryQueue::spawn(TICK, &token);

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            queue.submit(move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    anyhow::bail!("keep me queued")
                }
            });
        }

        tokio::time::sleep(TICK * 2).await;
        let seen = order.lock().unwrap().clone();
        assert_eq!(&seen[..3], &["first", "second", "third"]);
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_the_drain_loop() {
        let token = CancellationToken::new();
        let (queue, task) = RetryQueue::spawn(TICK, &token);

        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&invocations);
        queue.submit(move || {
            let invocations = Arc::clone(&counted);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("never succeeds")
            }
        });

        tokio::time::sleep(TICK * 3).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("drain task did not stop")
            .unwrap();

        let after_cancel = invocations.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(invocations.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn submissions_from_concurrent_tasks_are_all_queued() {
        let token = CancellationToken::new();
        let (queue, _task) = RetryQueue::spawn(TICK, &token);

        let invocations = Arc::new(AtomicUsize::new(0));
        let mut submitters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let counted = Arc::clone(&invocations);
            submitters.push(tokio::spawn(async move {
                queue.submit(move || {
                    let invocations = Arc::clone(&counted);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        tokio::time::sleep(TICK * 3).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        token.cancel();
    }
}
