use crate::{
    models::{Priority, QueueName},
    MendError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// A ready or claimed unit of queue work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue: QueueName,
    pub task_id: String,
    pub fingerprint: String,
    pub priority: Priority,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
}

/// What happened to a nacked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32 },
    /// Attempt budget exhausted; the caller transitions the task to
    /// `failed` with reason `max-retries`.
    DeadLettered,
}

/// An item that exhausted its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub dead_at: chrono::DateTime<chrono::Utc>,
}

/// Point-in-time view for `queue inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub ready: HashMap<QueueName, Vec<QueueItem>>,
    pub in_flight: HashMap<QueueName, Vec<QueueItem>>,
    pub dead_letters: Vec<DeadLetter>,
}

/// Two-stage work queue contract.
///
/// Delivery is at-least-once: a claim hides the item until its visibility
/// deadline, and a worker that neither acks nor nacks in time loses the
/// claim to the next caller (with the attempt count bumped).
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a task. Rejects with `Duplicate` when a task with the same
    /// fingerprint is already enqueued or in flight on either queue, and
    /// with `QueueFull` above the high-water mark (unless the queue was
    /// built in blocking mode, in which case the call waits).
    async fn enqueue(
        &self,
        queue: QueueName,
        task_id: &str,
        fingerprint: &str,
        priority: Priority,
    ) -> Result<()>;

    /// Claim at most one item, hiding it for `visibility`. Highest
    /// priority first, FIFO within a priority.
    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<Option<QueueItem>>;

    /// Acknowledge successful processing; the item is removed.
    async fn ack(&self, queue: QueueName, task_id: &str, worker_id: &str) -> Result<()>;

    /// Return a claimed item to the queue, optionally delayed for
    /// backoff. Attempts past the budget drain to the dead-letter
    /// channel instead.
    async fn nack(
        &self,
        queue: QueueName,
        task_id: &str,
        worker_id: &str,
        delay: Option<Duration>,
    ) -> Result<NackOutcome>;

    /// Heartbeat: push the claim deadline out by `visibility` again.
    async fn extend(
        &self,
        queue: QueueName,
        task_id: &str,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<()>;

    /// Drop a ready (unclaimed) item, freeing its fingerprint. Used when
    /// a task is cancelled before any worker picks it up.
    async fn remove_ready(&self, task_id: &str) -> Result<bool>;

    async fn depth(&self, queue: QueueName) -> usize;

    async fn inspect(&self) -> QueueSnapshot;

    /// Take all accumulated dead letters; the supervisor fails their tasks.
    async fn drain_dead_letters(&self) -> Vec<DeadLetter>;
}

struct ReadyItem {
    item: QueueItem,
    /// FIFO tiebreaker within a priority band.
    seq: u64,
    /// Backoff: invisible until this instant.
    not_before: Instant,
}

struct ClaimedItem {
    item: QueueItem,
    worker_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: Vec<ReadyItem>,
    in_flight: HashMap<String, ClaimedItem>,
}

struct QueueInner {
    queues: HashMap<QueueName, QueueState>,
    /// fingerprint → task id for every enqueued or in-flight item, the
    /// queue-level half of the dedup invariant.
    fingerprints: HashMap<String, String>,
    dead_letters: Vec<DeadLetter>,
    next_seq: u64,
}

/// Remove an in-flight claim, verifying the calling worker still holds it.
fn take_claim(
    inner: &mut QueueInner,
    queue: QueueName,
    task_id: &str,
    worker_id: &str,
) -> Result<ClaimedItem> {
    let state = inner.queues.get_mut(&queue).expect("queue exists");
    let holds = state
        .in_flight
        .get(task_id)
        .map(|claimed| claimed.worker_id == worker_id);
    match holds {
        Some(true) => Ok(state.in_flight.remove(task_id).expect("present")),
        Some(false) => Err(MendError::NotFound(format!(
            "claim on {task_id} is held by another worker"
        ))),
        None => Err(MendError::NotFound(format!(
            "no in-flight claim for {task_id} on {queue}"
        ))),
    }
}

/// In-memory queue implementation.
pub struct MemoryWorkQueue {
    inner: Arc<Mutex<QueueInner>>,
    capacity_freed: Arc<Notify>,
    high_water: usize,
    block_on_full: bool,
    max_attempts: u32,
}

impl MemoryWorkQueue {
    pub fn new(high_water: usize, block_on_full: bool, max_attempts: u32) -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueName::Plan, QueueState::default());
        queues.insert(QueueName::Execute, QueueState::default());
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                queues,
                fingerprints: HashMap::new(),
                dead_letters: Vec::new(),
                next_seq: 0,
            })),
            capacity_freed: Arc::new(Notify::new()),
            high_water,
            block_on_full,
            max_attempts,
        }
    }

    /// Move expired claims back to ready (or to the dead-letter channel
    /// once the attempt budget is gone). Runs lazily at every claim.
    fn reclaim_expired(inner: &mut QueueInner, queue: QueueName, max_attempts: u32, now: Instant) {
        let expired: Vec<QueueItem> = {
            let state = inner.queues.get_mut(&queue).expect("queue exists");
            let ids: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, claimed)| claimed.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.in_flight.remove(&id))
                .map(|claimed| claimed.item)
                .collect()
        };

        for mut item in expired {
            item.attempts += 1;
            warn!(
                task_id = %item.task_id,
                queue = %queue,
                attempts = item.attempts,
                "Claim expired, reclaiming"
            );
            if item.attempts >= max_attempts {
                inner.fingerprints.remove(&item.fingerprint);
                inner.dead_letters.push(DeadLetter {
                    item,
                    dead_at: chrono::Utc::now(),
                });
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let state = inner.queues.get_mut(&queue).expect("queue exists");
                state.ready.push(ReadyItem {
                    item,
                    seq,
                    not_before: now,
                });
            }
        }
    }

    fn try_enqueue(&self, inner: &mut QueueInner, item: QueueItem) -> Result<bool> {
        if let Some(existing) = inner.fingerprints.get(&item.fingerprint) {
            return Err(MendError::Duplicate {
                task_id: existing.clone(),
            });
        }

        let depth = {
            let state = inner.queues.get(&item.queue).expect("queue exists");
            state.ready.len() + state.in_flight.len()
        };
        if depth >= self.high_water {
            return Ok(false);
        }

        inner
            .fingerprints
            .insert(item.fingerprint.clone(), item.task_id.clone());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(task_id = %item.task_id, queue = %item.queue, "Enqueued");
        let state = inner.queues.get_mut(&item.queue).expect("queue exists");
        state.ready.push(ReadyItem {
            item,
            seq,
            not_before: Instant::now(),
        });
        Ok(true)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        task_id: &str,
        fingerprint: &str,
        priority: Priority,
    ) -> Result<()> {
        let item = QueueItem {
            queue,
            task_id: task_id.to_string(),
            fingerprint: fingerprint.to_string(),
            priority,
            enqueued_at: chrono::Utc::now(),
            attempts: 0,
        };

        loop {
            // Register for the capacity signal before checking, so a
            // concurrent ack between the check and the wait cannot be
            // missed.
            let notified = self.capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if self.try_enqueue(&mut inner, item.clone())? {
                    return Ok(());
                }
            }
            if !self.block_on_full {
                return Err(MendError::QueueFull {
                    queue: queue.to_string(),
                });
            }
            notified.await;
        }
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<Option<QueueItem>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Self::reclaim_expired(&mut inner, queue, self.max_attempts, now);

        let state = inner.queues.get_mut(&queue).expect("queue exists");

        // Highest priority first; FIFO by enqueue sequence inside a band.
        let best = state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, r)| r.not_before <= now)
            .max_by(|(_, a), (_, b)| {
                a.item
                    .priority
                    .cmp(&b.item.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(idx, _)| idx);

        let Some(idx) = best else {
            return Ok(None);
        };

        let ready = state.ready.swap_remove(idx);
        let item = ready.item.clone();
        state.in_flight.insert(
            item.task_id.clone(),
            ClaimedItem {
                item: ready.item,
                worker_id: worker_id.to_string(),
                deadline: now + visibility,
            },
        );
        debug!(task_id = %item.task_id, queue = %queue, worker = worker_id, "Claimed");
        Ok(Some(item))
    }

    async fn ack(&self, queue: QueueName, task_id: &str, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let claimed = take_claim(&mut inner, queue, task_id, worker_id)?;
        inner.fingerprints.remove(&claimed.item.fingerprint);
        self.capacity_freed.notify_waiters();
        Ok(())
    }

    async fn nack(
        &self,
        queue: QueueName,
        task_id: &str,
        worker_id: &str,
        delay: Option<Duration>,
    ) -> Result<NackOutcome> {
        let mut inner = self.inner.lock().await;
        let claimed = take_claim(&mut inner, queue, task_id, worker_id)?;
        let mut item = claimed.item;
        item.attempts += 1;

        if item.attempts >= self.max_attempts {
            info!(task_id = %item.task_id, attempts = item.attempts, "Dead-lettering item");
            inner.fingerprints.remove(&item.fingerprint);
            inner.dead_letters.push(DeadLetter {
                item,
                dead_at: chrono::Utc::now(),
            });
            self.capacity_freed.notify_waiters();
            return Ok(NackOutcome::DeadLettered);
        }

        let attempts = item.attempts;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let state = inner.queues.get_mut(&queue).expect("queue exists");
        state.ready.push(ReadyItem {
            item,
            seq,
            not_before: Instant::now() + delay.unwrap_or(Duration::ZERO),
        });
        Ok(NackOutcome::Requeued { attempts })
    }

    async fn extend(
        &self,
        queue: QueueName,
        task_id: &str,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.queues.get_mut(&queue).expect("queue exists");

        match state.in_flight.get_mut(task_id) {
            Some(claimed) if claimed.worker_id == worker_id => {
                claimed.deadline = Instant::now() + visibility;
                Ok(())
            }
            _ => Err(MendError::NotFound(format!(
                "no extendable claim for {task_id} on {queue}"
            ))),
        }
    }

    async fn remove_ready(&self, task_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        for queue in [QueueName::Plan, QueueName::Execute] {
            let state = inner.queues.get_mut(&queue).expect("queue exists");
            if let Some(idx) = state.ready.iter().position(|r| r.item.task_id == task_id) {
                let removed = state.ready.swap_remove(idx);
                inner.fingerprints.remove(&removed.item.fingerprint);
                self.capacity_freed.notify_waiters();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn depth(&self, queue: QueueName) -> usize {
        let inner = self.inner.lock().await;
        let state = inner.queues.get(&queue).expect("queue exists");
        state.ready.len() + state.in_flight.len()
    }

    async fn inspect(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut ready = HashMap::new();
        let mut in_flight = HashMap::new();
        for (name, state) in &inner.queues {
            let mut items: Vec<&ReadyItem> = state.ready.iter().collect();
            items.sort_by(|a, b| {
                b.item
                    .priority
                    .cmp(&a.item.priority)
                    .then_with(|| a.seq.cmp(&b.seq))
            });
            ready.insert(*name, items.into_iter().map(|r| r.item.clone()).collect());
            in_flight.insert(
                *name,
                state.in_flight.values().map(|c| c.item.clone()).collect(),
            );
        }
        QueueSnapshot {
            ready,
            in_flight,
            dead_letters: inner.dead_letters.clone(),
        }
    }

    async fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        let mut inner = self.inner.lock().await;
        std::mem::take(&mut inner.dead_letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MemoryWorkQueue {
        MemoryWorkQueue::new(10, false, 5)
    }

    async fn enqueue(q: &MemoryWorkQueue, task: &str, priority: Priority) {
        q.enqueue(QueueName::Plan, task, &format!("fp-{task}"), priority)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let q = queue();
        enqueue(&q, "low", Priority::Low).await;
        enqueue(&q, "first-normal", Priority::Normal).await;
        enqueue(&q, "critical", Priority::Critical).await;
        enqueue(&q, "second-normal", Priority::Normal).await;

        let visibility = Duration::from_secs(30);
        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some(item) = q.claim(QueueName::Plan, "w1", visibility).await.unwrap() {
                out.push(item.task_id.clone());
                q.ack(QueueName::Plan, &item.task_id, "w1").await.unwrap();
            }
            out
        };
        assert_eq!(order, vec!["critical", "first-normal", "second-normal", "low"]);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_rejected_while_enqueued_or_in_flight() {
        let q = queue();
        q.enqueue(QueueName::Plan, "t1", "fp-1", Priority::Normal)
            .await
            .unwrap();

        let err = q
            .enqueue(QueueName::Plan, "t2", "fp-1", Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, MendError::Duplicate { task_id } if task_id == "t1"));

        // Still duplicate while claimed.
        let item = q
            .claim(QueueName::Plan, "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let err = q
            .enqueue(QueueName::Execute, "t2", "fp-1", Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, MendError::Duplicate { .. }));

        // Freed after ack.
        q.ack(QueueName::Plan, &item.task_id, "w1").await.unwrap();
        q.enqueue(QueueName::Execute, "t2", "fp-1", Priority::Normal)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimed_with_attempt_bump() {
        let q = queue();
        enqueue(&q, "t1", Priority::Normal).await;

        let item = q
            .claim(QueueName::Plan, "w1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.attempts, 0);

        // Deadline was immediate, so the next claim reclaims it.
        let item = q
            .claim(QueueName::Plan, "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.task_id, "t1");
        assert_eq!(item.attempts, 1);

        // The original worker can no longer ack.
        let err = q.ack(QueueName::Plan, "t1", "w1").await.unwrap_err();
        assert!(matches!(err, MendError::NotFound(_)));
    }

    #[tokio::test]
    async fn nack_past_budget_dead_letters() {
        let q = MemoryWorkQueue::new(10, false, 2);
        enqueue(&q, "t1", Priority::Normal).await;

        let visibility = Duration::from_secs(30);
        let item = q.claim(QueueName::Plan, "w1", visibility).await.unwrap().unwrap();
        let outcome = q
            .nack(QueueName::Plan, &item.task_id, "w1", None)
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::Requeued { attempts: 1 });

        let item = q.claim(QueueName::Plan, "w1", visibility).await.unwrap().unwrap();
        let outcome = q
            .nack(QueueName::Plan, &item.task_id, "w1", None)
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);

        assert!(q
            .claim(QueueName::Plan, "w1", visibility)
            .await
            .unwrap()
            .is_none());
        let dead = q.drain_dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.task_id, "t1");

        // Fingerprint is free again after dead-lettering.
        q.enqueue(QueueName::Plan, "t1b", "fp-t1", Priority::Normal)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn high_water_rejects_fast_when_not_blocking() {
        let q = MemoryWorkQueue::new(2, false, 5);
        enqueue(&q, "t1", Priority::Normal).await;
        enqueue(&q, "t2", Priority::Normal).await;

        let err = q
            .enqueue(QueueName::Plan, "t3", "fp-t3", Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, MendError::QueueFull { .. }));

        // The other queue has its own depth.
        q.enqueue(QueueName::Execute, "t4", "fp-t4", Priority::Normal)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn blocking_enqueue_waits_for_capacity() {
        let q = Arc::new(MemoryWorkQueue::new(1, true, 5));
        enqueue(&q, "t1", Priority::Normal).await;

        let q2 = q.clone();
        let pending = tokio::spawn(async move {
            q2.enqueue(QueueName::Plan, "t2", "fp-t2", Priority::Normal)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let item = q
            .claim(QueueName::Plan, "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        q.ack(QueueName::Plan, &item.task_id, "w1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("enqueue should unblock")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn extend_pushes_deadline_out() {
        let q = queue();
        enqueue(&q, "t1", Priority::Normal).await;

        let item = q
            .claim(QueueName::Plan, "w1", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        q.extend(QueueName::Plan, &item.task_id, "w1", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Original visibility elapsed but the heartbeat kept the claim.
        assert!(q
            .claim(QueueName::Plan, "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn remove_ready_frees_fingerprint() {
        let q = queue();
        enqueue(&q, "t1", Priority::Normal).await;
        assert!(q.remove_ready("t1").await.unwrap());
        assert!(!q.remove_ready("t1").await.unwrap());
        enqueue(&q, "t1", Priority::Normal).await;
    }
}
