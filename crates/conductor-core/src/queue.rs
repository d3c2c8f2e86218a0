use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use conductor_types::Priority;

use crate::config::QueueConfig;
use crate::router::ActionRecord;

/// Enqueue rejected: every lane the arrival could displace is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue_full")
    }
}

impl std::error::Error for QueueFull {}

struct QueueInner {
    lanes: [VecDeque<ActionRecord>; 4],
    size: usize,
    /// Lane the current dequeue streak has been serving.
    streak_lane: Option<usize>,
    /// Consecutive dequeues from `streak_lane` while lower work waited.
    streak: u32,
}

impl QueueInner {
    fn first_non_empty(&self) -> Option<usize> {
        self.lanes.iter().position(|lane| !lane.is_empty())
    }

    fn next_non_empty_after(&self, lane: usize) -> Option<usize> {
        self.lanes
            .iter()
            .enumerate()
            .skip(lane + 1)
            .find(|(_, l)| !l.is_empty())
            .map(|(idx, _)| idx)
    }

    fn lowest_non_empty(&self) -> Option<usize> {
        self.lanes.iter().rposition(|lane| !lane.is_empty())
    }
}

/// Bounded four-lane priority queue shared by the router (producer) and the
/// worker pool (consumers). Enqueue is O(1); dequeue scans lanes
/// critical→low with a starvation guard that rescues lower lanes after `K`
/// consecutive same-lane dequeues.
pub struct PriorityQueue {
    inner: StdMutex<QueueInner>,
    notify: Notify,
    max_size: usize,
    guard_k: u32,
}

impl PriorityQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: StdMutex::new(QueueInner {
                lanes: [
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                size: 0,
                streak_lane: None,
                streak: 0,
            }),
            notify: Notify::new(),
            max_size: config.max_size.max(1),
            guard_k: config.starvation_guard_k.max(1),
        }
    }

    /// Admit a record. On overflow the head of the lowest-priority lane is
    /// evicted and returned so the caller can emit its rejection; the
    /// enqueue itself fails only when the would-be victim outranks the
    /// arrival (or ties it at critical).
    pub fn enqueue(&self, record: ActionRecord) -> Result<Option<ActionRecord>, QueueFull> {
        let evicted = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let rank = record.priority().rank();

            let evicted = if inner.size >= self.max_size {
                let victim_lane = inner.lowest_non_empty().ok_or(QueueFull)?;
                let same_lane_ok =
                    victim_lane == rank && record.priority() != Priority::Critical;
                if victim_lane > rank || same_lane_ok {
                    let victim = inner.lanes[victim_lane].pop_front();
                    if victim.is_some() {
                        inner.size -= 1;
                    }
                    victim
                } else {
                    return Err(QueueFull);
                }
            } else {
                None
            };

            inner.lanes[rank].push_back(record);
            inner.size += 1;
            evicted
        };
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Pop the next record, waiting while the queue is empty. Returns
    /// `None` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<ActionRecord> {
        loop {
            let notified = self.notify.notified();
            if let Some(record) = self.try_dequeue() {
                // Wake another worker in case multiple enqueues raced in.
                self.notify.notify_one();
                return Some(record);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Non-blocking pop with starvation accounting.
    pub fn try_dequeue(&self) -> Option<ActionRecord> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let top = inner.first_non_empty()?;
        let lower = inner.next_non_empty_after(top);

        let serve = match lower {
            Some(lower_lane)
                if inner.streak_lane == Some(top) && inner.streak >= self.guard_k =>
            {
                inner.streak = 0;
                lower_lane
            }
            Some(_) => {
                if inner.streak_lane == Some(top) {
                    inner.streak += 1;
                } else {
                    inner.streak_lane = Some(top);
                    inner.streak = 1;
                }
                top
            }
            None => {
                inner.streak_lane = None;
                inner.streak = 0;
                top
            }
        };

        let record = inner.lanes[serve].pop_front();
        if record.is_some() {
            inner.size -= 1;
        }
        record
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{ActionDecision, ActionType, Platform};
    use serde_json::json;

    fn record(id: &str, priority: Priority) -> ActionRecord {
        ActionRecord::new(ActionDecision {
            id: id.to_string(),
            correlation_id: format!("sig-{id}"),
            action_type: ActionType::Log,
            platform: Platform::Slack,
            priority,
            params: json!({}),
            requires_approval: false,
            idempotency_key: Some(format!("ik-{id}")),
            fallback_chain: Vec::new(),
            timeout_ms: None,
            approved_by: None,
            compensates_external_id: None,
        })
    }

    fn queue(max_size: usize, k: u32) -> PriorityQueue {
        PriorityQueue::new(&QueueConfig {
            max_size,
            starvation_guard_k: k,
        })
    }

    #[test]
    fn dequeue_serves_highest_priority_first() {
        let queue = queue(16, 16);
        queue.enqueue(record("low", Priority::Low)).unwrap();
        queue.enqueue(record("crit", Priority::Critical)).unwrap();
        queue.enqueue(record("norm", Priority::Normal)).unwrap();

        assert_eq!(queue.try_dequeue().unwrap().decision.id, "crit");
        assert_eq!(queue.try_dequeue().unwrap().decision.id, "norm");
        assert_eq!(queue.try_dequeue().unwrap().decision.id, "low");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn fifo_within_a_lane() {
        let queue = queue(16, 16);
        queue.enqueue(record("a", Priority::Normal)).unwrap();
        queue.enqueue(record("b", Priority::Normal)).unwrap();
        assert_eq!(queue.try_dequeue().unwrap().decision.id, "a");
        assert_eq!(queue.try_dequeue().unwrap().decision.id, "b");
    }

    #[test]
    fn overflow_evicts_lowest_priority_head() {
        let queue = queue(2, 16);
        queue.enqueue(record("low-1", Priority::Low)).unwrap();
        queue.enqueue(record("low-2", Priority::Low)).unwrap();

        let evicted = queue
            .enqueue(record("crit", Priority::Critical))
            .unwrap()
            .expect("eviction");
        assert_eq!(evicted.decision.id, "low-1");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_dequeue().unwrap().decision.id, "crit");
    }

    #[test]
    fn critical_enqueue_fails_only_when_full_of_critical() {
        let queue = queue(2, 16);
        queue.enqueue(record("c1", Priority::Critical)).unwrap();
        queue.enqueue(record("c2", Priority::Critical)).unwrap();
        assert_eq!(
            queue.enqueue(record("c3", Priority::Critical)),
            Err(QueueFull)
        );
    }

    #[test]
    fn low_arrival_never_displaces_higher_work() {
        let queue = queue(2, 16);
        queue.enqueue(record("n1", Priority::Normal)).unwrap();
        queue.enqueue(record("n2", Priority::Normal)).unwrap();
        assert_eq!(queue.enqueue(record("low", Priority::Low)), Err(QueueFull));
    }

    #[test]
    fn same_priority_overflow_evicts_oldest() {
        let queue = queue(2, 16);
        queue.enqueue(record("n1", Priority::Normal)).unwrap();
        queue.enqueue(record("n2", Priority::Normal)).unwrap();
        let evicted = queue
            .enqueue(record("n3", Priority::Normal))
            .unwrap()
            .expect("eviction");
        assert_eq!(evicted.decision.id, "n1");
    }

    #[test]
    fn starvation_guard_rescues_lower_lane() {
        let queue = queue(64, 2);
        for i in 0..6 {
            queue
                .enqueue(record(&format!("c{i}"), Priority::Critical))
                .unwrap();
        }
        queue.enqueue(record("low", Priority::Low)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|r| r.decision.id)
            .collect();
        // Guard K=2: two criticals, then the low lane is rescued.
        assert_eq!(order[0], "c0");
        assert_eq!(order[1], "c1");
        assert_eq!(order[2], "low");
        assert_eq!(order[3], "c2");
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue_and_honors_cancel() {
        let queue = std::sync::Arc::new(queue(4, 16));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(record("a", Priority::Normal)).unwrap();
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().decision.id, "a");

        let cancelled = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(cancelled.await.unwrap().is_none());
    }
}
