use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobPayload;

const DEFAULT_MAX_ITEMS: usize = 10_000;

/// A unit of work: the job to dispatch and, optionally, its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub job_id: Uuid,
    pub payload: Option<JobPayload>,
}

/// Wire shape `{job_id, ...payload}`.
#[derive(Serialize, Deserialize)]
struct WireItem {
    job_id: Uuid,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl QueueItem {
    pub fn new(job_id: Uuid, payload: JobPayload) -> Self {
        Self {
            job_id,
            payload: Some(payload),
        }
    }

    /// Item carrying only the id; the dispatcher loads the payload itself.
    pub fn bare(job_id: Uuid) -> Self {
        Self {
            job_id,
            payload: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let rest = match &self.payload {
            Some(payload) => match serde_json::to_value(payload)? {
                Value::Object(map) => map,
                other => {
                    return Err(OrchestratorError::Internal(format!(
                        "payload encoded as non-object: {}",
                        other
                    )))
                }
            },
            None => Map::new(),
        };
        Ok(serde_json::to_string(&WireItem {
            job_id: self.job_id,
            rest,
        })?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let wire: WireItem = serde_json::from_str(raw)?;
        let payload = if wire.rest.is_empty() {
            None
        } else {
            Some(serde_json::from_value(Value::Object(wire.rest))?)
        };
        Ok(Self {
            job_id: wire.job_id,
            payload,
        })
    }
}

/// An item handed to one consumer, to be acked or nacked by tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
    pub item: QueueItem,
}

/// At-least-once work queue between submission and dispatch workers.
///
/// An item is delivered to one consumer at a time. Unacknowledged items may
/// be delivered again, so consumers must tolerate duplicates.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Wait for the next item. Returns `None` once the queue is closed.
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return the item to the queue for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Stop handing out items; pending `receive` calls return `None`.
    async fn close(&self);
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(String, u32)>,
    in_flight: HashMap<u64, (String, u32)>,
    next_tag: u64,
    closed: bool,
}

/// In-process work queue holding encoded wire items.
#[derive(Debug)]
pub struct MemoryQueue {
    task_name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    max_items: usize,
}

impl MemoryQueue {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self::with_capacity(task_name, DEFAULT_MAX_ITEMS)
    }

    pub fn with_capacity(task_name: impl Into<String>, max_items: usize) -> Self {
        Self {
            task_name: task_name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_items,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Items waiting for delivery
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items delivered but not yet acknowledged
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Put every unacknowledged item back in the queue, as a broker does when
    /// a consumer connection drops. Returns the number requeued.
    pub async fn requeue_unacked(&self) -> usize {
        let count = {
            let mut state = self.state.lock().await;
            let drained: Vec<(String, u32)> = state.in_flight.drain().map(|(_, v)| v).collect();
            let count = drained.len();
            for (raw, attempt) in drained {
                state.ready.push_back((raw, attempt + 1));
            }
            count
        };
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        let raw = item.encode()?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(OrchestratorError::Queue("queue is closed".into()));
            }
            if state.ready.len() + state.in_flight.len() >= self.max_items {
                return Err(OrchestratorError::Queue(format!(
                    "queue at capacity ({} items)",
                    self.max_items
                )));
            }
            state.ready.push_back((raw, 1));
        }
        tracing::debug!(task = %self.task_name, job_id = %item.job_id, "Item enqueued");
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Ok(None);
                }
                if let Some((raw, attempt)) = state.ready.pop_front() {
                    match QueueItem::decode(&raw) {
                        Ok(item) => {
                            let tag = state.next_tag;
                            state.next_tag += 1;
                            state.in_flight.insert(tag, (raw, attempt));
                            return Ok(Some(Delivery { tag, attempt, item }));
                        }
                        Err(e) => {
                            tracing::error!(task = %self.task_name, error = %e, raw = %raw, "Dropping undecodable queue item");
                            continue;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| {
                OrchestratorError::Queue(format!("unknown delivery tag {}", delivery.tag))
            })
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let (raw, attempt) = state.in_flight.remove(&delivery.tag).ok_or_else(|| {
                OrchestratorError::Queue(format!("unknown delivery tag {}", delivery.tag))
            })?;
            state.ready.push_back((raw, attempt + 1));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn item() -> QueueItem {
        QueueItem::new(
            Uuid::new_v4(),
            JobPayload::new(Some("run".into()), json!({"epochs": 1})),
        )
    }

    #[test]
    fn wire_shape_flattens_payload() {
        let item = item();
        let encoded: Value = serde_json::from_str(&item.encode().unwrap()).unwrap();
        assert_eq!(encoded["job_id"], json!(item.job_id.to_string()));
        assert_eq!(encoded["name"], json!("run"));
        assert_eq!(encoded["config"], json!({"epochs": 1}));
        assert_eq!(QueueItem::decode(&item.encode().unwrap()).unwrap(), item);
    }

    #[test]
    fn bare_item_decodes_without_payload() {
        let id = Uuid::new_v4();
        let decoded = QueueItem::decode(&format!(r#"{{"job_id":"{}"}}"#, id)).unwrap();
        assert_eq!(decoded, QueueItem::bare(id));
    }

    #[tokio::test]
    async fn receive_then_ack() {
        let queue = MemoryQueue::new("tasks");
        let item = item();
        queue.enqueue(item.clone()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.item, item);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(queue.in_flight().await, 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
        assert!(queue.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn nack_redelivers_with_higher_attempt() {
        let queue = MemoryQueue::new("tasks");
        queue.enqueue(item()).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.nack(&first).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.item, first.item);
        assert_eq!(second.attempt, 2);
        assert_ne!(second.tag, first.tag);
    }

    #[tokio::test]
    async fn requeue_unacked_simulates_consumer_crash() {
        let queue = MemoryQueue::new("tasks");
        queue.enqueue(item()).await.unwrap();
        let _lost = queue.receive().await.unwrap().unwrap();

        assert_eq!(queue.requeue_unacked().await, 1);
        assert_eq!(queue.len().await, 1);
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn receive_waits_for_enqueue() {
        let queue = Arc::new(MemoryQueue::new("tasks"));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(item()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(delivery.is_some());
    }

    #[tokio::test]
    async fn close_releases_waiting_consumers() {
        let queue = Arc::new(MemoryQueue::new("tasks"));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(queue.enqueue(item()).await.is_err());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let queue = MemoryQueue::with_capacity("tasks", 1);
        queue.enqueue(item()).await.unwrap();
        assert!(matches!(
            queue.enqueue(item()).await,
            Err(OrchestratorError::Queue(_))
        ));
    }
}
