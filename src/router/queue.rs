//! Delivery priority queue.
//!
//! URGENT before NORMAL before LOW, FIFO within a tier. Producers never
//! block: a push either lands or reports the queue full. One consumer (the
//! delivery worker) awaits items.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::message::{Message, Priority};
use crate::types::AgentId;

/// One delivery obligation: a message for one agent.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub message: Arc<Message>,
    pub agent: AgentId,
}

/// Heap entry; `seq` gives FIFO order within a priority.
#[derive(Debug)]
struct PriorityItem {
    priority: Priority,
    seq: u64,
    delivery: QueuedDelivery,
}

impl PartialEq for PriorityItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PriorityItem {}

impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap: higher priority first
        self.priority
            .cmp(&other.priority)
            // Then FIFO for same priority
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Returned when the queue is at capacity or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<PriorityItem>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, non-blocking-producer priority queue.
#[derive(Debug)]
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, delivery: QueuedDelivery) -> Result<(), PushError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PushError::Closed);
            }
            if inner.heap.len() >= self.capacity {
                return Err(PushError::Full);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(PriorityItem {
                priority: delivery.message.priority(),
                seq,
                delivery,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<QueuedDelivery> {
        self.lock().heap.pop().map(|item| item.delivery)
    }

    /// Wait for the next delivery. `None` once closed and empty.
    pub async fn pop(&self) -> Option<QueuedDelivery> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.heap.pop() {
                    return Some(item.delivery);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
