//! Control messages that do not belong to a session buffer.
//!
//! Session create requests and agent-initiated terminates go here; the writer
//! drains this queue ahead of any session data, highest priority first and
//! FIFO within a priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use chroma_agent_core::{Message, Priority};
use tokio::sync::Notify;

#[derive(Debug)]
struct Entry {
    priority: Priority,
    order: u64,
    message: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_order: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    wake: Arc<Notify>,
}

impl OutboundQueue {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wake,
        }
    }

    pub fn push(&self, message: Message, priority: Priority) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let order = inner.next_order;
            inner.next_order += 1;
            inner.heap.push(Entry {
                priority,
                order,
                message,
            });
        }
        self.wake.notify_one();
    }

    pub fn pop(&self) -> Option<(Message, Priority)> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.heap.pop().map(|e| (e.message, e.priority))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued for `plugin`.
    pub fn discard_plugin(&self, plugin: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.heap.retain(|e| e.message.plugin() != Some(plugin));
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).heap.clear();
    }
}
