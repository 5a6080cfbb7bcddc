use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::waybill::RunType;

/// A single reconciliation request for one namespace, as enumerated in
/// spec.md §4.5/§6: what kind of trigger produced it, and which Waybill it
/// targets.
#[derive(Debug, Clone)]
pub struct Request {
    pub namespace: String,
    pub run_type: RunType,
}

impl Request {
    pub fn new(namespace: impl Into<String>, run_type: RunType) -> Self {
        Self {
            namespace: namespace.into(),
            run_type,
        }
    }

    fn coalesce_key(&self) -> (String, RunType) {
        (self.namespace.clone(), self.run_type.clone())
    }
}

/// Bounded MPSC queue feeding the Runner pool. Capacity comes from
/// `SchedulerConfig::run_queue_capacity`; when the queue is full, per
/// spec.md §4.6 the producer logs and drops the request rather than
/// blocking the scheduler loop that tried to enqueue it. Per spec.md §2's
/// component table, requests also coalesce by `(namespace, trigger kind)`
/// while a matching request is already waiting to be picked up -- since
/// spec.md §3's "at most one Waybill per namespace" invariant makes
/// namespace an adequate stand-in for "namespace+name", a namespace can
/// never have two distinct Waybills whose requests would collide here.
pub struct RunQueue {
    sender: RunQueueSender,
    receiver: tokio::sync::mpsc::Receiver<Request>,
    pending: Arc<Mutex<HashSet<(String, RunType)>>>,
}

/// The write half, handed out to the Scheduler's loops and the status
/// server's force-run endpoint. Cloning is cheap, matching
/// `tokio::sync::mpsc::Sender`'s own semantics.
#[derive(Clone)]
pub struct RunQueueSender {
    inner: tokio::sync::mpsc::Sender<Request>,
    pending: Arc<Mutex<HashSet<(String, RunType)>>>,
}

impl RunQueueSender {
    /// Enqueues `req`, dropping it with a log line if the queue is full or
    /// if an equivalent request (same namespace, same trigger kind) is
    /// already waiting in the queue. Never blocks: a full run queue means
    /// the Scheduler is producing faster than the Runner pool can drain,
    /// and spec.md §4.6 treats that as "skip this one, the next tick will
    /// try again" rather than backpressuring the scheduling loops.
    pub fn try_enqueue(&self, req: Request) {
        let key = req.coalesce_key();
        {
            let mut pending = self.pending.lock().expect("run queue pending set poisoned");
            if !pending.insert(key.clone()) {
                log::debug!(
                    "run queue: coalescing {:?} request for namespace {} with one already pending",
                    req.run_type,
                    req.namespace
                );
                return;
            }
        }
        match self.inner.try_send(req) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(req)) => {
                self.pending.lock().expect("run queue pending set poisoned").remove(&key);
                log::warn!(
                    "run queue full, dropping {:?} request for namespace {}",
                    req.run_type,
                    req.namespace
                );
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(req)) => {
                self.pending.lock().expect("run queue pending set poisoned").remove(&key);
                log::warn!(
                    "run queue closed, dropping {:?} request for namespace {}",
                    req.run_type,
                    req.namespace
                );
            }
        }
    }
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        let pending = Arc::new(Mutex::new(HashSet::new()));
        Self {
            sender: RunQueueSender {
                inner: sender,
                pending: pending.clone(),
            },
            receiver,
            pending,
        }
    }

    pub fn sender(&self) -> RunQueueSender {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<Request> {
        let req = self.receiver.recv().await?;
        self.pending
            .lock()
            .expect("run queue pending set poisoned")
            .remove(&req.coalesce_key());
        Some(req)
    }

    /// Splits off the receive half so a worker pool can share it behind a
    /// lock (`tokio::sync::mpsc::Receiver` has only one consumer; the
    /// Runner's pool of tasks takes turns under a mutex rather than each
    /// having its own channel). The coalescing set moves with it so
    /// dequeues via the shared receiver still clear pending entries.
    pub fn into_receiver(self) -> CoalescingReceiver {
        CoalescingReceiver {
            receiver: self.receiver,
            pending: self.pending,
        }
    }
}

/// The receive half after `into_receiver`, still clearing the coalescing
/// set on each pop so a subsequent identical request can be enqueued again.
pub struct CoalescingReceiver {
    receiver: tokio::sync::mpsc::Receiver<Request>,
    pending: Arc<Mutex<HashSet<(String, RunType)>>>,
}

impl CoalescingReceiver {
    pub async fn recv(&mut self) -> Option<Request> {
        let req = self.receiver.recv().await?;
        self.pending
            .lock()
            .expect("run queue pending set poisoned")
            .remove(&req.coalesce_key());
        Some(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueued_request_is_received_in_order() {
        let mut queue = RunQueue::new(4);
        let sender = queue.sender();
        sender.try_enqueue(Request::new("ns-a", RunType::Scheduled));
        sender.try_enqueue(Request::new("ns-b", RunType::Forced));

        let first = queue.recv().await.unwrap();
        let second = queue.recv().await.unwrap();
        assert_eq!(first.namespace, "ns-a");
        assert_eq!(second.namespace, "ns-b");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let queue = RunQueue::new(1);
        let sender = queue.sender();
        sender.try_enqueue(Request::new("ns-a", RunType::Scheduled));
        // Should not block or panic, just log and drop.
        sender.try_enqueue(Request::new("ns-b", RunType::Scheduled));
    }

    #[tokio::test]
    async fn duplicate_pending_request_is_coalesced() {
        let mut queue = RunQueue::new(4);
        let sender = queue.sender();
        sender.try_enqueue(Request::new("ns-a", RunType::Scheduled));
        // Same namespace + trigger kind as an already-pending request: should
        // be coalesced away rather than queued a second time.
        sender.try_enqueue(Request::new("ns-a", RunType::Scheduled));
        sender.try_enqueue(Request::new("ns-a", RunType::Forced));

        let first = queue.recv().await.unwrap();
        assert_eq!(first.run_type, RunType::Scheduled);
        let second = queue.recv().await.unwrap();
        assert_eq!(second.run_type, RunType::Forced);

        // Once drained, an identical request can be enqueued again.
        sender.try_enqueue(Request::new("ns-a", RunType::Scheduled));
        let third = queue.recv().await.unwrap();
        assert_eq!(third.run_type, RunType::Scheduled);
    }
}
