//! Send and receive queues.
//!
//! Both queues are plain FIFOs whose readiness is signaled through a
//! [`Notify`], so the event loop can park in a `select!` until one of them
//! has work. The send queue lives entirely on the loop task; the receive
//! queue is shared with the sniffer, which may run on another task or
//! thread, so its interior is mutex-guarded and its push handle
//! ([`ReplySink`]) is cloneable.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::error::{Error, Result};
use super::probe::{Probe, Reply};

/// Default bound for the send queue.
pub const DEFAULT_SEND_CAPACITY: usize = 1024;

/// Bounded FIFO of probes ready for transmission.
pub struct SendQueue {
    inner: VecDeque<Probe>,
    capacity: usize,
    notify: Arc<Notify>,
}

impl SendQueue {
    /// Create a queue with the given capacity bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::new(),
            capacity,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a probe. O(1), never blocks; fails only when the bound
    /// is hit.
    pub fn push(&mut self, probe: Probe) -> Result<()> {
        if self.inner.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        self.inner.push_back(probe);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest pending probe.
    pub fn pop(&mut self) -> Option<Probe> {
        self.inner.pop_front()
    }

    /// Number of pending probes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop pending probes that fail the predicate.
    ///
    /// Used when an instance terminates: its queued probes must never
    /// reach the wire.
    pub(crate) fn retain(&mut self, keep: impl FnMut(&Probe) -> bool) {
        self.inner.retain(keep);
    }

    /// Wait until the queue is non-empty.
    ///
    /// Level-equivalent: returns immediately when items are already
    /// queued, otherwise parks until the next `push`.
    pub async fn readable(&self) {
        if !self.inner.is_empty() {
            return;
        }
        self.notify.notified().await;
    }
}

/// FIFO of captured replies awaiting matching.
///
/// The pop side belongs to the engine; the push side is exposed as a
/// [`ReplySink`] handed to the sniffer.
pub struct ReplyQueue {
    shared: Arc<ReplyShared>,
}

struct ReplyShared {
    inner: Mutex<VecDeque<Reply>>,
    notify: Notify,
}

/// Cloneable push handle for the receive queue.
///
/// This is the only engine state the sniffer touches, and the only
/// state that may cross a thread boundary.
#[derive(Clone)]
pub struct ReplySink {
    shared: Arc<ReplyShared>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReplyShared {
                inner: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Get a push handle for a capture producer.
    pub fn sink(&self) -> ReplySink {
        ReplySink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Dequeue the oldest captured reply.
    pub fn pop(&self) -> Option<Reply> {
        self.shared.inner.lock().expect("reply queue poisoned").pop_front()
    }

    /// Wait until the queue is non-empty.
    pub async fn readable(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if !self.shared.inner.lock().expect("reply queue poisoned").is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplySink {
    /// Enqueue a captured reply and wake the loop.
    pub fn push(&self, reply: Reply) {
        self.shared
            .inner
            .lock()
            .expect("reply queue poisoned")
            .push_back(reply);
        self.shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::instance::InstanceId;
    use crate::packet::ProbeFields;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::Instant;

    fn probe() -> Probe {
        let dst = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let fields = ProbeFields {
            dst: Ipv4Addr::LOCALHOST,
            ttl: 1,
            identifier: 1,
            sequence: 1,
        };
        Probe::new(fields, Bytes::from_static(b"p"), dst, InstanceId(0))
    }

    #[test]
    fn test_send_queue_fifo_and_bound() {
        let mut q = SendQueue::new(2);
        q.push(probe()).unwrap();
        q.push(probe()).unwrap();
        assert!(matches!(
            q.push(probe()),
            Err(Error::QueueFull { capacity: 2 })
        ));
        assert_eq!(q.len(), 2);
        q.pop().unwrap();
        q.pop().unwrap();
        assert!(q.pop().is_none());
    }

    #[tokio::test]
    async fn test_send_queue_readable_when_nonempty() {
        let mut q = SendQueue::new(8);
        q.push(probe()).unwrap();
        // Must not park: items are already queued.
        q.readable().await;
    }

    #[tokio::test]
    async fn test_reply_sink_wakes_reader() {
        let q = ReplyQueue::new();
        let sink = q.sink();

        let push = tokio::spawn(async move {
            let reply = Reply::new(
                Bytes::from_static(b"r"),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                Instant::now(),
            );
            sink.push(reply);
        });

        q.readable().await;
        assert!(q.pop().is_some());
        push.await.unwrap();
    }

    #[test]
    fn test_reply_queue_cross_thread_push() {
        let q = ReplyQueue::new();
        let sink = q.sink();
        let handle = std::thread::spawn(move || {
            for _ in 0..64 {
                sink.push(Reply::new(
                    Bytes::new(),
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    Instant::now(),
                ));
            }
        });
        handle.join().unwrap();
        let mut drained = 0;
        while q.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 64);
    }
}
