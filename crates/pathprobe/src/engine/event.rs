//! Typed events dispatched to algorithm instances.
//!
//! Every event the loop delivers is one of these variants. Payloads are
//! behind `Arc` so forwarding an event to an instance's caller is a cheap
//! clone and the forwarded copy shares the original probe and reply
//! records rather than duplicating or borrowing them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::error::Error;
use super::instance::InstanceId;
use super::probe::{Probe, Reply};

/// Event delivered to an algorithm instance, or forwarded to its caller.
#[derive(Debug, Clone)]
pub enum Event {
    /// Delivered once at creation; the instance sends its first probes
    /// from here.
    Init,
    /// A captured reply matched one of this instance's probes.
    ProbeReply { probe: Arc<Probe>, reply: Arc<Reply> },
    /// A probe of this instance expired without a reply.
    ProbeTimeout { probe: Arc<Probe> },
    /// Transmission failed after the retry.
    SendFailed { probe: Arc<Probe>, cause: Arc<Error> },
    /// Unrecoverable instance failure; always followed by `Terminated`.
    Error { cause: Arc<Error> },
    /// The instance is being destroyed. Last event it ever sees.
    Terminated,
    /// An algorithm-defined notification, forwarded from an instance to
    /// its caller.
    Notice(Notice),
}

/// An algorithm-defined notification.
///
/// The engine does not interpret the payload; callers downcast to the
/// concrete type the algorithm documents (e.g. `TraceNotice` for the
/// traceroute algorithm). The payload is shared by reference: clones of
/// the notice all point at the same value.
#[derive(Clone)]
pub struct Notice {
    source: InstanceId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Notice {
    /// Wrap an algorithm-defined payload.
    pub fn new<T: Any + Send + Sync>(source: InstanceId, payload: T) -> Self {
        Self {
            source,
            payload: Arc::new(payload),
        }
    }

    /// The instance that emitted this notice.
    pub fn source(&self) -> InstanceId {
        self.source
    }

    /// Borrow the payload as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notice")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn test_notice_downcast() {
        let notice = Notice::new(InstanceId(3), Marker(7));
        assert_eq!(notice.source(), InstanceId(3));
        assert_eq!(notice.downcast_ref::<Marker>(), Some(&Marker(7)));
        assert!(notice.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_notice_clones_share_payload() {
        let notice = Notice::new(InstanceId(1), Marker(9));
        let copy = notice.clone();
        let a: *const Marker = notice.downcast_ref::<Marker>().unwrap();
        let b: *const Marker = copy.downcast_ref::<Marker>().unwrap();
        assert_eq!(a, b);
    }
}
