//! Algorithm instances.
//!
//! An instance is a boxed state machine the engine drives with typed
//! events. The instance owns its state outright; destruction is `Drop`,
//! after the engine has delivered the final `Terminated` event. Handlers
//! never touch engine internals directly: everything they want done is
//! recorded on the [`Ctx`] and applied by the engine after the handler
//! returns, which keeps dispatch cooperative and strictly one event at a
//! time.

use std::any::Any;
use std::fmt;
use std::net::IpAddr;

use super::error::Result;
use super::event::{Event, Notice};
use super::options::Options;
use super::probe::Probe;
use crate::packet::{PacketCodec, ProbeFields};

/// Identity of a running algorithm instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance {}", self.0)
    }
}

/// A user-supplied path-discovery state machine.
///
/// `on_event` must not block; long work is re-posted as events. A
/// returned error is unrecoverable for this instance: the engine
/// delivers `Error` then `Terminated` to it and moves on, leaving
/// sibling instances running.
pub trait Algorithm: Send + fmt::Debug {
    fn on_event(&mut self, ctx: &mut Ctx<'_>, event: Event) -> Result<()>;
}

/// Constructor for an algorithm, invoked by `run_instance`.
///
/// The factory validates the merged options and fails synchronously
/// with `InvalidArgument` on bad or unknown keys.
pub type Factory = fn(&Options) -> Result<Box<dyn Algorithm>>;

/// A registered algorithm: its constructor plus registration defaults
/// merged under caller options.
pub(crate) struct Registration {
    pub factory: Factory,
    pub defaults: Options,
}

/// A live instance slot owned by the engine.
pub(crate) struct InstanceSlot {
    pub algorithm: Box<dyn Algorithm>,
    /// Parent in the instance tree; `None` means the engine sink.
    pub caller: Option<InstanceId>,
}

/// Deferred handler effect, applied by the engine after dispatch.
pub(crate) enum Action {
    Send(Probe),
    Emit(Notice),
    Forward(Event),
    Spawn { name: String, options: Options },
    Finish,
}

/// Handler-side view of the engine during one dispatch.
pub struct Ctx<'a> {
    id: InstanceId,
    codec: &'a dyn PacketCodec,
    actions: &'a mut Vec<Action>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        id: InstanceId,
        codec: &'a dyn PacketCodec,
        actions: &'a mut Vec<Action>,
    ) -> Self {
        Self { id, codec, actions }
    }

    /// This instance's identity.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Forge a probe from `fields` and queue it for transmission.
    ///
    /// Forging errors surface immediately; queueing and transmission
    /// happen after the handler returns, and transmission failures come
    /// back as a `SendFailed` event.
    pub fn send_probe(&mut self, fields: ProbeFields) -> Result<()> {
        let packet = self.codec.forge(&fields)?;
        let probe = Probe::new(fields, packet, IpAddr::V4(fields.dst), self.id);
        self.actions.push(Action::Send(probe));
        Ok(())
    }

    /// Emit an algorithm-defined notice to this instance's caller.
    pub fn emit<T: Any + Send + Sync>(&mut self, payload: T) {
        self.actions
            .push(Action::Emit(Notice::new(self.id, payload)));
    }

    /// Forward an event to this instance's caller unchanged.
    ///
    /// The forwarded copy shares the original payloads; nothing is
    /// duplicated.
    pub fn forward(&mut self, event: Event) {
        self.actions.push(Action::Forward(event));
    }

    /// Spawn a child instance of a registered algorithm.
    ///
    /// The child's caller is this instance; its notices and forwarded
    /// events are dispatched here.
    pub fn spawn(&mut self, name: impl Into<String>, options: Options) {
        self.actions.push(Action::Spawn {
            name: name.into(),
            options,
        });
    }

    /// Request termination of this instance.
    ///
    /// The engine delivers a final `Terminated` event, drops the
    /// instance, disarms deadlines of its in-flight probes, and discards
    /// its queued probes.
    pub fn finish(&mut self) {
        self.actions.push(Action::Finish);
    }
}
