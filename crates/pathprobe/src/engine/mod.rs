//! The probe-lifecycle engine.
//!
//! One cooperative event loop multiplexes the send queue, the receive
//! queue fed by the sniffer, the probe deadline timer, and the events
//! algorithm instances emit. Each tick services ready sources in a fixed
//! priority order (captured replies, then expired deadlines, then
//! pending transmissions, then algorithm events) so a reply already
//! sitting in the queue is always matched before its probe's own
//! deadline can fire.
//!
//! # Example
//!
//! ```ignore
//! use pathprobe::engine::{Engine, Options};
//! use pathprobe::sniffer::IcmpSniffer;
//! use pathprobe::trace;
//!
//! let mut engine = Engine::new();
//! engine.attach_sniffer(Box::new(IcmpSniffer::new()))?;
//! trace::register(&mut engine);
//!
//! let opts = Options::new()
//!     .set_str("dst-ip", "192.0.2.7")
//!     .set_int("max-ttl", 16);
//! engine.run_instance("traceroute", opts, None)?;
//!
//! let mut events = engine.subscribe();
//! tokio::spawn(async move { engine.run().await });
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

mod error;
pub mod event;
pub mod instance;
pub mod options;
pub mod probe;
pub mod queue;
mod socket;
pub mod timer;

pub use error::{Error, Result};
pub use event::{Event, Notice};
pub use instance::{Algorithm, Ctx, Factory, InstanceId};
pub use options::{OptionValue, Options};
pub use probe::{Probe, ProbeTag, Reply};
pub use queue::ReplySink;
pub use socket::{Family, RawSocket, SocketPool, Transport, WireProtocol};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

use crate::packet::{IcmpCodec, PacketCodec};
use crate::sniffer::Sniffer;
use instance::{Action, InstanceSlot, Registration};
use queue::{DEFAULT_SEND_CAPACITY, ReplyQueue, SendQueue};
use timer::TimerWheel;

/// Engine-wide probe timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes drained from the send queue per transmit pass.
const DEFAULT_BATCH: usize = 1;

/// The probe engine.
///
/// Owns the queues, the socket pool, the deadline timer, the in-flight
/// probe list, and the algorithm instances. All state is touched only
/// from the loop task; the single concurrency boundary is the sniffer
/// pushing captured replies into the receive queue.
pub struct Engine {
    codec: Arc<dyn PacketCodec>,
    transport: Box<dyn Transport>,
    sendq: SendQueue,
    recvq: ReplyQueue,
    sniffer: Option<Box<dyn Sniffer>>,
    timer: TimerWheel,
    /// In-flight probes, oldest first. Insertion order is send order is
    /// deadline order.
    in_flight: VecDeque<Probe>,
    next_tag: u64,
    timeout: Duration,
    batch: usize,
    registry: HashMap<String, Registration>,
    instances: HashMap<InstanceId, InstanceSlot>,
    next_instance: u64,
    /// Events awaiting dispatch, in emission order.
    pending: VecDeque<(InstanceId, Event)>,
    sink: mpsc::UnboundedSender<Event>,
    shutdown: Arc<Shutdown>,
}

impl Engine {
    /// Create an engine with the ICMP codec and the raw socket pool.
    pub fn new() -> Self {
        Self::with_parts(Arc::new(IcmpCodec::new()), Box::new(SocketPool::new()))
    }

    /// Create an engine over a custom codec and transport.
    ///
    /// This is the seam scenario tests use: a scripted transport lets
    /// the whole engine run without privileges or a network.
    pub fn with_parts(codec: Arc<dyn PacketCodec>, transport: Box<dyn Transport>) -> Self {
        let (sink, _discarded) = mpsc::unbounded_channel();
        Self {
            codec,
            transport,
            sendq: SendQueue::new(DEFAULT_SEND_CAPACITY),
            recvq: ReplyQueue::new(),
            sniffer: None,
            timer: TimerWheel::new(),
            in_flight: VecDeque::new(),
            next_tag: 1,
            timeout: DEFAULT_TIMEOUT,
            batch: DEFAULT_BATCH,
            registry: HashMap::new(),
            instances: HashMap::new(),
            next_instance: 1,
            pending: VecDeque::new(),
            sink,
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Attach and start a capture source feeding the receive queue.
    pub fn attach_sniffer(&mut self, mut sniffer: Box<dyn Sniffer>) -> Result<()> {
        sniffer.start(self.recvq.sink())?;
        self.sniffer = Some(sniffer);
        Ok(())
    }

    /// Push handle for the receive queue.
    ///
    /// Custom capture sources (and tests) inject replies through this.
    pub fn reply_sink(&self) -> ReplySink {
        self.recvq.sink()
    }

    /// Set the engine-wide probe timeout.
    ///
    /// Affects probes transmitted after the call; already armed
    /// deadlines keep their original value.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The engine-wide probe timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set how many probes a single transmit pass drains.
    pub fn set_batch(&mut self, batch: usize) {
        self.batch = batch.max(1);
    }

    /// Register an algorithm under a name, with defaults merged under
    /// the options every `run_instance` call supplies.
    pub fn register_algorithm(&mut self, name: impl Into<String>, factory: Factory, defaults: Options) {
        self.registry
            .insert(name.into(), Registration { factory, defaults });
    }

    /// Start an instance of a registered algorithm.
    ///
    /// Option validation happens here, synchronously: bad or unknown
    /// options fail with `InvalidArgument` before any probe is queued.
    /// `caller` routes the instance's notices; `None` is the engine
    /// sink.
    pub fn run_instance(
        &mut self,
        name: &str,
        options: Options,
        caller: Option<InstanceId>,
    ) -> Result<InstanceId> {
        let registration = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownAlgorithm(name.to_string()))?;
        let merged = options.with_defaults(&registration.defaults);
        let algorithm = (registration.factory)(&merged)?;

        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        debug!(%id, algorithm = name, "starting instance");
        self.instances.insert(id, InstanceSlot { algorithm, caller });
        self.pending.push_back((id, Event::Init));
        Ok(id)
    }

    /// Enqueue a probe for transmission.
    pub fn send(&mut self, probe: Probe) -> Result<()> {
        self.sendq.push(probe)
    }

    /// Replace the sink and return its receiving side.
    ///
    /// Notices and forwarded events of root instances (those started
    /// with `caller = None`) arrive here.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sink = tx;
        rx
    }

    /// Like [`subscribe`](Self::subscribe), wrapped as a `Stream`.
    pub fn events(&mut self) -> UnboundedReceiverStream<Event> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    /// Handle for stopping the loop from another task.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Drive the engine until it is stopped or finished.
    ///
    /// Returns when [`EngineHandle::stop`] is called, or when every
    /// instance has terminated and nothing remains queued or in flight.
    /// Resource-level failures (permissions, tag exhaustion) abort the
    /// loop and surface here; per-probe failures do not.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_loop().await;
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.stop();
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            self.service()?;
            if self.shutdown.is_stopped() || self.is_idle() {
                return Ok(());
            }

            let deadline = self.timer.next_deadline();
            let wake = deadline.unwrap_or_else(far_future);
            tokio::select! {
                biased;
                _ = self.recvq.readable() => {}
                _ = sleep_until(wake), if deadline.is_some() => {}
                _ = self.sendq.readable() => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }

    /// Service every ready source in priority order until quiescent.
    fn service(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;

            while let Some(reply) = self.recvq.pop() {
                self.handle_reply(reply);
                progressed = true;
            }

            let now = Instant::now();
            for tag in self.timer.pop_expired(now) {
                self.handle_expiry(tag);
                progressed = true;
            }

            let mut drained = 0;
            while drained < self.batch {
                let Some(probe) = self.sendq.pop() else { break };
                self.transmit(probe)?;
                drained += 1;
                progressed = true;
            }

            while let Some((id, event)) = self.pending.pop_front() {
                self.dispatch(id, event)?;
                progressed = true;
            }

            if !progressed || self.shutdown.is_stopped() {
                return Ok(());
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.instances.is_empty()
            && self.pending.is_empty()
            && self.in_flight.is_empty()
            && self.sendq.is_empty()
    }

    /// Transmit one probe: fresh tag, timestamps, wire write, in-flight
    /// bookkeeping, deadline arming.
    fn transmit(&mut self, mut probe: Probe) -> Result<()> {
        let tag = self.alloc_tag()?;
        let now = Instant::now();

        let mut outcome = self.transport.transmit(probe.packet(), probe.dst());
        if outcome.as_ref().is_err_and(|e| e.is_transient()) {
            outcome = self.transport.transmit(probe.packet(), probe.dst());
        }

        match outcome {
            Ok(()) => {
                let deadline = now + self.timeout;
                probe.mark_sent(tag, now, deadline);
                debug!(%tag, dst = %probe.dst(), ttl = probe.fields().ttl, "probe transmitted");
                self.in_flight.push_back(probe);
                self.timer.arm(tag, deadline);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(%tag, dst = %probe.dst(), "transmit failed: {e}");
                let origin = probe.origin();
                self.pending.push_back((
                    origin,
                    Event::SendFailed {
                        probe: Arc::new(probe),
                        cause: Arc::new(e),
                    },
                ));
                Ok(())
            }
        }
    }

    fn alloc_tag(&mut self) -> Result<ProbeTag> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.checked_add(1).ok_or(Error::TagExhausted)?;
        Ok(ProbeTag(tag))
    }

    /// Match a captured reply against the in-flight list, oldest first.
    ///
    /// The first (oldest) compatible probe wins; no match means the
    /// reply is dropped silently, since stray traffic is normal under
    /// a coarse capture filter.
    fn handle_reply(&mut self, reply: Reply) {
        let codec = &self.codec;
        let Some(pos) = self
            .in_flight
            .iter()
            .position(|probe| codec.matches(probe, &reply))
        else {
            trace!(from = %reply.from(), "unmatched reply dropped");
            return;
        };

        let probe = self.in_flight.remove(pos).expect("position just found");
        let tag = probe.tag().expect("in-flight probes are tagged");
        self.timer.disarm(tag);
        debug!(%tag, from = %reply.from(), "reply matched");
        self.pending.push_back((
            probe.origin(),
            Event::ProbeReply {
                probe: Arc::new(probe),
                reply: Arc::new(reply),
            },
        ));
    }

    /// Complete one expired probe with a timeout event.
    fn handle_expiry(&mut self, tag: ProbeTag) {
        let Some(pos) = self
            .in_flight
            .iter()
            .position(|probe| probe.tag() == Some(tag))
        else {
            return;
        };
        let probe = self.in_flight.remove(pos).expect("position just found");
        debug!(%tag, dst = %probe.dst(), "probe timed out");
        self.pending.push_back((
            probe.origin(),
            Event::ProbeTimeout {
                probe: Arc::new(probe),
            },
        ));
    }

    /// Deliver one event to one instance and apply its actions.
    ///
    /// Events for instances that no longer exist are dropped: that is
    /// how late replies for a terminated instance disappear.
    fn dispatch(&mut self, id: InstanceId, event: Event) -> Result<()> {
        let Some(mut slot) = self.instances.remove(&id) else {
            trace!(%id, "event for terminated instance dropped");
            return Ok(());
        };

        let terminal = matches!(event, Event::Terminated);
        let mut actions = Vec::new();
        let codec = Arc::clone(&self.codec);
        let outcome = {
            let mut ctx = Ctx::new(id, &*codec, &mut actions);
            slot.algorithm.on_event(&mut ctx, event)
        };
        let caller = slot.caller;

        match outcome {
            Ok(()) => {
                if terminal {
                    debug!(%id, "instance terminated");
                    self.cancel_instance_probes(id);
                } else {
                    self.instances.insert(id, slot);
                }
                self.apply_actions(id, caller, actions)
            }
            Err(cause) => {
                warn!(%id, "handler failed: {cause}");
                if terminal {
                    self.cancel_instance_probes(id);
                    return Ok(());
                }
                // Deliver the failure to the instance, then destroy it.
                // Siblings keep running.
                self.instances.insert(id, slot);
                self.pending.push_back((
                    id,
                    Event::Error {
                        cause: Arc::new(cause),
                    },
                ));
                self.pending.push_back((id, Event::Terminated));
                Ok(())
            }
        }
    }

    fn apply_actions(
        &mut self,
        id: InstanceId,
        caller: Option<InstanceId>,
        actions: Vec<Action>,
    ) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(probe) => {
                    if let Err(e) = self.sendq.push(probe) {
                        // The queue bound doubles as the only back
                        // pressure; surface it like any other engine
                        // failure local to this instance.
                        self.pending.push_back((
                            id,
                            Event::Error {
                                cause: Arc::new(e),
                            },
                        ));
                        self.pending.push_back((id, Event::Terminated));
                        return Ok(());
                    }
                }
                Action::Emit(notice) => self.route_to_caller(caller, Event::Notice(notice)),
                Action::Forward(event) => self.route_to_caller(caller, event),
                Action::Spawn { name, options } => {
                    if let Err(e) = self.run_instance(&name, options, Some(id)) {
                        warn!(%id, "spawn of '{name}' failed: {e}");
                        self.pending.push_back((
                            id,
                            Event::Error {
                                cause: Arc::new(e),
                            },
                        ));
                        self.pending.push_back((id, Event::Terminated));
                    }
                }
                Action::Finish => self.pending.push_back((id, Event::Terminated)),
            }
        }
        Ok(())
    }

    fn route_to_caller(&mut self, caller: Option<InstanceId>, event: Event) {
        match caller {
            Some(parent) => self.pending.push_back((parent, event)),
            // Sink may be unsubscribed; events are then discarded.
            None => {
                let _ = self.sink.send(event);
            }
        }
    }

    /// Remove every trace of a terminated instance's probes: queued
    /// probes never reach the wire, in-flight deadlines are disarmed,
    /// and their late replies will no longer match anything.
    fn cancel_instance_probes(&mut self, id: InstanceId) {
        self.sendq.retain(|probe| probe.origin() != id);
        let timer = &mut self.timer;
        self.in_flight.retain(|probe| {
            if probe.origin() == id {
                if let Some(tag) = probe.tag() {
                    timer.disarm(tag);
                }
                false
            } else {
                true
            }
        });
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.stop();
        }
    }
}

/// Cloneable control handle for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown: Arc<Shutdown>,
}

impl EngineHandle {
    /// Ask the loop to stop. The engine finishes the current tick and
    /// returns from `run()`.
    pub fn stop(&self) {
        self.shutdown.stop();
    }
}

#[derive(Default)]
struct Shutdown {
    stopped: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        while !self.is_stopped() {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
