//! Active network measurement engine.
//!
//! This crate issues crafted probes, captures and correlates replies,
//! and drives path-discovery algorithms such as traceroute. The core is
//! a single cooperative event loop that multiplexes a send queue, a
//! sniffer-fed receive queue, per-probe deadlines, and the events of
//! pluggable algorithm instances.
//!
//! # Features
//!
//! - `output` - Serializable hop/trace records (JSON output)
//! - `full` - All features enabled
//!
//! # Example
//!
//! ```ignore
//! use pathprobe::engine::{Engine, Event, Options};
//! use pathprobe::sniffer::IcmpSniffer;
//! use pathprobe::trace::{self, TraceNotice};
//!
//! #[tokio::main]
//! async fn main() -> pathprobe::Result<()> {
//!     let mut engine = Engine::new();
//!     engine.attach_sniffer(Box::new(IcmpSniffer::new()))?;
//!     trace::register(&mut engine);
//!
//!     let opts = Options::new().set_str("dst-ip", "192.0.2.7");
//!     engine.run_instance("traceroute", opts, None)?;
//!
//!     let mut events = engine.subscribe();
//!     let runner = tokio::spawn(async move { engine.run().await });
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::ProbeReply { probe, reply } => {
//!                 println!(
//!                     "ttl {:2}  {}",
//!                     probe.fields().ttl,
//!                     reply.from(),
//!                 );
//!             }
//!             Event::Notice(notice) => {
//!                 if notice.downcast_ref::<TraceNotice>().is_some() {
//!                     break;
//!                 }
//!             }
//!             _ => {}
//!         }
//!     }
//!     runner.await.expect("engine task")?;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod packet;
pub mod sniffer;
pub mod trace;

#[cfg(feature = "output")]
pub mod output;

// Re-export common types at crate root for convenience
pub use engine::{Engine, EngineHandle, Error, Result};

// Event types
pub use engine::{Event, Notice};

// Instance types
pub use engine::{Algorithm, Ctx, InstanceId, Options};

// Probe types
pub use engine::{Probe, ProbeTag, Reply};
