//! Reference traceroute algorithm.
//!
//! Walks the TTL space toward a target, one probe in flight at a time,
//! and reports each hop to its caller by forwarding the engine's reply
//! and timeout events. Terminal outcomes are emitted as [`TraceNotice`]s.
//!
//! # Options
//!
//! | key          | type   | default | meaning                        |
//! |--------------|--------|---------|--------------------------------|
//! | `dst-ip`     | string | none    | target address (required)      |
//! | `min-ttl`    | int    | 1       | first TTL probed               |
//! | `max-ttl`    | int    | 30      | last TTL probed                |
//! | `num-probes` | int    | 3       | probes per hop                 |
//!
//! Unknown keys and `min-ttl >= max-ttl` are rejected when the instance
//! is started.

use std::net::{IpAddr, Ipv4Addr};

use crate::engine::{Algorithm, Ctx, Engine, Error, Event, Options, Result};
use crate::packet::ProbeFields;

/// Consecutive fully-starred hops after which the walk gives up.
///
/// A fixed threshold, not scaled by `num-probes`.
const GAP_STOP_HOPS: u8 = 3;

/// Terminal outcomes of a traceroute instance.
///
/// Delivered to the caller as [`Event::Notice`] payloads; downcast with
/// [`Notice::downcast_ref`](crate::engine::Notice::downcast_ref).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceNotice {
    /// A reply from the target itself arrived; the path is complete.
    DestinationReached { target: Ipv4Addr, ttl: u8 },
    /// The largest allowed TTL was probed without the target answering.
    MaxTtlReached { max_ttl: u8 },
    /// Three hops in a row went completely unanswered.
    GapStop { last_ttl: u8 },
}

/// Validated traceroute options.
#[derive(Debug, Clone, Copy)]
struct TraceOptions {
    dst: Ipv4Addr,
    min_ttl: u8,
    max_ttl: u8,
    num_probes: u8,
}

const KNOWN_OPTIONS: &[&str] = &["dst-ip", "min-ttl", "max-ttl", "num-probes"];

impl TraceOptions {
    fn from_options(options: &Options) -> Result<Self> {
        options.ensure_known(KNOWN_OPTIONS)?;

        let dst: Ipv4Addr = options
            .get_str("dst-ip")?
            .ok_or_else(|| Error::InvalidArgument("dst-ip is required".into()))?
            .parse()
            .map_err(|_| Error::InvalidArgument("dst-ip is not an IPv4 address".into()))?;

        let min_ttl = ttl_option(options, "min-ttl", 1)?;
        let max_ttl = ttl_option(options, "max-ttl", 30)?;
        if min_ttl >= max_ttl {
            return Err(Error::InvalidArgument(format!(
                "min-ttl ({min_ttl}) must be below max-ttl ({max_ttl})"
            )));
        }

        let num_probes = options.get_int("num-probes")?.unwrap_or(3);
        if !(1..=16).contains(&num_probes) {
            return Err(Error::InvalidArgument(format!(
                "num-probes ({num_probes}) must be between 1 and 16"
            )));
        }

        Ok(Self {
            dst,
            min_ttl,
            max_ttl,
            num_probes: num_probes as u8,
        })
    }
}

fn ttl_option(options: &Options, key: &str, default: i64) -> Result<u8> {
    let value = options.get_int(key)?.unwrap_or(default);
    u8::try_from(value)
        .ok()
        .filter(|v| *v >= 1)
        .ok_or_else(|| Error::InvalidArgument(format!("{key} ({value}) must be between 1 and 255")))
}

/// The traceroute state machine.
#[derive(Debug)]
pub struct Traceroute {
    opts: TraceOptions,
    /// TTL of the hop currently being probed.
    ttl: u8,
    /// Echo identifier shared by all probes of this instance.
    identifier: u16,
    /// Next echo sequence number.
    next_seq: u16,
    /// Probes completed (reply or timeout) at the current hop.
    completed_at_hop: u8,
    /// Consecutive timeouts at the current hop.
    num_stars: u8,
    /// Consecutive fully-starred hops.
    num_undiscovered: u8,
    destination_reached: bool,
}

impl Traceroute {
    /// Constructor registered with the engine.
    pub fn factory(options: &Options) -> Result<Box<dyn Algorithm>> {
        let opts = TraceOptions::from_options(options)?;
        Ok(Box::new(Self {
            opts,
            ttl: opts.min_ttl,
            identifier: 0,
            next_seq: 1,
            completed_at_hop: 0,
            num_stars: 0,
            num_undiscovered: 0,
            destination_reached: false,
        }))
    }

    fn send_probe(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        let fields = ProbeFields {
            dst: self.opts.dst,
            ttl: self.ttl,
            identifier: self.identifier,
            sequence: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        ctx.send_probe(fields)
    }

    /// One probe completed: close out the hop if due, then either send
    /// the next probe or conclude the walk.
    fn advance(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        if self.completed_at_hop == self.opts.num_probes {
            self.completed_at_hop = 0;

            if self.destination_reached {
                ctx.emit(TraceNotice::DestinationReached {
                    target: self.opts.dst,
                    ttl: self.ttl,
                });
                ctx.finish();
                return Ok(());
            }

            if self.num_stars == self.opts.num_probes {
                self.num_undiscovered += 1;
                if self.num_undiscovered == GAP_STOP_HOPS {
                    ctx.emit(TraceNotice::GapStop { last_ttl: self.ttl });
                    ctx.finish();
                    return Ok(());
                }
            }
            self.num_stars = 0;

            match self.ttl.checked_add(1) {
                Some(next) if next <= self.opts.max_ttl => self.ttl = next,
                _ => {
                    ctx.emit(TraceNotice::MaxTtlReached {
                        max_ttl: self.opts.max_ttl,
                    });
                    ctx.finish();
                    return Ok(());
                }
            }
        }
        self.send_probe(ctx)
    }
}

impl Algorithm for Traceroute {
    fn on_event(&mut self, ctx: &mut Ctx<'_>, event: Event) -> Result<()> {
        match event {
            Event::Init => {
                // One identifier per instance keeps fingerprints of
                // concurrent walks disjoint.
                self.identifier = ctx.id().0 as u16;
                self.ttl = self.opts.min_ttl;
                self.send_probe(ctx)
            }
            Event::ProbeReply { probe, reply } => {
                self.num_stars = 0;
                self.num_undiscovered = 0;
                if reply.from() == IpAddr::V4(self.opts.dst) {
                    self.destination_reached = true;
                }
                ctx.forward(Event::ProbeReply { probe, reply });
                self.completed_at_hop += 1;
                self.advance(ctx)
            }
            Event::ProbeTimeout { probe } => {
                self.num_stars += 1;
                ctx.forward(Event::ProbeTimeout { probe });
                self.completed_at_hop += 1;
                self.advance(ctx)
            }
            Event::SendFailed { cause, .. } => {
                // A probe that never left leaves the hop accounting
                // unfixable; give up on this walk.
                Err(Error::Handler(format!("probe transmission failed: {cause}")))
            }
            Event::Error { .. } | Event::Terminated => Ok(()),
            Event::Notice(_) => Ok(()),
        }
    }
}

/// Register the traceroute algorithm under its canonical name.
pub fn register(engine: &mut Engine) {
    let defaults = Options::new()
        .set_int("min-ttl", 1)
        .set_int("max-ttl", 30)
        .set_int("num-probes", 3);
    engine.register_algorithm("traceroute", Traceroute::factory, defaults);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> Options {
        Options::new()
            .set_str("dst-ip", "10.0.0.5")
            .set_int("min-ttl", 1)
            .set_int("max-ttl", 30)
            .set_int("num-probes", 3)
    }

    #[test]
    fn test_options_accepted() {
        assert!(Traceroute::factory(&base_options()).is_ok());
    }

    #[test]
    fn test_min_ttl_must_be_below_max() {
        let opts = base_options().set_int("min-ttl", 10).set_int("max-ttl", 5);
        let err = Traceroute::factory(&opts).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let opts = base_options().set_int("ttl", 4);
        let err = Traceroute::factory(&opts).unwrap_err();
        assert!(err.to_string().contains("unknown option"));
    }

    #[test]
    fn test_dst_ip_required_and_parsed() {
        let missing = Options::new().set_int("max-ttl", 5);
        assert!(Traceroute::factory(&missing).is_err());

        let bad = Options::new().set_str("dst-ip", "not-an-ip");
        let err = Traceroute::factory(&bad).unwrap_err();
        assert!(err.to_string().contains("IPv4"));
    }

    #[test]
    fn test_num_probes_bounds() {
        let zero = base_options().set_int("num-probes", 0);
        assert!(Traceroute::factory(&zero).is_err());
        let huge = base_options().set_int("num-probes", 64);
        assert!(Traceroute::factory(&huge).is_err());
    }
}
