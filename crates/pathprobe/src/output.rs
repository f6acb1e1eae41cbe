//! Serializable trace records.
//!
//! The engine reports hops as a stream of events; these records are the
//! flat, serializable aggregation a consumer builds from that stream
//! (the CLI's `--json` output).

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

/// Outcome of a completed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceOutcome {
    DestinationReached,
    MaxTtlReached,
    GapStop,
    Stopped,
}

/// One probe's result at a hop. `responder` is `None` for a timeout.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub responder: Option<IpAddr>,
    pub rtt_ms: Option<f64>,
}

/// All probe results sharing a TTL.
#[derive(Debug, Clone, Serialize)]
pub struct HopReport {
    pub ttl: u8,
    pub probes: Vec<ProbeReport>,
}

/// A full trace toward one target.
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub target: IpAddr,
    pub hops: Vec<HopReport>,
    pub outcome: Option<TraceOutcome>,
}

impl TraceReport {
    pub fn new(target: IpAddr) -> Self {
        Self {
            target,
            hops: Vec::new(),
            outcome: None,
        }
    }

    /// Record one probe result under its TTL.
    pub fn record(&mut self, ttl: u8, responder: Option<IpAddr>, rtt: Option<Duration>) {
        let probe = ProbeReport {
            responder,
            rtt_ms: rtt.map(|d| d.as_secs_f64() * 1000.0),
        };
        match self.hops.last_mut() {
            Some(hop) if hop.ttl == ttl => hop.probes.push(probe),
            _ => self.hops.push(HopReport {
                ttl,
                probes: vec![probe],
            }),
        }
    }

    pub fn conclude(&mut self, outcome: TraceOutcome) {
        self.outcome = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_report_groups_by_ttl() {
        let mut report = TraceReport::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        let hop1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        report.record(1, Some(hop1), Some(Duration::from_millis(2)));
        report.record(1, None, None);
        report.record(2, Some(hop1), Some(Duration::from_millis(4)));
        report.conclude(TraceOutcome::MaxTtlReached);

        assert_eq!(report.hops.len(), 2);
        assert_eq!(report.hops[0].probes.len(), 2);
        assert!(report.hops[0].probes[1].responder.is_none());

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"max-ttl-reached\""));
        assert!(json.contains("\"ttl\":1"));
    }
}
