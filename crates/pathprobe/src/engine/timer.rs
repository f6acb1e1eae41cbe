//! Probe deadline tracking.
//!
//! Because the timeout is a single engine-wide value, deadlines arrive in
//! non-decreasing order and an ordered list is enough: `arm` appends,
//! expiry pops from the front. If per-probe timeouts are ever introduced
//! this becomes a binary heap keyed on the deadline.

use std::collections::VecDeque;

use tokio::time::Instant;

use super::probe::ProbeTag;

/// Ordered set of probe deadlines.
#[derive(Debug, Default)]
pub struct TimerWheel {
    deadlines: VecDeque<(ProbeTag, Instant)>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            deadlines: VecDeque::new(),
        }
    }

    /// Insert a deadline for a probe.
    pub fn arm(&mut self, tag: ProbeTag, deadline: Instant) {
        debug_assert!(
            self.deadlines
                .back()
                .is_none_or(|(_, last)| *last <= deadline),
            "deadlines must be armed in order"
        );
        self.deadlines.push_back((tag, deadline));
    }

    /// Remove the deadline for a probe, if still armed.
    ///
    /// Returns whether a deadline was found. Matching a reply disarms
    /// before the deadline can fire, which is what keeps reply and
    /// timeout events mutually exclusive for a probe.
    pub fn disarm(&mut self, tag: ProbeTag) -> bool {
        if let Some(pos) = self.deadlines.iter().position(|(t, _)| *t == tag) {
            self.deadlines.remove(pos);
            true
        } else {
            false
        }
    }

    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.front().map(|(_, at)| *at)
    }

    /// Pop every deadline at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<ProbeTag> {
        let mut expired = Vec::new();
        while let Some((_, at)) = self.deadlines.front() {
            if *at > now {
                break;
            }
            let (tag, _) = self.deadlines.pop_front().expect("front checked");
            expired.push(tag);
        }
        expired
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether no deadlines are armed.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_expire_in_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.arm(ProbeTag(1), now + Duration::from_secs(1));
        wheel.arm(ProbeTag(2), now + Duration::from_secs(2));
        wheel.arm(ProbeTag(3), now + Duration::from_secs(3));

        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(wheel.pop_expired(now).is_empty());

        let expired = wheel.pop_expired(now + Duration::from_secs(2));
        assert_eq!(expired, vec![ProbeTag(1), ProbeTag(2)]);
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_removes_midlist() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.arm(ProbeTag(1), now + Duration::from_secs(1));
        wheel.arm(ProbeTag(2), now + Duration::from_secs(2));
        wheel.arm(ProbeTag(3), now + Duration::from_secs(3));

        assert!(wheel.disarm(ProbeTag(2)));
        assert!(!wheel.disarm(ProbeTag(2)));

        let expired = wheel.pop_expired(now + Duration::from_secs(10));
        assert_eq!(expired, vec![ProbeTag(1), ProbeTag(3)]);
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_probe_never_expires() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.arm(ProbeTag(9), now + Duration::from_secs(1));
        assert!(wheel.disarm(ProbeTag(9)));
        assert!(wheel.pop_expired(now + Duration::from_secs(5)).is_empty());
        assert_eq!(wheel.next_deadline(), None);
    }
}
