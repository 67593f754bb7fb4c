//! Per-server health statistics.
//!
//! Each server accumulates a bounded ring of recent query outcomes. The
//! dispatcher orders candidates by these statistics: usable servers with
//! the lowest smoothed RTT first, servers without a success after them,
//! un-usable servers last but still probed once every
//! [`PROBE_PERIOD`] selections so they can recover.

use crate::{ResolverParams, ServerIdentity};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use umbra_proto::Rcode;

/// One query in N is routed to an un-usable server as a recovery probe.
pub const PROBE_PERIOD: u64 = 16;

/// EWMA weight for new RTT samples (1/8, matching the usual srtt rule).
const RTT_EWMA_SHIFT: u32 = 3;

/// Outcome of a single query against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success { rtt: Duration },
    Error { rcode: Rcode },
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    outcome: QueryOutcome,
    at: Instant,
}

/// Aggregated view over a server's sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSummary {
    pub successes: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub internal_errors: usize,
    /// Smoothed RTT in milliseconds; negative when no success exists in
    /// the window.
    pub rtt_ewma_ms: i64,
}

impl StatsSummary {
    pub fn filled(&self) -> usize {
        self.successes + self.errors + self.timeouts + self.internal_errors
    }
}

/// Ring of recent outcomes for one server.
#[derive(Debug)]
struct SampleRing {
    samples: VecDeque<Sample>,
    rtt_ewma_us: i64,
}

impl SampleRing {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            rtt_ewma_us: -1,
        }
    }

    fn record(&mut self, outcome: QueryOutcome, params: &ResolverParams) {
        let now = Instant::now();
        self.expire(now, params.sample_validity);
        while self.samples.len() >= params.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { outcome, at: now });

        if let QueryOutcome::Success { rtt } = outcome {
            let rtt_us = rtt.as_micros().min(i64::MAX as u128) as i64;
            self.rtt_ewma_us = if self.rtt_ewma_us < 0 {
                rtt_us
            } else {
                self.rtt_ewma_us + ((rtt_us - self.rtt_ewma_us) >> RTT_EWMA_SHIFT)
            };
        }
    }

    fn expire(&mut self, now: Instant, validity: Duration) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > validity {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.samples.is_empty() {
            self.rtt_ewma_us = -1;
        }
    }

    fn aggregate(&mut self, now: Instant, validity: Duration) -> StatsSummary {
        self.expire(now, validity);
        let mut summary = StatsSummary {
            successes: 0,
            errors: 0,
            timeouts: 0,
            internal_errors: 0,
            rtt_ewma_ms: -1,
        };
        for sample in &self.samples {
            match sample.outcome {
                QueryOutcome::Success { .. } => summary.successes += 1,
                QueryOutcome::Error { .. } => summary.errors += 1,
                QueryOutcome::Timeout => summary.timeouts += 1,
                QueryOutcome::Internal => summary.internal_errors += 1,
            }
        }
        if summary.successes > 0 && self.rtt_ewma_us >= 0 {
            summary.rtt_ewma_ms = self.rtt_ewma_us / 1000;
        }
        summary
    }

    fn usable(&mut self, now: Instant, params: &ResolverParams) -> bool {
        let summary = self.aggregate(now, params.sample_validity);
        let filled = summary.filled();
        // Too few samples: default to usable so warm-up probes happen.
        if filled < params.min_samples {
            return true;
        }
        summary.successes * 100 >= usize::from(params.success_threshold_pct) * filled
    }
}

/// Health statistics for every server a network talks to.
///
/// Keyed by [`ServerIdentity`]; Do53 servers use anonymous identities.
pub struct NetworkStats {
    rings: Mutex<HashMap<ServerIdentity, SampleRing>>,
    selections: AtomicU64,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStats {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            selections: AtomicU64::new(0),
        }
    }

    pub fn record(&self, server: &ServerIdentity, outcome: QueryOutcome, params: &ResolverParams) {
        let mut rings = self.rings.lock();
        rings
            .entry(server.clone())
            .or_insert_with(SampleRing::new)
            .record(outcome, params);
    }

    pub fn aggregate(&self, server: &ServerIdentity, params: &ResolverParams) -> StatsSummary {
        let mut rings = self.rings.lock();
        let now = Instant::now();
        rings
            .entry(server.clone())
            .or_insert_with(SampleRing::new)
            .aggregate(now, params.sample_validity)
    }

    pub fn usable(&self, server: &ServerIdentity, params: &ResolverParams) -> bool {
        let mut rings = self.rings.lock();
        let now = Instant::now();
        rings
            .entry(server.clone())
            .or_insert_with(SampleRing::new)
            .usable(now, params)
    }

    /// Drops statistics for servers no longer configured.
    pub fn retain(&self, keep: impl Fn(&ServerIdentity) -> bool) {
        self.rings.lock().retain(|id, _| keep(id));
    }

    /// Orders `candidates` by the selection policy:
    ///
    /// 1. usable servers with a success, lowest smoothed RTT first;
    /// 2. usable servers without a success yet, round-robin rotated;
    /// 3. un-usable servers last — except one selection in
    ///    [`PROBE_PERIOD`], when the rotation-chosen un-usable server is
    ///    promoted to the front as a recovery probe.
    pub fn order_candidates(
        &self,
        candidates: &[ServerIdentity],
        params: &ResolverParams,
    ) -> Vec<ServerIdentity> {
        let selection = self.selections.fetch_add(1, Ordering::Relaxed);
        let mut rings = self.rings.lock();
        let now = Instant::now();

        let mut ranked: Vec<(ServerIdentity, StatsSummary, bool)> = candidates
            .iter()
            .map(|id| {
                let ring = rings.entry(id.clone()).or_insert_with(SampleRing::new);
                let summary = ring.aggregate(now, params.sample_validity);
                let usable = ring.usable(now, params);
                (id.clone(), summary, usable)
            })
            .collect();
        drop(rings);

        // Server lists are small constants; avoid heap traffic on the
        // query path.
        let mut proven: SmallVec<[(ServerIdentity, i64); 4]> = SmallVec::new();
        let mut unproven: SmallVec<[ServerIdentity; 4]> = SmallVec::new();
        let mut unusable: SmallVec<[ServerIdentity; 4]> = SmallVec::new();
        for (id, summary, usable) in ranked.drain(..) {
            if !usable {
                unusable.push(id);
            } else if summary.rtt_ewma_ms >= 0 {
                proven.push((id, summary.rtt_ewma_ms));
            } else {
                unproven.push(id);
            }
        }
        proven.sort_by_key(|(_, rtt)| *rtt);

        // Deterministic rotation breaks ties among servers with no RTT.
        if !unproven.is_empty() {
            let shift = (selection as usize) % unproven.len();
            unproven.rotate_left(shift);
        }

        let mut ordered: Vec<ServerIdentity> =
            proven.into_iter().map(|(id, _)| id).collect();
        ordered.extend(unproven);

        if !unusable.is_empty() {
            let shift = (selection as usize) % unusable.len();
            unusable.rotate_left(shift);
            if selection % PROBE_PERIOD == 0 {
                let probe = unusable.remove(0);
                ordered.insert(0, probe);
            }
            ordered.extend(unusable);
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn id(s: &str) -> ServerIdentity {
        ServerIdentity::anonymous(SocketAddr::from_str(s).unwrap())
    }

    fn params() -> ResolverParams {
        ResolverParams::default()
    }

    #[test]
    fn test_ring_eviction() {
        let stats = NetworkStats::new();
        let server = id("1.1.1.1:53");
        let p = params();
        for _ in 0..20 {
            stats.record(&server, QueryOutcome::Timeout, &p);
        }
        let summary = stats.aggregate(&server, &p);
        assert_eq!(summary.filled(), p.max_samples);
        assert_eq!(summary.timeouts, p.max_samples);
    }

    #[test]
    fn test_rtt_sentinel_without_success() {
        let stats = NetworkStats::new();
        let server = id("1.1.1.1:53");
        let p = params();
        stats.record(&server, QueryOutcome::Timeout, &p);
        assert_eq!(stats.aggregate(&server, &p).rtt_ewma_ms, -1);

        stats.record(
            &server,
            QueryOutcome::Success {
                rtt: Duration::from_millis(12),
            },
            &p,
        );
        assert!(stats.aggregate(&server, &p).rtt_ewma_ms >= 0);
    }

    #[test]
    fn test_warmup_is_usable() {
        let stats = NetworkStats::new();
        let server = id("1.1.1.1:53");
        let p = params();
        // Fewer than min_samples outcomes, even all failures.
        stats.record(&server, QueryOutcome::Timeout, &p);
        assert!(stats.usable(&server, &p));
    }

    #[test]
    fn test_threshold_marks_unusable() {
        let stats = NetworkStats::new();
        let server = id("1.1.1.1:53");
        let p = params();
        for _ in 0..p.max_samples {
            stats.record(&server, QueryOutcome::Timeout, &p);
        }
        assert!(!stats.usable(&server, &p));
    }

    #[test]
    fn test_ordering_prefers_lowest_rtt() {
        let stats = NetworkStats::new();
        let fast = id("1.1.1.1:53");
        let slow = id("8.8.8.8:53");
        let p = params();
        for _ in 0..4 {
            stats.record(
                &fast,
                QueryOutcome::Success {
                    rtt: Duration::from_millis(5),
                },
                &p,
            );
            stats.record(
                &slow,
                QueryOutcome::Success {
                    rtt: Duration::from_millis(80),
                },
                &p,
            );
        }
        let ordered = stats.order_candidates(&[slow.clone(), fast.clone()], &p);
        assert_eq!(ordered[0], fast);
        assert_eq!(ordered[1], slow);
    }

    #[test]
    fn test_unusable_ranked_last_but_probed() {
        let stats = NetworkStats::new();
        let good = id("1.1.1.1:53");
        let bad = id("9.9.9.9:53");
        let p = params();
        for _ in 0..p.max_samples {
            stats.record(
                &good,
                QueryOutcome::Success {
                    rtt: Duration::from_millis(10),
                },
                &p,
            );
            stats.record(&bad, QueryOutcome::Timeout, &p);
        }

        // Selection 0 is the probe slot: bad goes first exactly there.
        let first = stats.order_candidates(&[good.clone(), bad.clone()], &p);
        assert_eq!(first[0], bad);

        let mut probes = 1;
        for _ in 1..PROBE_PERIOD {
            let ordered = stats.order_candidates(&[good.clone(), bad.clone()], &p);
            if ordered[0] == bad {
                probes += 1;
            } else {
                assert_eq!(ordered.last().unwrap(), &bad);
            }
        }
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_round_robin_rotation_on_ties() {
        let stats = NetworkStats::new();
        let a = id("1.1.1.1:53");
        let b = id("2.2.2.2:53");
        let c = id("3.3.3.3:53");
        let p = params();
        let list = [a.clone(), b.clone(), c.clone()];

        let firsts: Vec<ServerIdentity> = (0..3)
            .map(|_| stats.order_candidates(&list, &p)[0].clone())
            .collect();
        assert_eq!(firsts[0], a);
        assert_eq!(firsts[1], b);
        assert_eq!(firsts[2], c);
    }
}
