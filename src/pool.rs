//! Proxy pool: descriptors + health table, weighted selection, failover
//! (spec §4.3, component C). `descriptors` is a plain read-only `Vec`;
//! everything mutable lives in `PoolHealthTable` behind one
//! `parking_lot::Mutex`, the crate's single serialization point — held only
//! for O(n) bookkeeping, never across I/O, the way this codebase's
//! `AtomicProtocolReporter` keeps counters behind atomics rather than across
//! a held lock during transfer.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Outcome, ProxyError};
use crate::proxy::{ProxyDescriptor, ProxyId};

pub const F_MAX: u32 = 3;

#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub alive: bool,
    pub consecutive_failures: u32,
    pub last_check: Instant,
    pub next_probe_at: Option<Instant>,
    pub avg_latency_ms: Option<f64>,
    pub measured_bw_bps: Option<f64>,
    pub in_flight: u32,
}

impl ProxyHealth {
    fn new() -> Self {
        Self {
            alive: true,
            consecutive_failures: 0,
            last_check: Instant::now(),
            next_probe_at: None,
            avg_latency_ms: None,
            measured_bw_bps: None,
            in_flight: 0,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.alive && self.consecutive_failures < F_MAX
    }
}

/// EMA smoothing factor for `avg_latency_ms`. Not specified numerically by
/// spec.md; see DESIGN.md for this Open Question resolution.
const LATENCY_EMA_ALPHA: f64 = 0.25;

fn backoff_for(consecutive_failures: u32) -> Duration {
    let k = consecutive_failures.saturating_sub(F_MAX);
    let secs = 30f64 * 2f64.powi(k as i32);
    Duration::from_secs_f64(secs.min(600.0))
}

struct PoolHealthTable {
    health: Vec<ProxyHealth>,
    rr_cursor: u64,
    active_count: u32,
}

pub struct ProxyPool {
    descriptors: Vec<ProxyDescriptor>,
    table: Mutex<PoolHealthTable>,
    max_consecutive_failures: u32,
}

impl ProxyPool {
    pub fn new(descriptors: Vec<ProxyDescriptor>) -> Self {
        Self::with_max_failures(descriptors, F_MAX)
    }

    pub fn with_max_failures(descriptors: Vec<ProxyDescriptor>, max_consecutive_failures: u32) -> Self {
        let health = descriptors.iter().map(|_| ProxyHealth::new()).collect();
        let active_count = descriptors.len().max(1) as u32;
        Self {
            descriptors,
            table: Mutex::new(PoolHealthTable {
                health,
                rr_cursor: 0,
                active_count,
            }),
            max_consecutive_failures,
        }
    }

    pub fn descriptors(&self) -> &[ProxyDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: ProxyId) -> &ProxyDescriptor {
        &self.descriptors[id]
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn active_count(&self) -> u32 {
        self.table.lock().active_count
    }

    /// Spec §4.6 step 4: atomically retune the active window, clamped to
    /// `[1, len(descriptors)]` (spec §9 Open Question (c)).
    pub fn set_active_count(&self, k: u32) {
        let clamped = k.clamp(1, self.descriptors.len().max(1) as u32);
        self.table.lock().active_count = clamped;
    }

    /// Spec §4.3/§4.6 step 4: the active window is the top `active_count`
    /// health-eligible proxies ranked by measured throughput, not by id.
    /// Proxies with no measurement yet (nothing reported by the optimizer
    /// since this crate started) sort after every measured one but keep
    /// their relative id order among themselves, so a freshly started pool
    /// with `active_count == len` still admits everyone before the first
    /// optimizer tick ever runs.
    fn ranked_eligible(&self, table: &PoolHealthTable) -> Vec<ProxyId> {
        let mut ids: Vec<ProxyId> = (0..self.descriptors.len())
            .filter(|&id| table.health[id].is_eligible())
            .collect();
        ids.sort_by(|&a, &b| {
            match (table.health[a].measured_bw_bps, table.health[b].measured_bw_bps) {
                (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
        ids.truncate(table.active_count as usize);
        ids
    }

    /// Weighted interleaved round-robin over the active-ranked set: expands
    /// it into a virtual sequence where proxy `i` appears `weight_i` times,
    /// advances `rr_cursor` modulo the total weight, and returns the
    /// descriptor at that slot. The ranking and the weight sum are read
    /// under the same lock acquisition, so the walk below always lands on a
    /// real slot; an empty eligible set yields `NoHealthyProxy`.
    pub fn pick(&self, excluded: &[ProxyId]) -> Result<ProxyId, ProxyError> {
        if self.descriptors.is_empty() {
            return Err(ProxyError::NoHealthyProxy);
        }

        let mut table = self.table.lock();
        let active_ids = self.ranked_eligible(&table);

        let total_weight: u64 = active_ids
            .iter()
            .filter(|id| !excluded.contains(id))
            .map(|&id| self.descriptors[id].weight as u64)
            .sum();

        if total_weight == 0 {
            return Err(ProxyError::NoHealthyProxy);
        }

        let mut slot = table.rr_cursor % total_weight;
        table.rr_cursor = table.rr_cursor.wrapping_add(1);

        for &id in &active_ids {
            if excluded.contains(&id) {
                continue;
            }
            let w = self.descriptors[id].weight as u64;
            if slot < w {
                return Ok(id);
            }
            slot -= w;
        }

        unreachable!("slot is bounded by total_weight, computed from the same active set");
    }

    pub fn incr_in_flight(&self, id: ProxyId) {
        self.table.lock().health[id].in_flight += 1;
    }

    pub fn decr_in_flight(&self, id: ProxyId) {
        let mut table = self.table.lock();
        let h = &mut table.health[id];
        h.in_flight = h.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self, id: ProxyId) -> u32 {
        self.table.lock().health[id].in_flight
    }

    /// Spec §4.3 "Outcome reporting". `latency` is only meaningful on
    /// success.
    pub fn report_outcome(&self, id: ProxyId, outcome: Outcome, latency: Option<Duration>) {
        let mut table = self.table.lock();
        let h = &mut table.health[id];
        h.last_check = Instant::now();
        match outcome {
            Outcome::Success => {
                h.consecutive_failures = 0;
                h.alive = true;
                h.next_probe_at = None;
                if let Some(latency) = latency {
                    let ms = latency.as_secs_f64() * 1000.0;
                    h.avg_latency_ms = Some(match h.avg_latency_ms {
                        Some(prev) => prev + LATENCY_EMA_ALPHA * (ms - prev),
                        None => ms,
                    });
                }
            }
            Outcome::HandshakeFailure | Outcome::TransportFailure => {
                h.consecutive_failures += 1;
                if h.consecutive_failures >= self.max_consecutive_failures {
                    h.alive = false;
                    h.next_probe_at = Some(Instant::now() + backoff_for(h.consecutive_failures));
                }
            }
        }
    }

    /// Marks `id` alive with a clean failure counter, used by a successful
    /// health probe (spec §4.3 "Health probe task").
    pub fn mark_probe_success(&self, id: ProxyId) {
        let mut table = self.table.lock();
        let h = &mut table.health[id];
        h.alive = true;
        h.consecutive_failures = 0;
        h.next_probe_at = None;
        h.last_check = Instant::now();
    }

    pub fn mark_probe_failure(&self, id: ProxyId) {
        let mut table = self.table.lock();
        let h = &mut table.health[id];
        h.last_check = Instant::now();
        h.next_probe_at = Some(Instant::now() + backoff_for(h.consecutive_failures.max(F_MAX)));
    }

    /// Proxies whose scheduled re-probe deadline has passed, for the
    /// ad-hoc half of the health-probe task's duty.
    pub fn due_for_reprobe(&self) -> Vec<ProxyId> {
        let table = self.table.lock();
        let now = Instant::now();
        table
            .health
            .iter()
            .enumerate()
            .filter(|(_, h)| matches!(h.next_probe_at, Some(at) if at <= now))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn set_measured_bandwidth(&self, id: ProxyId, bps: Option<f64>) {
        self.table.lock().health[id].measured_bw_bps = bps;
    }

    pub fn measured_bandwidth(&self, id: ProxyId) -> Option<f64> {
        self.table.lock().health[id].measured_bw_bps
    }

    pub fn is_alive(&self, id: ProxyId) -> bool {
        self.table.lock().health[id].alive
    }

    pub fn snapshot_health(&self, id: ProxyId) -> ProxyHealth {
        self.table.lock().health[id].clone()
    }
}
