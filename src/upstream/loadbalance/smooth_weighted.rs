//! Smooth weighted round-robin with peer quarantine (component K).
//!
//! Each peer carries a `current_weight` that accumulates by its
//! `effective_weight` every pick and is debited by the total weight when
//! chosen — the classic Nginx/LVS smoothing algorithm, which spreads picks
//! evenly across a request burst instead of bursting N-in-a-row on the
//! heaviest peer the way a naive prefix-sum counter does.
//!
//! Failures decay `effective_weight` so a flaky peer gradually loses share
//! before being quarantined outright; `max_fails` failures inside
//! `fail_timeout` take it out of rotation until the window elapses. Backup
//! peers are only considered once every primary peer has been tried this
//! selection and found unavailable.

use super::UpstreamInstance;
use crate::config::UpstreamNode;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

struct Peer {
    instance: UpstreamInstance,
    weight: i64,
    backup: bool,
    down: bool,
    max_fails: u32,
    fail_timeout_secs: u64,
    /// Smoothing accumulator (spec's "current weight").
    current_weight: AtomicI64,
    /// Weight after failure decay (spec's "effective weight"); never
    /// exceeds `weight` and never drops below 0.
    effective_weight: AtomicI64,
    fails: AtomicU32,
    /// Unix seconds of the first failure in the current window; 0 when
    /// the peer has no recent failures.
    checked_since: AtomicU64,
}

impl Peer {
    fn from_node(node: &UpstreamNode) -> Self {
        let weight = node.weight.max(1) as i64;
        Self {
            instance: UpstreamInstance::from(node),
            weight,
            backup: node.backup,
            down: node.down,
            max_fails: node.max_fails,
            fail_timeout_secs: node.fail_timeout_secs,
            current_weight: AtomicI64::new(0),
            effective_weight: AtomicI64::new(weight),
            fails: AtomicU32::new(0),
            checked_since: AtomicU64::new(0),
        }
    }

    /// Quarantined iff `max_fails` failures landed inside `fail_timeout`
    /// and that window hasn't elapsed yet. `max_fails == 0` disables
    /// quarantine entirely.
    fn quarantined(&self, now: u64) -> bool {
        if self.max_fails == 0 {
            return false;
        }
        if self.fails.load(Ordering::Relaxed) < self.max_fails {
            return false;
        }
        let since = self.checked_since.load(Ordering::Relaxed);
        since != 0 && now.saturating_sub(since) < self.fail_timeout_secs
    }

    fn record_success(&self) {
        // Effective-weight recovery happens per-selection in `pick`, not
        // here; a success callback only clears the failure window so a
        // probed, previously-quarantined peer re-enters rotation.
        self.fails.store(0, Ordering::Relaxed);
        self.checked_since.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, now: u64) {
        self.fails.fetch_add(1, Ordering::Relaxed);
        self.checked_since
            .compare_exchange(0, now, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
        if self.max_fails > 0 {
            // Integer division, kept exactly as the reference algorithm
            // specifies it: when `max_fails > weight` this rounds to 0 and
            // the peer's effective weight never actually decays, which is
            // a known quirk of the original rather than a bug to paper
            // over here.
            let penalty = self.weight / self.max_fails as i64;
            self.effective_weight
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    Some((w - penalty).max(0))
                })
                .ok();
        }
    }
}

struct State {
    peers: Vec<Arc<Peer>>,
}

pub struct SmoothWeightedBalancer {
    state: ArcSwap<State>,
}

impl Default for SmoothWeightedBalancer {
    fn default() -> Self {
        Self {
            state: ArcSwap::from_pointee(State { peers: Vec::new() }),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SmoothWeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_nodes(&self, nodes: &[UpstreamNode]) {
        let peers = nodes.iter().map(|n| Arc::new(Peer::from_node(n))).collect();
        self.state.store(Arc::new(State { peers }));
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        // Used when callers only have resolved instances (no per-node
        // failure config, e.g. discovery-sourced updates) — treat every
        // peer as a plain, non-backup, never-quarantined primary.
        let peers = instances
            .into_iter()
            .map(|instance| {
                let weight = instance.weight.max(1) as i64;
                Arc::new(Peer {
                    instance,
                    weight,
                    backup: false,
                    down: false,
                    max_fails: 0,
                    fail_timeout_secs: 0,
                    current_weight: AtomicI64::new(0),
                    effective_weight: AtomicI64::new(weight),
                    fails: AtomicU32::new(0),
                    checked_since: AtomicU64::new(0),
                })
            })
            .collect();
        self.state.store(Arc::new(State { peers }));
    }

    /// Pick one peer, preferring primaries and falling back to backups
    /// only once every primary is unavailable (down or quarantined).
    /// Returns `None` ("Busy") when no peer in either list is eligible.
    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let state = self.state.load();
        let now = now_secs();

        if let Some(inst) = self.pick(&state.peers, false, now) {
            return Some(inst);
        }
        self.pick(&state.peers, true, now)
    }

    fn pick(&self, peers: &[Arc<Peer>], backup: bool, now: u64) -> Option<UpstreamInstance> {
        let mut best: Option<&Arc<Peer>> = None;
        let mut total: i64 = 0;

        for peer in peers {
            if peer.backup != backup || peer.down || peer.quarantined(now) {
                continue;
            }
            // Per spec the loop does not skip a peer whose effective
            // weight has decayed to zero (only `down`/quarantined peers
            // are excluded) — it simply stops contributing to the sum
            // until its effective weight climbs back above zero via the
            // recovery step below, so a peer that hit zero through
            // failures is still eligible to recover on its own.
            let ew = peer.effective_weight.load(Ordering::Relaxed);
            // Per spec: every peer considered this selection nudges its
            // effective weight one step back toward its configured weight,
            // regardless of which peer ends up chosen.
            peer.effective_weight
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    if w < peer.weight { Some(w + 1) } else { None }
                })
                .ok();
            let cw = peer.current_weight.fetch_add(ew, Ordering::Relaxed) + ew;
            total += ew;
            match best {
                Some(b) if b.current_weight.load(Ordering::Relaxed) >= cw => {}
                _ => best = Some(peer),
            }
        }

        let best = best?;
        best.current_weight.fetch_sub(total, Ordering::Relaxed);
        Some(best.instance.clone())
    }

    pub fn record_result(&self, endpoint: &str, ok: bool) {
        let state = self.state.load();
        let Some(peer) = state.peers.iter().find(|p| p.instance.endpoint() == endpoint) else {
            return;
        };
        if ok {
            peer.record_success();
        } else {
            peer.record_failure(now_secs());
        }
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.state.load().peers.iter().map(|p| p.instance.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(host: &str, weight: u32) -> UpstreamNode {
        UpstreamNode {
            host: host.to_string(),
            port: 80,
            weight,
            metadata: HashMap::new(),
            max_fails: 1,
            fail_timeout_secs: 10,
            backup: false,
            down: false,
        }
    }

    #[test]
    fn smoothing_avoids_bursts() {
        // Nginx's canonical example: weights 5,1,1 must not pick the
        // heaviest peer five times in a row.
        let lb = SmoothWeightedBalancer::new();
        lb.update_nodes(&[node("A", 5), node("B", 1), node("C", 1)]);
        let picks: Vec<String> = (0..7).map(|_| lb.do_select().unwrap().host).collect();
        assert!(!picks[0..5].iter().all(|h| h == "A"));
    }

    #[test]
    fn weighted_distribution_over_many_picks() {
        let lb = SmoothWeightedBalancer::new();
        lb.update_nodes(&[node("A", 3), node("B", 1)]);
        let mut counts = HashMap::new();
        for _ in 0..4000 {
            let h = lb.do_select().unwrap().host;
            *counts.entry(h).or_insert(0) += 1;
        }
        assert_eq!(counts[&"A".to_string()], 3000);
        assert_eq!(counts[&"B".to_string()], 1000);
    }

    #[test]
    fn quarantine_removes_peer_until_timeout() {
        let lb = SmoothWeightedBalancer::new();
        lb.update_nodes(&[node("A", 1), node("B", 1)]);
        lb.record_result("A:80", false);
        for _ in 0..10 {
            assert_eq!(lb.do_select().unwrap().host, "B");
        }
    }

    #[test]
    fn backup_only_used_when_all_primaries_unavailable() {
        let lb = SmoothWeightedBalancer::new();
        let mut backup = node("B", 1);
        backup.backup = true;
        let mut primary = node("A", 1);
        primary.max_fails = 1;
        lb.update_nodes(&[primary, backup]);
        lb.record_result("A:80", false);
        assert_eq!(lb.do_select().unwrap().host, "B");
    }

    #[test]
    fn down_peer_never_selected() {
        let lb = SmoothWeightedBalancer::new();
        let mut down = node("A", 100);
        down.down = true;
        lb.update_nodes(&[down, node("B", 1)]);
        for _ in 0..10 {
            assert_eq!(lb.do_select().unwrap().host, "B");
        }
    }

    #[test]
    fn effective_weight_can_floor_to_zero_in_one_failure() {
        // weight == max_fails: a single failure divides evenly to the
        // full weight and floors effective_weight straight to 0, rather
        // than decaying it gradually — the integer-division quirk kept
        // intentionally rather than smoothed over.
        let lb = SmoothWeightedBalancer::new();
        let mut n = node("A", 1);
        n.max_fails = 1;
        lb.update_nodes(&[n, node("B", 1)]);
        lb.record_result("A:80", false);
        // A is both quarantined (fails >= max_fails) and at effective
        // weight 0; either reason keeps it out of rotation.
        for _ in 0..5 {
            assert_eq!(lb.do_select().unwrap().host, "B");
        }
    }

    #[test]
    fn busy_when_nothing_available() {
        let lb = SmoothWeightedBalancer::new();
        let mut a = node("A", 1);
        a.down = true;
        lb.update_nodes(&[a]);
        assert!(lb.do_select().is_none());
    }
}
