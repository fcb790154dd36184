// src/core/client/pool.rs

//! Epsilon-greedy host pool. Cluster-scoped calls pick the host with the
//! lowest decayed average latency most of the time, and a random host with a
//! small probability so that a recovered host gets re-measured.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const EPSILON: f64 = 0.1;
/// Penalty latency recorded for a failed request, in seconds.
const FAILURE_PENALTY: f64 = 60.0;

struct HostStats {
    avg_response: f64,
    last_update: Instant,
}

pub struct HostPool {
    hosts: Vec<String>,
    stats: Mutex<HashMap<String, HostStats>>,
    decay: Duration,
}

impl HostPool {
    pub fn new(hosts: Vec<String>, decay: Duration) -> Self {
        Self {
            hosts,
            stats: Mutex::new(HashMap::new()),
            decay,
        }
    }

    /// Picks the next host to send a cluster-scoped request to.
    pub fn pick(&self) -> String {
        if self.hosts.len() == 1 {
            return self.hosts[0].clone();
        }
        let mut rng = rand::thread_rng();
        if rng.gen_bool(EPSILON) {
            return self.hosts[rng.gen_range(0..self.hosts.len())].clone();
        }

        let stats = self.stats.lock();
        let now = Instant::now();
        self.hosts
            .iter()
            .min_by(|a, b| {
                let la = decayed(stats.get(*a), now, self.decay);
                let lb = decayed(stats.get(*b), now, self.decay);
                la.total_cmp(&lb)
            })
            .cloned()
            .unwrap_or_else(|| self.hosts[0].clone())
    }

    /// Records the outcome of a request against `host`.
    pub fn record(&self, host: &str, latency: Duration, ok: bool) {
        let sample = if ok {
            latency.as_secs_f64()
        } else {
            FAILURE_PENALTY
        };
        let mut stats = self.stats.lock();
        let now = Instant::now();
        let entry = stats.entry(host.to_string()).or_insert(HostStats {
            avg_response: sample,
            last_update: now,
        });
        let w = decay_weight(now.duration_since(entry.last_update), self.decay);
        entry.avg_response = entry.avg_response * w + sample * (1.0 - w);
        entry.last_update = now;
    }
}

fn decayed(stats: Option<&HostStats>, now: Instant, decay: Duration) -> f64 {
    match stats {
        // Unmeasured hosts sort first so every host gets sampled.
        None => 0.0,
        Some(s) => s.avg_response * decay_weight(now.duration_since(s.last_update), decay),
    }
}

fn decay_weight(age: Duration, decay: Duration) -> f64 {
    if decay.is_zero() {
        return 0.0;
    }
    (-age.as_secs_f64() / decay.as_secs_f64()).exp()
}
