//! Resource scorer: one scalar per node, lower = more capacity.
//!
//! Samples load average, I/O wait, network throughput, and memory use, and
//! combines them with configured weights. Scores are unitless; only their
//! ordering matters to the scheduler.

use std::time::Instant;
use sysinfo::{Networks, System};

use crate::config::ScoreWeights;

/// Nominal interface capacity used to normalize throughput (1 Gbit/s).
const NET_CAPACITY_BYTES_PER_SEC: f64 = 125_000_000.0;

/// Cumulative jiffy counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTotals {
    pub iowait: u64,
    pub total: u64,
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
/// Fields: user nice system idle iowait irq softirq steal [guest guest_nice].
pub fn parse_cpu_totals(stat: &str) -> Option<CpuTotals> {
    let line = stat.lines().find(|l| {
        l.starts_with("cpu") && l.as_bytes().get(3).is_some_and(|b| b.is_ascii_whitespace())
    })?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    Some(CpuTotals {
        iowait: fields[4],
        total: fields.iter().sum(),
    })
}

/// Fraction of CPU time spent in iowait between two samples, clamped to [0, 1].
pub fn iowait_fraction(prev: CpuTotals, cur: CpuTotals) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let wait = cur.iowait.saturating_sub(prev.iowait);
    (wait as f64 / total as f64).clamp(0.0, 1.0)
}

/// Weighted combination of the four normalized inputs.
pub fn combine(weights: &ScoreWeights, load: f64, iowait: f64, net: f64, mem: f64) -> f64 {
    weights.load * load.clamp(0.0, 1.0)
        + weights.iowait * iowait.clamp(0.0, 1.0)
        + weights.net * net.clamp(0.0, 1.0)
        + weights.mem * mem.clamp(0.0, 1.0)
}

/// Stateful sampler. Keeps one `System` so sysinfo's baselines are warmed
/// once, and tracks deltas for iowait and network counters.
pub struct ResourceScorer {
    weights: ScoreWeights,
    sys: System,
    networks: Networks,
    prev_cpu: Option<CpuTotals>,
    last_sample: Instant,
}

impl ResourceScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            weights,
            sys,
            networks: Networks::new_with_refreshed_list(),
            prev_cpu: read_cpu_totals(),
            last_sample: Instant::now(),
        }
    }

    /// Produce the current score. Call on the report cadence; deltas are
    /// computed against the previous call.
    pub fn sample(&mut self) -> f64 {
        let dt = self.last_sample.elapsed().as_secs_f64().max(0.001);
        self.last_sample = Instant::now();

        let cpus = self.sys.cpus().len().max(1) as f64;
        let load = System::load_average().one / cpus;

        let iowait = match (self.prev_cpu, read_cpu_totals()) {
            (Some(prev), Some(cur)) => {
                self.prev_cpu = Some(cur);
                iowait_fraction(prev, cur)
            }
            (_, cur) => {
                self.prev_cpu = cur;
                0.0
            }
        };

        self.networks.refresh();
        let bytes: u64 = self
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let net = (bytes as f64 / dt) / NET_CAPACITY_BYTES_PER_SEC;

        self.sys.refresh_memory();
        let total_mem = self.sys.total_memory().max(1);
        let mem = self.sys.used_memory() as f64 / total_mem as f64;

        let score = combine(&self.weights, load, iowait, net, mem);
        tracing::trace!(load, iowait, net, mem, score, "resource sample");
        score
    }
}

fn read_cpu_totals() -> Option<CpuTotals> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_totals(&stat)
}
