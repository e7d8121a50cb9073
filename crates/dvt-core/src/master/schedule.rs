//! Worker selection for one shard dispatch.

use std::time::Duration;

use crate::registry::WorkerCandidate;

/// Picks a worker for a shard: lowest fresh score wins, ties broken by
/// fewest in-flight assignments, then lexicographic address. Workers that
/// already failed this shard are avoided while any alternative exists.
///
/// Capacity is respected until the shard has waited past the starvation
/// threshold; a starving shard is hoisted onto the best worker regardless
/// of its in-flight count so a saturated fast worker cannot stall progress.
pub fn choose_worker(
    candidates: &[WorkerCandidate],
    excluded: &[String],
    waiting: Duration,
    starvation_threshold: Duration,
) -> Option<String> {
    let mut pool: Vec<&WorkerCandidate> = candidates
        .iter()
        .filter(|c| !excluded.contains(&c.addr))
        .collect();
    if pool.is_empty() {
        // Every eligible worker already failed this shard; rotation is
        // best-effort when the cluster has nobody else.
        pool = candidates.iter().collect();
    }

    let starving = waiting >= starvation_threshold;
    if !starving {
        pool.retain(|c| c.in_flight < c.capacity);
    }

    pool.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.in_flight.cmp(&b.in_flight))
            .then(a.addr.cmp(&b.addr))
    });
    pool.first().map(|c| c.addr.clone())
}
