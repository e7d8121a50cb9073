//! Score reporting and master heartbeating.
//!
//! One loop does both: each tick samples the scorer and pushes the score to
//! the master. A successful round-trip counts as master contact; sustained
//! failures leave the election loop to notice the silence.

use std::sync::Arc;
use tokio::sync::watch;

use crate::scorer::ResourceScorer;
use crate::wire::{self, Message};

use super::WorkerEngine;

pub async fn run_report_loop(engine: Arc<WorkerEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut scorer: Option<ResourceScorer> = None;
    let mut registered_with: Option<String> = None;
    let mut tick = tokio::time::interval(engine.cfg.score_cadence());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let rpc_timeout = engine.cfg.score_cadence();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }
        if engine.election.is_master() {
            // Promoted mid-flight; the master engine owns the registry now.
            continue;
        }
        let Some(master) = engine.election.known_master() else {
            continue;
        };
        if master == engine.self_addr {
            continue;
        }

        if registered_with.as_deref() != Some(master.as_str()) {
            let register = Message::Register {
                addr: engine.self_addr.clone(),
                capacity: engine.cfg.worker_capacity as u32,
            };
            match wire::request(&master, &register, rpc_timeout).await {
                Ok(Message::RegisterReply { ok: true, .. }) => {
                    tracing::info!(master = %master, "registered with master");
                    registered_with = Some(master.clone());
                    engine.election.note_master_contact();
                }
                Ok(other) => {
                    tracing::debug!(master = %master, "registration refused: {other:?}");
                    continue;
                }
                Err(err) => {
                    tracing::debug!(master = %master, "registration failed: {err}");
                    continue;
                }
            }
        }

        let score = match engine.cfg.score_override {
            Some(score) => score,
            None => scorer
                .get_or_insert_with(|| ResourceScorer::new(engine.cfg.score_weights))
                .sample(),
        };
        let report = Message::ReportScore {
            addr: engine.self_addr.clone(),
            score,
        };
        match wire::request(&master, &report, rpc_timeout).await {
            Ok(Message::Ack { ok: true, .. }) => engine.election.note_master_contact(),
            Ok(other) => tracing::debug!(master = %master, "score report refused: {other:?}"),
            Err(err) => tracing::debug!(master = %master, "score report failed: {err}"),
        }
    }
}
