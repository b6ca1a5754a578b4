// src/gateway.rs
//
// Process wiring: builds the channel set, connects the bus, spawns the
// scheduler, workers, collator, heartbeats and the listener/dispatcher
// pair, then waits for shutdown or a reload request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::bus::client;
use crate::bus::listener::{self, DispatcherCtx};
use crate::bus::BusError;
use crate::config::model::Cfg;
use crate::io::collator::{self, CollatorCtx};
use crate::io::worker::{SharedWorkerStats, Worker, WorkerStats};
use crate::io::{batcher, IoChannels};
use crate::sched::{Scheduler, SyncGate, Timer};

/// Why the gateway stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// `_reload` was requested: reload the config and start again.
    Reload,
    /// Normal shutdown (signal or fatal bus error).
    Shutdown,
}

/// Run one gateway lifetime against a loaded config. Returns when the stop
/// flag is raised, reporting whether a reload was requested.
pub async fn run(cfg: Arc<Cfg>, bus_addr: &str, process_name: &str) -> Result<RunOutcome, BusError> {
    let channels = IoChannels::new();
    let reload = Arc::new(AtomicBool::new(false));

    // Bus connection + subscriptions.
    let (bus, bus_reader) = client::connect(bus_addr, process_name, &cfg.subs).await?;
    tlog!(
        "[Gateway] Connected to bus at {}, {} subscription(s)",
        bus_addr,
        cfg.subs.len()
    );

    let sched = Scheduler::new(channels.stop.clone());
    let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // One sync gate per publication, shared with the collator.
    let gates: HashMap<String, Arc<SyncGate>> = cfg
        .pubs
        .keys()
        .map(|name| (name.clone(), Arc::new(SyncGate::default())))
        .collect();

    // Collator.
    handles.push(tokio::spawn(collator::run(
        CollatorCtx {
            cfg: cfg.clone(),
            bus: bus.clone(),
            sched: sched.clone(),
            gates: gates.clone(),
        },
        channels.clone(),
    )));

    // Connection workers.
    let mut worker_stats: Vec<SharedWorkerStats> = Vec::new();
    for id in 0..cfg.connection.max_num_connections {
        let stats: SharedWorkerStats = Arc::new(Mutex::new(WorkerStats::default()));
        worker_stats.push(stats.clone());
        handles.push(tokio::spawn(
            Worker::new(id, cfg.clone(), channels.clone(), stats).run(),
        ));
    }

    // Heartbeat supervisors.
    handles.extend(crate::heartbeat::spawn_all(&cfg, &channels, &bus));

    // Listener and dispatcher.
    let (msg_tx, msg_rx) = mpsc::channel(64);
    handles.push(tokio::spawn(listener::listen(
        bus_reader,
        msg_tx,
        channels.clone(),
    )));
    handles.push(tokio::spawn(listener::dispatch(
        DispatcherCtx {
            cfg: cfg.clone(),
            channels: channels.clone(),
            bus: bus.clone(),
            sched: sched.clone(),
            worker_stats,
            reload: reload.clone(),
        },
        msg_rx,
    )));

    // Publication timers.
    register_pub_timers(&cfg, &channels, &sched, &gates);
    handles.push(tokio::spawn(sched.clone().run()));

    // Wait for shutdown or a signal.
    let stop_wait = async {
        while !channels.stopped() {
            sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        _ = stop_wait => {}
        _ = tokio::signal::ctrl_c() => {
            tlog!("[Gateway] Interrupt received, shutting down");
            channels.request_stop();
        }
    }

    sched.kick();
    for handle in handles {
        let _ = handle.await;
    }

    let outcome = if reload.load(Ordering::Relaxed) {
        RunOutcome::Reload
    } else {
        RunOutcome::Shutdown
    };
    tlog!("[Gateway] Stopped ({:?})", outcome);
    Ok(outcome)
}

/// Register one periodic timer per publication. The callback batches the
/// component's register groups into work items and queues them for the
/// worker pool; the sync gate keeps cycles from overlapping on a slow
/// device.
fn register_pub_timers(
    cfg: &Arc<Cfg>,
    channels: &IoChannels,
    sched: &Scheduler,
    gates: &HashMap<String, Arc<SyncGate>>,
) {
    for publication in cfg.pubs.values() {
        let comp_id = publication.comp;
        let name = publication.id.clone();
        let cb_cfg = cfg.clone();
        let cb_channels = channels.clone();
        let gate = gates.get(&name).cloned();
        let cb_gate = gate.clone();

        sched.add(Timer {
            name: name.clone(),
            offset_s: publication.offset_time_ms as f64 / 1000.0,
            period_s: publication.frequency_ms as f64 / 1000.0,
            callback: Box::new(move |timer_name, t| {
                if let Some(publication) = cb_cfg.pubs.get(timer_name) {
                    if let Ok(mut stats) = publication.stats.lock() {
                        stats.t_request = t;
                    }
                }
                let mut works = batcher::build_pub_works(&cb_cfg, comp_id, t, &cb_channels.pool);
                if works.is_empty() {
                    // Nothing to read (everything disabled): release the
                    // gate or the publication never fires again.
                    if let Some(gate) = &cb_gate {
                        gate.release();
                    }
                    return;
                }
                let mut failed = false;
                for work in works.drain(..) {
                    if failed {
                        cb_channels.pool.put(work);
                        continue;
                    }
                    if let Err(e) = cb_channels.poll_tx.try_send(work) {
                        tlog!(
                            "[Sched] Poll channel full, dropping cycle for {}",
                            timer_name
                        );
                        // Recycle the item the channel handed back.
                        if let tokio::sync::mpsc::error::TrySendError::Full(w)
                        | tokio::sync::mpsc::error::TrySendError::Closed(w) = e
                        {
                            cb_channels.pool.put(w);
                        }
                        failed = true;
                    }
                }
                if failed {
                    // The partial group is replaced at the next cycle; the
                    // gate must not stay held.
                    if let Some(gate) = &cb_gate {
                        gate.release();
                    }
                }
            }),
            sync: gate,
        });
        tlog!(
            "[Gateway] Publication {} every {} ms (offset {} ms)",
            name,
            publication.frequency_ms,
            publication.offset_time_ms
        );
    }
}
