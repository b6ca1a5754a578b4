// src/bus/listener.rs
//
// Bus listener and dispatcher. The listener task blocks on the socket
// (2 s timeout to observe the stop flag) and hands parsed frames to the
// dispatcher over a channel, so slow decoding never backs up the socket.
// The dispatcher resolves uris against the config graph and turns sets and
// gets into work items, handles the control suffixes, and answers the
// timing queries directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::codec::{self, Value};
use crate::config::model::{Cfg, IoPoint};
use crate::io::worker::SharedWorkerStats;
use crate::io::{batcher, now_s, IoChannels, IoWork};
use crate::sched::{Scheduler, Timer};
use crate::uri::UriRequest;

use super::client::{BusReader, BusWriter};
use super::{BusError, BusMessage, Method};

// ============================================================================
// Listener task
// ============================================================================

/// Read frames until the stop flag is set or the socket dies. A dead bus
/// socket is fatal: the stop flag is raised and the process shuts down.
pub async fn listen(
    mut reader: BusReader,
    tx: mpsc::Sender<BusMessage>,
    channels: IoChannels,
) {
    tlog!("[Bus] Listener started");
    loop {
        if channels.stopped() {
            break;
        }
        match reader.read_frame().await {
            Ok(None) => continue, // timeout, re-check stop flag
            Ok(Some(msg)) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(BusError::Closed) => {
                tlog!("[Bus] Connection closed by server; shutting down");
                channels.request_stop();
                break;
            }
            Err(e) => {
                tlog!("[Bus] Fatal read error: {}; shutting down", e);
                channels.request_stop();
                break;
            }
        }
    }
    tlog!("[Bus] Listener stopped");
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct DispatcherCtx {
    pub cfg: Arc<Cfg>,
    pub channels: IoChannels,
    pub bus: BusWriter,
    pub sched: Scheduler,
    pub worker_stats: Vec<SharedWorkerStats>,
    /// Raised by `_reload`; the gateway restarts instead of exiting.
    pub reload: Arc<AtomicBool>,
}

/// Run the dispatcher until the inbound channel closes or stop is raised.
pub async fn dispatch(ctx: DispatcherCtx, mut rx: mpsc::Receiver<BusMessage>) {
    tlog!("[Bus] Dispatcher started");
    loop {
        if ctx.channels.stopped() {
            break;
        }
        let msg = match timeout(Duration::from_millis(100), rx.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(msg)) => msg,
        };
        handle_message(&ctx, msg).await;
    }
    tlog!("[Bus] Dispatcher stopped");
}

async fn handle_message(ctx: &DispatcherCtx, msg: BusMessage) {
    let req = UriRequest::parse(&msg.uri);

    // Everything we serve lives under /<base>/<component>.
    if req.segments.len() < 2 || req.segments[0] != ctx.cfg.base_uri {
        return;
    }
    let comp = match ctx.cfg.find_comp(&req.segments[1]) {
        Some(comp) => comp,
        None => return,
    };
    let point = req
        .segments
        .get(2)
        .and_then(|id| comp.point_index.get(id))
        .map(|&pid| ctx.cfg.point(pid));

    match msg.method {
        Method::Set if req.is_reload_request => {
            tlog!("[Bus] Reload requested on {}", msg.uri);
            reply_status(ctx, &msg, true).await;
            ctx.reload.store(true, Ordering::Relaxed);
            ctx.channels.request_stop();
        }
        Method::Set if req.is_force_request || req.is_unforce_request => {
            let ok = handle_force(&msg, &req, point);
            reply_status(ctx, &msg, ok).await;
        }
        Method::Set if req.is_enable_request || req.is_disable_request => {
            let enable = req.is_enable_request;
            match point {
                Some(p) => set_enabled(p, enable),
                None => {
                    for &pid in comp.point_index.values() {
                        set_enabled(ctx.cfg.point(pid), enable);
                    }
                }
            }
            reply_status(ctx, &msg, true).await;
        }
        Method::Set if req.is_reset_timings_request => {
            if let Some(publication) = ctx.cfg.pubs.get(&ctx.cfg.pub_name(comp.idx)) {
                if let Ok(mut stats) = publication.stats.lock() {
                    *stats = crate::config::model::PubStats {
                        t_late: stats.t_late,
                        ..Default::default()
                    };
                }
            }
            reply_status(ctx, &msg, true).await;
        }
        Method::Get if req.is_timings_request => {
            let body = timings_body(ctx, comp.idx);
            if let Some(replyto) = &msg.replyto {
                let _ = ctx.bus.send_set(replyto, body.to_string()).await;
            }
        }
        Method::Get => {
            let replyto = match &msg.replyto {
                Some(r) => r.clone(),
                None => return,
            };
            match point {
                Some(p) => {
                    // Single-point get: a one-shot local read.
                    let mut work = one_shot_local_get(ctx, p);
                    work.replyto = Some(replyto);
                    work.raw_mode = req.is_raw_request;
                    let _ = ctx.channels.poll_tx.send(work).await;
                }
                None => {
                    let works = batcher::build_get_works(
                        &ctx.cfg,
                        comp.idx,
                        now_s(),
                        &ctx.channels.pool,
                        replyto,
                        req.is_raw_request,
                    );
                    for work in works {
                        let _ = ctx.channels.poll_tx.send(work).await;
                    }
                }
            }
        }
        Method::Set => {
            handle_set(ctx, &msg, comp.idx, point).await;
        }
        _ => {}
    }
}

fn set_enabled(point: &IoPoint, enable: bool) {
    if let Ok(mut rt) = point.runtime.lock() {
        rt.is_enabled = enable;
        if enable {
            rt.offtime = 0.0;
        }
    }
}

fn one_shot_local_get(ctx: &DispatcherCtx, point: &IoPoint) -> Box<IoWork> {
    let mut work = ctx.channels.pool.take();
    work.device_id = point.device_id;
    work.reg_type = point.reg_type;
    work.wtype = if point.reg_type.is_bit_type() {
        crate::io::WorkType::BitGet
    } else {
        crate::io::WorkType::Get
    };
    work.offset = point.offset;
    work.num_registers = point.size as u16;
    work.local = true;
    work.points.push(point.idx);
    work.group = Some(point.group);
    work.comp = Some(point.comp);
    work
}

async fn reply_status(ctx: &DispatcherCtx, msg: &BusMessage, ok: bool) {
    if let Some(replyto) = &msg.replyto {
        let status = if ok { "Success" } else { "Failed" };
        let body = json!({"gcom": "Modbus Set", "status": status});
        let _ = ctx.bus.send_set(replyto, body.to_string()).await;
    }
}

// ------------------------------------------------------------------
// Force / unforce
// ------------------------------------------------------------------

fn handle_force(msg: &BusMessage, req: &UriRequest, point: Option<&IoPoint>) -> bool {
    let point = match point {
        Some(p) => p,
        None => return false,
    };

    if req.is_unforce_request {
        if let Ok(mut rt) = point.runtime.lock() {
            rt.is_forced = false;
            rt.offtime = 0.0;
        }
        return true;
    }

    let value = match msg.body_json().ok().as_ref().and_then(Value::from_json) {
        Some(v) => v,
        None => return false,
    };
    let raw = if point.reg_type.is_bit_type() {
        codec::encode_bit(&point.codec, &value) as u64
    } else {
        let regs = codec::encode_registers(&point.codec, &value);
        let mut raw = 0u64;
        for reg in regs.iter().take(point.size as usize) {
            raw = (raw << 16) | *reg as u64;
        }
        raw
    };
    if let Ok(mut rt) = point.runtime.lock() {
        rt.is_forced = true;
        rt.forced_val = raw;
        rt.offtime = now_s();
    }
    true
}

// ------------------------------------------------------------------
// Sets
// ------------------------------------------------------------------

enum SetDecision {
    Write,
    Coalesced,
}

/// Debounce gate: accept the write if the window has passed or the value
/// moved by more than the deadband; otherwise coalesce it as the pending
/// value for the end of the window.
fn debounce_decision(ctx: &DispatcherCtx, point: &IoPoint, value: &Value, t: f64) -> SetDecision {
    if point.debounce_s <= 0.0 {
        return SetDecision::Write;
    }
    let schedule_flush = {
        let mut rt = match point.runtime.lock() {
            Ok(rt) => rt,
            Err(_) => return SetDecision::Write,
        };
        let moved = (value.as_f64() - rt.last_set_float).abs() > point.deadband;
        if t >= rt.debounce_until || moved {
            rt.debounce_until = t + point.debounce_s;
            rt.last_set_float = value.as_f64();
            rt.pending_set = None;
            return SetDecision::Write;
        }
        let had_pending = rt.pending_set.is_some();
        rt.pending_set = Some(*value);
        // Only the first coalesced value needs a flush timer.
        !had_pending
    };
    if schedule_flush {
        schedule_debounce_flush(ctx, point);
    }
    SetDecision::Coalesced
}

/// One-shot timer that writes the pending value when the window closes.
fn schedule_debounce_flush(ctx: &DispatcherCtx, point: &IoPoint) {
    let pid = point.idx;
    let cfg = ctx.cfg.clone();
    let channels = ctx.channels.clone();
    let name = format!("deb_{}_{}", cfg.comp(point.comp).id, point.id);
    ctx.sched.add(Timer {
        name,
        offset_s: point.debounce_s,
        period_s: 0.0,
        callback: Box::new(move |_, t| {
            let point = cfg.point(pid);
            let pending = point.runtime.lock().ok().and_then(|mut rt| {
                let v = rt.pending_set.take();
                if let Some(v) = v {
                    rt.debounce_until = t + point.debounce_s;
                    rt.last_set_float = v.as_f64();
                }
                v
            });
            if let Some(value) = pending {
                let work = batcher::build_set_work(&cfg, point, &value, &channels.pool, false);
                let _ = channels.set_tx.try_send(work);
            }
        }),
        sync: None,
    });
}

async fn handle_set(
    ctx: &DispatcherCtx,
    msg: &BusMessage,
    comp_id: crate::config::model::CompId,
    point: Option<&IoPoint>,
) {
    let comp = ctx.cfg.comp(comp_id);
    let body = match msg.body_json() {
        Ok(b) => b,
        Err(_) => {
            reply_status(ctx, msg, false).await;
            return;
        }
    };

    // Collect the (point, value) pairs this set addresses.
    let mut accepted: Vec<(&IoPoint, Value)> = Vec::new();
    let mut rejected = 0usize;
    let mut coalesced = 0usize;
    let t = now_s();

    match point {
        Some(p) => {
            if !p.reg_type.is_writable() {
                rejected += 1;
            } else {
                match Value::from_json(&body) {
                    Some(v) => accepted.push((p, v)),
                    None => rejected += 1,
                }
            }
        }
        None => match body.as_object() {
            Some(map) => {
                for (id, raw_value) in map {
                    let p = match comp.point_index.get(id) {
                        Some(&pid) => ctx.cfg.point(pid),
                        None => {
                            rejected += 1;
                            continue;
                        }
                    };
                    if !p.reg_type.is_writable() {
                        rejected += 1;
                        continue;
                    }
                    match Value::from_json(raw_value) {
                        Some(v) => accepted.push((p, v)),
                        None => rejected += 1,
                    }
                }
            }
            None => {
                reply_status(ctx, msg, false).await;
                return;
            }
        },
    }

    // Debounce each accepted point.
    let mut to_write: Vec<(&IoPoint, Value)> = Vec::new();
    for (p, v) in accepted {
        match debounce_decision(ctx, p, &v, t) {
            SetDecision::Write => to_write.push((p, v)),
            SetDecision::Coalesced => coalesced += 1,
        }
    }

    // Any invalid item fails the request up front; valid items still
    // proceed to the wire below.
    let failed_validation = rejected > 0;
    if failed_validation {
        reply_status(ctx, msg, false).await;
    }

    if to_write.is_empty() {
        if !failed_validation {
            // Nothing hit the wire: coalesced writes count as accepted.
            reply_status(ctx, msg, coalesced > 0).await;
        }
        return;
    }

    let mut works: Vec<Box<IoWork>> = to_write
        .iter()
        .map(|(p, v)| batcher::build_set_work(&ctx.cfg, p, v, &ctx.channels.pool, false))
        .collect();
    works = batcher::merge_set_works(&ctx.cfg, works);

    let work_name = format!("set_{}_{}", ctx.cfg.base_uri, comp.id);
    let total = works.len() as u32;
    for (i, work) in works.iter_mut().enumerate() {
        work.work_name = work_name.clone();
        work.work_id = i as u32;
        work.work_group = total;
        work.t_now = t;
        work.erase_group = true;
        if !failed_validation {
            work.replyto = msg.replyto.clone();
        }
    }
    for work in works {
        let _ = ctx.channels.set_tx.send(work).await;
    }
}

// ------------------------------------------------------------------
// Timings
// ------------------------------------------------------------------

fn timings_body(ctx: &DispatcherCtx, comp_id: crate::config::model::CompId) -> serde_json::Value {
    let name = ctx.cfg.pub_name(comp_id);
    let mut body = serde_json::Map::new();
    if let Some(publication) = ctx.cfg.pubs.get(&name) {
        if let Ok(stats) = publication.stats.lock() {
            body.insert(
                name.clone(),
                json!({
                    "count": stats.count,
                    "min_ms": if stats.count == 0 { 0.0 } else { stats.t_min * 1000.0 },
                    "max_ms": stats.t_max * 1000.0,
                    "avg_ms": stats.avg() * 1000.0,
                    "late": stats.late_count,
                    "errors": stats.errors,
                }),
            );
        }
    }
    let workers: Vec<serde_json::Value> = ctx
        .worker_stats
        .iter()
        .enumerate()
        .map(|(id, stats)| {
            let s = stats.lock().map(|s| s.clone()).unwrap_or_default();
            json!({
                "id": id,
                "jobs": s.jobs,
                "fails": s.fails,
                "connected": s.connected,
                "connect_time_ms": s.connect_time * 1000.0,
            })
        })
        .collect();
    body.insert("workers".to_string(), serde_json::Value::Array(workers));
    serde_json::Value::Object(body)
}

// ============================================================================
// Tests
// ============================================================================
