// src/io/collator.rs
//
// Response collation. Work items come back from the workers on the response
// channel; the collator groups them by work_name, drops stale items, and on
// group completion decodes the buffers into one body and emits it on the
// bus: a `pub` for poll cycles, a reply-to `set` for gets and sets. Items
// are then recycled through the pool and the publication's sync gate is
// released so the scheduler can fire the next cycle.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio::time::{timeout, Duration};

use crate::bus::client::BusWriter;
use crate::codec;
use crate::config::model::Cfg;
use crate::events::{emit_event, Severity};
use crate::sched::{Scheduler, SyncGate};

use super::{now_s, IoChannels, IoWork};

/// Consecutive failed cycles before a component is declared disconnected.
pub const DISCONNECT_AFTER_FAILS: u32 = 5;

// ============================================================================
// Collator groups
// ============================================================================

struct CollatorGroup {
    t_now: f64,
    expected: u32,
    works: Vec<Box<IoWork>>,
}

/// Everything the collator needs to finish a group.
pub struct CollatorCtx {
    pub cfg: Arc<Cfg>,
    pub bus: BusWriter,
    pub sched: Scheduler,
    /// work_name → publication sync gate.
    pub gates: HashMap<String, Arc<SyncGate>>,
}

// ============================================================================
// Decode helpers
// ============================================================================

/// Decode one work item's buffers into body entries, updating each point's
/// runtime (cache, last values) on the way. Failed items render from the
/// shadow cache instead, preserving the last good values.
fn decode_work_into(cfg: &Cfg, work: &IoWork, body: &mut serde_json::Map<String, serde_json::Value>) {
    for &pid in &work.points {
        let point = cfg.point(pid);
        let idx = (point.offset - work.offset) as usize;

        let (raw, value) = if work.errno_code != 0 {
            // Stale: re-decode the cached registers.
            let cache = point.cached_registers();
            if point.reg_type.is_bit_type() {
                codec::decode_bit(cache[0] as u8, &point.codec)
            } else {
                codec::decode_registers(&cache[..point.size as usize], &point.codec)
            }
        } else if point.reg_type.is_bit_type() {
            codec::decode_bit(work.buf8[idx], &point.codec)
        } else {
            codec::decode_registers(&work.buf16[idx..idx + point.size as usize], &point.codec)
        };

        // A forced point publishes its forced value regardless of the wire.
        let (raw, value) = {
            let runtime = point.runtime.lock();
            match runtime {
                Ok(mut rt) => {
                    if work.errno_code == 0 {
                        rt.last_raw = raw;
                        rt.last_value = Some(value);
                        rt.last_float = value.as_f64();
                        if point.reg_type.is_bit_type() {
                            rt.cache[0] = work.buf8[idx] as u16;
                        } else {
                            rt.cache[..point.size as usize]
                                .copy_from_slice(&work.buf16[idx..idx + point.size as usize]);
                        }
                    }
                    if rt.is_forced {
                        let forced = rt.forced_val;
                        if point.reg_type.is_bit_type() {
                            codec::decode_bit((forced != 0) as u8, &point.codec)
                        } else {
                            let mut regs = [0u16; 4];
                            for (i, reg) in regs.iter_mut().enumerate().take(point.size as usize) {
                                let sh = 16 * (point.size as usize - 1 - i);
                                *reg = (forced >> sh) as u16;
                            }
                            codec::decode_registers(&regs[..point.size as usize], &point.codec)
                        }
                    } else {
                        (raw, value)
                    }
                }
                Err(_) => (raw, value),
            }
        };

        body.insert(
            point.id.clone(),
            codec::render_value(raw, &value, &point.codec, work.raw_mode),
        );
    }
}

/// Assemble the completed group's body in batcher enumeration order.
fn assemble_body(cfg: &Cfg, works: &mut [Box<IoWork>]) -> serde_json::Value {
    works.sort_by_key(|w| w.work_id);
    let mut body = serde_json::Map::new();
    for work in works.iter() {
        decode_work_into(cfg, work, &mut body);
    }
    serde_json::Value::Object(body)
}

fn group_failed(works: &[Box<IoWork>]) -> bool {
    works.iter().any(|w| w.errno_code != 0)
}

// ============================================================================
// Completion
// ============================================================================

/// Finish a completed group and hand the items back for recycling.
async fn complete_group(
    ctx: &CollatorCtx,
    key: &str,
    mut works: Vec<Box<IoWork>>,
    t_now: f64,
) -> Vec<Box<IoWork>> {
    let failed = group_failed(&works);
    let comp_id = works.iter().find_map(|w| w.comp);

    if key.starts_with("pub_") {
        let body = assemble_body(&ctx.cfg, &mut works);
        if let Some(comp_id) = comp_id {
            let comp = ctx.cfg.comp(comp_id);
            if let Err(e) = ctx.bus.send_pub(&comp.uri, body.to_string()).await {
                tlog!("[Collator] pub on {} failed: {}", comp.uri, e);
            }

            // Publication timing statistics.
            if let Some(publication) = ctx.cfg.pubs.get(key) {
                if let Ok(mut stats) = publication.stats.lock() {
                    stats.record(now_s() - t_now);
                    if failed {
                        stats.errors += 1;
                    }
                }
            }

            // Consecutive-failure supervision.
            let runtime = &comp.runtime;
            if failed {
                let fails = runtime.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
                if fails == DISCONNECT_AFTER_FAILS {
                    runtime.connected.store(false, Ordering::Relaxed);
                    emit_event(
                        &ctx.bus,
                        &comp.id,
                        format!("{} consecutive failed cycles; device disconnected", fails),
                        Severity::Fault,
                    )
                    .await;
                }
            } else {
                runtime.consecutive_fails.store(0, Ordering::Relaxed);
                if !runtime.connected.swap(true, Ordering::Relaxed) && comp.heartbeat.is_none() {
                    emit_event(
                        &ctx.bus,
                        &comp.id,
                        "device reconnected".to_string(),
                        Severity::Info,
                    )
                    .await;
                }
            }
        }

        // Let the scheduler fire the next cycle.
        if let Some(gate) = ctx.gates.get(key) {
            gate.release();
            ctx.sched.kick();
        }
    } else if key.starts_with("set_") {
        let replyto = works.iter().find_map(|w| w.replyto.clone());
        if let Some(replyto) = replyto {
            let status = if failed { "Failed" } else { "Success" };
            let body = json!({"gcom": "Modbus Set", "status": status});
            if let Err(e) = ctx.bus.send_set(&replyto, body.to_string()).await {
                tlog!("[Collator] set reply on {} failed: {}", replyto, e);
            }
        }
    } else if key.starts_with("get_") {
        let replyto = works.iter().find_map(|w| w.replyto.clone());
        let body = assemble_body(&ctx.cfg, &mut works);
        if let Some(replyto) = replyto {
            if let Err(e) = ctx.bus.send_set(&replyto, body.to_string()).await {
                tlog!("[Collator] get reply on {} failed: {}", replyto, e);
            }
        }
    }

    works
}

/// Handle a one-shot item (no group key): decode and reply directly.
async fn complete_one_shot(ctx: &CollatorCtx, mut work: Box<IoWork>) -> Box<IoWork> {
    if let Some(replyto) = work.replyto.take() {
        if work.wtype.is_set() {
            let status = if work.errno_code != 0 { "Failed" } else { "Success" };
            let body = json!({"gcom": "Modbus Set", "status": status});
            if let Err(e) = ctx.bus.send_set(&replyto, body.to_string()).await {
                tlog!("[Collator] one-shot set reply failed: {}", e);
            }
        } else {
            let mut body = serde_json::Map::new();
            decode_work_into(&ctx.cfg, &work, &mut body);
            let body = serde_json::Value::Object(body);
            if let Err(e) = ctx.bus.send_set(&replyto, body.to_string()).await {
                tlog!("[Collator] one-shot get reply failed: {}", e);
            }
        }
    } else if work.wtype.is_set() {
        // Write with nobody waiting: decode into the caches all the same so
        // local state tracks the device.
        let mut scratch = serde_json::Map::new();
        decode_work_into(&ctx.cfg, &work, &mut scratch);
    }
    work
}

// ============================================================================
// Collator task
// ============================================================================

/// Run the collator until the stop flag is set. Partial groups are returned
/// to the pool on shutdown.
pub async fn run(ctx: CollatorCtx, channels: IoChannels) {
    tlog!("[Collator] Started");
    let mut groups: HashMap<String, CollatorGroup> = HashMap::new();

    loop {
        if channels.stopped() {
            break;
        }

        let work = {
            let mut rx = channels.response_rx.lock().await;
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(work)) => work,
            }
        };

        if work.work_name.is_empty() {
            let work = complete_one_shot(&ctx, work).await;
            channels.pool.put(work);
            continue;
        }

        let key = work.work_name.clone();
        let entry = groups.entry(key.clone()).or_insert_with(|| CollatorGroup {
            t_now: work.t_now,
            expected: work.work_group,
            works: Vec::new(),
        });

        if work.t_now < entry.t_now {
            // Stale item from an abandoned cycle.
            channels.pool.put(work);
            continue;
        }
        if work.t_now > entry.t_now {
            // A newer cycle started; discard the old partial group.
            tlog!(
                "[Collator] Discarding partial group {} ({} of {})",
                key,
                entry.works.len(),
                entry.expected
            );
            for old in entry.works.drain(..) {
                channels.pool.put(old);
            }
            entry.t_now = work.t_now;
            entry.expected = work.work_group;
        }

        entry.works.push(work);

        if entry.works.len() as u32 >= entry.expected {
            let works = std::mem::take(&mut entry.works);
            let t_now = entry.t_now;
            let erase = works.iter().any(|w| w.erase_group);
            let recycled = complete_group(&ctx, &key, works, t_now).await;
            for work in recycled {
                channels.pool.put(work);
            }
            // Pub groups keep their (now empty) entry for the next cycle;
            // set/get groups and explicit erasures drop theirs.
            if erase || !key.starts_with("pub_") {
                groups.remove(&key);
            }
        }
    }

    // Shutdown: recycle any partial groups.
    for (_, group) in groups.drain() {
        for work in group.works {
            channels.pool.put(work);
        }
    }
    tlog!("[Collator] Stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::client::{connect, BusReader};
    use crate::bus::Method;
    use crate::config::model::{CompId, GroupId, PointId};
    use crate::config::{build, GatewayFile};
    use crate::io::{batcher, WorkType};
    use std::sync::atomic::AtomicBool;
    use tokio::net::TcpListener;

    fn test_cfg() -> Arc<Cfg> {
        let v = serde_json::json!({
            "connection": {"name": "test", "ip_address": "127.0.0.1"},
            "components": [
                {
                    "id": "bms",
                    "frequency": 1000,
                    "registers": [
                        {
                            "type": "holding",
                            "starting_offset": 100,
                            "number_of_registers": 4,
                            "map": [
                                {"id": "temp", "offset": 100, "size": 1, "signed": true, "scale": 10.0},
                                {"id": "soc", "offset": 101, "size": 2, "float": true}
                            ]
                        }
                    ]
                }
            ]
        });
        let file: GatewayFile = serde_json::from_value(v).unwrap();
        Arc::new(build(file).unwrap())
    }

    /// Bus endpoint capturing frames sent by the collator.
    async fn bus_pair() -> (BusWriter, BusReader) {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            stream.into_split().0
        });
        let (writer, _own_reader) = connect(&addr, "modgate-test", &[]).await.unwrap();
        let read_half = accept.await.unwrap();
        (writer, BusReader::from_read_half(read_half))
    }

    fn ctx_for(cfg: Arc<Cfg>, bus: BusWriter) -> CollatorCtx {
        let stop = Arc::new(AtomicBool::new(false));
        CollatorCtx {
            cfg,
            bus,
            sched: Scheduler::new(stop),
            gates: HashMap::new(),
        }
    }

    fn pub_work(cfg: &Cfg, pool: &crate::io::WorkPool, t_now: f64) -> Box<IoWork> {
        let mut works = batcher::build_pub_works(cfg, CompId(0), t_now, pool);
        assert_eq!(works.len(), 1);
        let mut work = works.pop().unwrap();
        // temp = −100 raw, soc = pi as f32
        work.buf16[0] = 0xFF9C;
        work.buf16[1] = 0x4049;
        work.buf16[2] = 0x0FDB;
        work
    }

    #[tokio::test]
    async fn test_pub_group_completion_emits_body() {
        let cfg = test_cfg();
        let (writer, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let ctx = ctx_for(cfg.clone(), writer);

        let task = tokio::spawn(run(ctx, channels.clone()));

        // subscription frame from connect()
        let sub = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(sub.uri, "/_subscribe");

        let work = pub_work(&cfg, &channels.pool, 1.0);
        channels.response_tx.send(work).await.unwrap();

        let published = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(published.method, Method::Pub);
        assert_eq!(published.uri, "/components/bms");
        let body = published.body_json().unwrap();
        assert_eq!(body["temp"], serde_json::json!(-10.0));
        let soc = body["soc"].as_f64().unwrap();
        assert!((soc - std::f32::consts::PI as f64).abs() < 1e-6);
        // decode order follows the batcher enumeration
        let keys: Vec<_> = body.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["temp", "soc"]);

        // runtime caches updated
        let temp = cfg.find_point("bms", "temp").unwrap();
        assert_eq!(temp.runtime.lock().unwrap().last_raw, 0xFF9C);

        channels.request_stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_stale_item_dropped_and_fresh_group_restarts() {
        let cfg = test_cfg();
        let (writer, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let ctx = ctx_for(cfg.clone(), writer);
        let task = tokio::spawn(run(ctx, channels.clone()));
        let _sub = reader.read_frame().await.unwrap().unwrap();

        // A two-item group where only one item ever arrives at t=2.0 …
        let mut first = pub_work(&cfg, &channels.pool, 2.0);
        first.work_group = 2;
        channels.response_tx.send(first).await.unwrap();

        // … a stale straggler from t=1.0 must be ignored …
        let mut stale = pub_work(&cfg, &channels.pool, 1.0);
        stale.work_group = 2;
        channels.response_tx.send(stale).await.unwrap();

        // … and a fresh cycle at t=3.0 replaces the partial group entirely.
        let fresh = pub_work(&cfg, &channels.pool, 3.0);
        channels.response_tx.send(fresh).await.unwrap();

        let published = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(published.method, Method::Pub);
        assert_eq!(published.body_json().unwrap()["temp"], serde_json::json!(-10.0));

        channels.request_stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_failed_work_publishes_stale_values() {
        let cfg = test_cfg();
        let (writer, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let ctx = ctx_for(cfg.clone(), writer);
        let task = tokio::spawn(run(ctx, channels.clone()));
        let _sub = reader.read_frame().await.unwrap().unwrap();

        // Cycle 1 succeeds and caches values.
        let work = pub_work(&cfg, &channels.pool, 1.0);
        channels.response_tx.send(work).await.unwrap();
        let first = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(first.body_json().unwrap()["temp"], serde_json::json!(-10.0));

        // Cycle 2 fails on the wire: body still carries the cached values.
        let mut failed = pub_work(&cfg, &channels.pool, 2.0);
        failed.buf16.fill(0);
        failed.errno_code = 110;
        channels.response_tx.send(failed).await.unwrap();
        let second = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(second.body_json().unwrap()["temp"], serde_json::json!(-10.0));

        channels.request_stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_set_group_replies_status() {
        let cfg = test_cfg();
        let (writer, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let ctx = ctx_for(cfg.clone(), writer);
        let task = tokio::spawn(run(ctx, channels.clone()));
        let _sub = reader.read_frame().await.unwrap().unwrap();

        let temp = cfg.find_point("bms", "temp").unwrap();
        let mut work = batcher::build_set_work(&cfg, temp, &crate::codec::Value::F64(-10.0), &channels.pool, false);
        work.work_name = "set_components_bms".to_string();
        work.work_id = 0;
        work.work_group = 1;
        work.t_now = 5.0;
        work.replyto = Some("/reply/77".to_string());
        assert_eq!(work.wtype, WorkType::Set);
        channels.response_tx.send(work).await.unwrap();

        let reply = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.method, Method::Set);
        assert_eq!(reply.uri, "/reply/77");
        let body = reply.body_json().unwrap();
        assert_eq!(body["gcom"], "Modbus Set");
        assert_eq!(body["status"], "Success");

        channels.request_stop();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_one_shot_get_replies_with_body() {
        let cfg = test_cfg();
        let (writer, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let ctx = ctx_for(cfg.clone(), writer);
        let task = tokio::spawn(run(ctx, channels.clone()));
        let _sub = reader.read_frame().await.unwrap().unwrap();

        // Prime the cache.
        let temp = cfg.find_point("bms", "temp").unwrap();
        temp.runtime.lock().unwrap().cache = [0xFF9C, 0, 0, 0];

        let mut work = channels.pool.take();
        work.reg_type = temp.reg_type;
        work.wtype = WorkType::Get;
        work.offset = temp.offset;
        work.num_registers = 1;
        work.local = true;
        work.points.push(PointId(0));
        work.group = Some(GroupId(0));
        work.comp = Some(CompId(0));
        work.buf16[0] = 0xFF9C;
        work.replyto = Some("/reply/9".to_string());
        channels.response_tx.send(work).await.unwrap();

        let reply = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.uri, "/reply/9");
        assert_eq!(reply.body_json().unwrap()["temp"], serde_json::json!(-10.0));

        channels.request_stop();
        let _ = task.await;
    }
}
