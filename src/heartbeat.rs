// src/heartbeat.rs
//
// Heartbeat supervision. One task per heartbeat-enabled component: on every
// interval it compares the heartbeat read point against the last observed
// value. A value frozen for longer than the component timeout posts a
// disconnect event; any change resets the clock and, after a disconnect,
// posts a reconnect event. When a write point is configured it is stepped
// to last_read + 1 each tick so the device sees the gateway alive too.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{interval, Duration};

use crate::bus::client::BusWriter;
use crate::codec::Value;
use crate::config::model::{Cfg, CompId};
use crate::events::{emit_event, Severity};
use crate::io::{batcher, now_s, IoChannels};

/// Spawn heartbeat tasks for every component that configures one.
pub fn spawn_all(
    cfg: &Arc<Cfg>,
    channels: &IoChannels,
    bus: &BusWriter,
) -> Vec<tokio::task::JoinHandle<()>> {
    cfg.components
        .iter()
        .filter(|comp| comp.heartbeat.is_some())
        .map(|comp| {
            tokio::spawn(run(
                cfg.clone(),
                comp.idx,
                channels.clone(),
                bus.clone(),
            ))
        })
        .collect()
}

async fn run(cfg: Arc<Cfg>, comp_id: CompId, channels: IoChannels, bus: BusWriter) {
    let comp = cfg.comp(comp_id);
    let hb = match &comp.heartbeat {
        Some(hb) => hb,
        None => return,
    };
    let read_point = cfg.point(hb.read_point);
    let timeout_s = hb.timeout_ms as f64 / 1000.0;

    let mut timer = interval(Duration::from_millis(hb.freq_ms.max(1)));
    let mut last_observed: u64 = read_point.runtime.lock().map(|r| r.last_raw).unwrap_or(0);
    let mut last_change = now_s();

    tlog!(
        "[Heartbeat:{}] Started: read '{}' every {} ms, timeout {} ms",
        comp.id,
        read_point.id,
        hb.freq_ms,
        hb.timeout_ms
    );

    loop {
        timer.tick().await;
        if channels.stopped() {
            break;
        }

        let now = now_s();
        let current = read_point.runtime.lock().map(|r| r.last_raw).unwrap_or(0);

        if current != last_observed {
            last_observed = current;
            last_change = now;
            if !comp.runtime.connected.swap(true, Ordering::Relaxed) {
                comp.runtime.consecutive_fails.store(0, Ordering::Relaxed);
                emit_event(
                    &bus,
                    &comp.id,
                    "heartbeat resumed; device reconnected".to_string(),
                    Severity::Info,
                )
                .await;
                tlog!("[Heartbeat:{}] Reconnected", comp.id);
            }
        } else if now - last_change > timeout_s
            && comp.runtime.connected.swap(false, Ordering::Relaxed)
        {
            emit_event(
                &bus,
                &comp.id,
                format!(
                    "heartbeat value unchanged for {:.0} ms; device disconnected",
                    (now - last_change) * 1000.0
                ),
                Severity::Fault,
            )
            .await;
            tlog!("[Heartbeat:{}] Disconnected", comp.id);
        }

        // Step the write point so the device sees us alive.
        if let Some(write_pid) = hb.write_point {
            let write_point = cfg.point(write_pid);
            let next = current.wrapping_add(1);
            let work =
                batcher::build_set_work(&cfg, write_point, &Value::U64(next), &channels.pool, false);
            if channels.set_tx.send(work).await.is_err() {
                break;
            }
        }
    }

    tlog!("[Heartbeat:{}] Stopped", comp.id);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::client::{connect, BusReader};
    use crate::bus::Method;
    use crate::config::{build, GatewayFile};
    use tokio::net::TcpListener;

    fn hb_cfg() -> Arc<Cfg> {
        let v = serde_json::json!({
            "connection": {"name": "test", "ip_address": "127.0.0.1"},
            "components": [
                {
                    "id": "bms",
                    "frequency": 1000,
                    "heartbeat_enabled": true,
                    "modbus_heartbeat_freq_ms": 20,
                    "component_heartbeat_timeout_ms": 60,
                    "component_heartbeat_read_uri": "hb_in",
                    "component_heartbeat_write_uri": "hb_out",
                    "registers": [
                        {
                            "type": "holding",
                            "starting_offset": 0,
                            "number_of_registers": 2,
                            "map": [
                                {"id": "hb_in", "offset": 0, "size": 1},
                                {"id": "hb_out", "offset": 1, "size": 1}
                            ]
                        }
                    ]
                }
            ]
        });
        let file: GatewayFile = serde_json::from_value(v).unwrap();
        Arc::new(build(file).unwrap())
    }

    async fn bus_pair() -> (BusWriter, BusReader) {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            stream.into_split().0
        });
        let (writer, _own) = connect(&addr, "modgate-test", &[]).await.unwrap();
        let read_half = accept.await.unwrap();
        (writer, BusReader::from_read_half(read_half))
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_events() {
        let cfg = hb_cfg();
        let (bus, mut reader) = bus_pair().await;
        let channels = IoChannels::new();
        let handles = spawn_all(&cfg, &channels, &bus);
        assert_eq!(handles.len(), 1);

        let _sub = reader.read_frame().await.unwrap().unwrap();

        // Value never changes → a disconnect event must post.
        let disconnect = loop {
            match reader.read_frame().await.unwrap() {
                Some(msg) if msg.uri == "/events" => break msg,
                Some(_) => continue,
                None => panic!("timed out waiting for event"),
            }
        };
        assert_eq!(disconnect.method, Method::Post);
        let body = disconnect.body_json().unwrap();
        assert_eq!(body["source"], "bms");
        assert_eq!(body["severity"], "fault");

        // Change the heartbeat value → reconnect event.
        let hb_in = cfg.find_point("bms", "hb_in").unwrap();
        hb_in.runtime.lock().unwrap().last_raw = 42;

        let reconnect = loop {
            match reader.read_frame().await.unwrap() {
                Some(msg) if msg.uri == "/events" => break msg,
                Some(_) => continue,
                None => panic!("timed out waiting for event"),
            }
        };
        let body = reconnect.body_json().unwrap();
        assert_eq!(body["severity"], "info");

        channels.request_stop();
        for h in handles {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn test_write_point_steps_last_read_plus_one() {
        let cfg = hb_cfg();
        let (bus, _reader) = bus_pair().await;
        let channels = IoChannels::new();

        let hb_in = cfg.find_point("bms", "hb_in").unwrap();
        hb_in.runtime.lock().unwrap().last_raw = 7;

        let handles = spawn_all(&cfg, &channels, &bus);

        let work = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(w) = channels.set_rx.lock().await.try_recv() {
                    break w;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat write work");

        assert_eq!(work.offset, 1);
        assert_eq!(work.buf16[0], 8);

        channels.request_stop();
        for h in handles {
            let _ = h.await;
        }
    }
}
