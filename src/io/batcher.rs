// src/io/batcher.rs
//
// Turns a triggered publication (or an inbound set/get) into work items.
// For reads, each register group contributes one wire request per
// contiguous run of readable registers, capped at the Modbus per-request
// maximum and routed around offsets the device has rejected. All items of
// one trigger share a work_name and tNow and are numbered work_id
// 0..work_group.

use crate::codec::{self, Value};
use crate::config::model::{Cfg, CompId, IoPoint, PointId, RegGroup, RegisterType};

use super::{IoWork, WorkPool, WorkType};

// ============================================================================
// Read batching
// ============================================================================

/// One planned wire read: start offset, register count, contained points.
#[derive(Debug, PartialEq)]
pub struct ReadSegment {
    pub start: u16,
    pub count: u16,
    pub points: Vec<PointId>,
}

/// Plan the wire reads for one register group, skipping bad registers and
/// disabled points, honoring the per-request maximum, and never splitting a
/// point across two requests.
pub fn plan_group_reads(cfg: &Cfg, group: &RegGroup) -> Vec<ReadSegment> {
    let max = group.reg_type.max_per_request();

    // Offsets excluded from reads: device-rejected registers plus the spans
    // of disabled points.
    let bad: Vec<u16> = group
        .runtime
        .lock()
        .map(|r| r.bad_regs.clone())
        .unwrap_or_default();
    let mut blocked = vec![false; group.number_of_registers as usize];
    for &off in &bad {
        if off >= group.starting_offset && off < group.end_offset() {
            blocked[(off - group.starting_offset) as usize] = true;
        }
    }
    for &pid in &group.points {
        let point = cfg.point(pid);
        let enabled = point.runtime.lock().map(|r| r.is_enabled).unwrap_or(true);
        if !enabled {
            for off in point.offset..point.offset + point.size as u16 {
                if off >= group.starting_offset && off < group.end_offset() {
                    blocked[(off - group.starting_offset) as usize] = true;
                }
            }
        }
    }

    // Contiguous unblocked runs.
    let mut runs: Vec<(u16, u16)> = Vec::new();
    let mut run_start: Option<u16> = None;
    for i in 0..blocked.len() {
        let off = group.starting_offset + i as u16;
        if blocked[i] {
            if let Some(start) = run_start.take() {
                runs.push((start, off - start));
            }
        } else if run_start.is_none() {
            run_start = Some(off);
        }
    }
    if let Some(start) = run_start {
        runs.push((start, group.end_offset() - start));
    }

    // Chunk runs at the wire maximum without cutting a point in half.
    let mut segments = Vec::new();
    for (start, count) in runs {
        let mut at = start;
        let end = start + count;
        while at < end {
            let mut seg_end = end.min(at + max);
            if seg_end < end {
                // If a point straddles the cut, back the cut up to its start.
                if let Some(pid) = group.point_at(seg_end - 1, &cfg.points) {
                    let p = cfg.point(pid);
                    if p.offset < seg_end && p.offset + p.size as u16 > seg_end && p.offset > at {
                        seg_end = p.offset;
                    }
                }
            }
            let points: Vec<PointId> = group
                .points
                .iter()
                .copied()
                .filter(|&pid| {
                    let p = cfg.point(pid);
                    let enabled = p.runtime.lock().map(|r| r.is_enabled).unwrap_or(true);
                    enabled && p.offset >= at && p.offset + p.size as u16 <= seg_end
                })
                .collect();
            segments.push(ReadSegment {
                start: at,
                count: seg_end - at,
                points,
            });
            at = seg_end;
        }
    }
    segments
}

/// Read work type for a register class.
fn read_wtype(reg_type: RegisterType, multi: bool) -> WorkType {
    match (reg_type.is_bit_type(), multi) {
        (false, false) => WorkType::Get,
        (false, true) => WorkType::GetMulti,
        (true, false) => WorkType::BitGet,
        (true, true) => WorkType::BitGetMulti,
    }
}

/// Build the work items for one publication trigger. Items go to the poll
/// channel; the collator reassembles them under `work_name` at `t_now`.
pub fn build_pub_works(cfg: &Cfg, comp_id: CompId, t_now: f64, pool: &WorkPool) -> Vec<Box<IoWork>> {
    build_read_works(cfg, comp_id, t_now, pool, cfg.pub_name(comp_id), false, None, false)
}

/// Build local (cache) read works for a bus get, replying on `replyto`.
pub fn build_get_works(
    cfg: &Cfg,
    comp_id: CompId,
    t_now: f64,
    pool: &WorkPool,
    replyto: String,
    raw_mode: bool,
) -> Vec<Box<IoWork>> {
    let comp = cfg.comp(comp_id);
    let name = format!("get_{}_{}", cfg.base_uri, comp.id);
    build_read_works(cfg, comp_id, t_now, pool, name, true, Some(replyto), raw_mode)
}

#[allow(clippy::too_many_arguments)]
fn build_read_works(
    cfg: &Cfg,
    comp_id: CompId,
    t_now: f64,
    pool: &WorkPool,
    work_name: String,
    local: bool,
    replyto: Option<String>,
    raw_mode: bool,
) -> Vec<Box<IoWork>> {
    let comp = cfg.comp(comp_id);
    let mut works: Vec<Box<IoWork>> = Vec::new();

    for &gid in &comp.groups {
        let group = cfg.group(gid);
        if !group.enabled {
            continue;
        }
        for segment in plan_group_reads(cfg, group) {
            let mut work = pool.take();
            work.work_name = work_name.clone();
            work.t_now = t_now;
            work.device_id = group.device_id;
            work.reg_type = group.reg_type;
            work.wtype = read_wtype(group.reg_type, segment.count > 1);
            work.offset = segment.start;
            work.num_registers = segment.count;
            work.off_by_one = cfg.connection.off_by_one;
            work.local = local;
            work.points = segment.points;
            work.group = Some(gid);
            work.comp = Some(comp_id);
            work.replyto = replyto.clone();
            work.raw_mode = raw_mode;
            works.push(work);
        }
    }

    let total = works.len() as u32;
    for (i, work) in works.iter_mut().enumerate() {
        work.work_id = i as u32;
        work.work_group = total;
    }
    works
}

// ============================================================================
// Set batching
// ============================================================================

/// Build one set work item for a point. The encoded registers (or coil
/// state) are staged in the buffers; `local` additionally updates the shadow
/// cache without touching the wire.
pub fn build_set_work(
    cfg: &Cfg,
    point: &IoPoint,
    value: &Value,
    pool: &WorkPool,
    local: bool,
) -> Box<IoWork> {
    let mut work = pool.take();
    work.device_id = point.device_id;
    work.reg_type = point.reg_type;
    work.offset = point.offset;
    work.off_by_one = cfg.connection.off_by_one;
    work.local = local;
    work.points.push(point.idx);
    work.group = Some(point.group);
    work.comp = Some(point.comp);

    if point.reg_type.is_bit_type() {
        work.wtype = WorkType::BitSet;
        work.num_registers = 1;
        work.buf8[0] = codec::encode_bit(&point.codec, value) as u8;
    } else {
        work.num_registers = point.size as u16;
        work.wtype = if point.size > 1 {
            WorkType::SetMulti
        } else {
            WorkType::Set
        };
        let regs = codec::encode_registers(&point.codec, value);
        work.buf16[..point.size as usize].copy_from_slice(&regs[..point.size as usize]);
    }
    work
}

/// Merge adjacent single-group set works into bulk writes when the
/// connection allows multi-register sets. Works must target the same group
/// and be contiguous; anything else passes through untouched.
pub fn merge_set_works(cfg: &Cfg, mut works: Vec<Box<IoWork>>) -> Vec<Box<IoWork>> {
    if !cfg.connection.allow_multi_sets || works.len() < 2 {
        return works;
    }
    works.sort_by_key(|w| (w.group.map(|g| g.0), w.offset));

    let mut merged: Vec<Box<IoWork>> = Vec::new();
    for work in works {
        let absorb = match merged.last() {
            Some(prev) => {
                prev.group == work.group
                    && !prev.reg_type.is_bit_type()
                    && prev.wtype.is_set()
                    && work.wtype.is_set()
                    && prev.offset + prev.num_registers == work.offset
                    && (prev.num_registers + work.num_registers)
                        <= prev.reg_type.max_per_request()
            }
            None => false,
        };
        if absorb {
            let prev = merged.last_mut().expect("checked non-empty");
            let at = prev.num_registers as usize;
            let n = work.num_registers as usize;
            prev.buf16[at..at + n].copy_from_slice(&work.buf16[..n]);
            prev.num_registers += work.num_registers;
            prev.wtype = WorkType::SetMulti;
            prev.points.extend(work.points.iter().copied());
        } else {
            merged.push(work);
        }
    }
    merged
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build, GatewayFile};

    fn wide_config(number_of_registers: u16) -> Cfg {
        let v = serde_json::json!({
            "connection": {
                "name": "test",
                "ip_address": "127.0.0.1",
                "allow_multi_sets": true
            },
            "components": [
                {
                    "id": "pcs",
                    "frequency": 500,
                    "registers": [
                        {
                            "type": "holding",
                            "starting_offset": 0,
                            "number_of_registers": number_of_registers,
                            "map": [
                                {"id": "a", "offset": 0, "size": 2},
                                {"id": "b", "offset": 2, "size": 1},
                                {"id": "c", "offset": 10, "size": 4}
                            ]
                        }
                    ]
                }
            ]
        });
        let file: GatewayFile = serde_json::from_value(v).unwrap();
        build(file).unwrap()
    }

    #[test]
    fn test_single_segment_group() {
        let cfg = wide_config(20);
        let group = &cfg.groups[0];
        let segments = plan_group_reads(&cfg, group);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].count, 20);
        assert_eq!(segments[0].points.len(), 3);
    }

    #[test]
    fn test_wire_maximum_split() {
        let cfg = wide_config(300);
        let group = &cfg.groups[0];
        let segments = plan_group_reads(&cfg, group);
        assert!(segments.len() >= 3);
        assert!(segments.iter().all(|s| s.count <= 125));
        let total: u16 = segments.iter().map(|s| s.count).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn test_bad_registers_routed_around() {
        let cfg = wide_config(20);
        let group = &cfg.groups[0];
        group.runtime.lock().unwrap().bad_regs.push(5);
        let segments = plan_group_reads(&cfg, group);
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start, segments[0].count), (0, 5));
        assert_eq!((segments[1].start, segments[1].count), (6, 14));
        // c (10..14) falls in the second segment
        assert_eq!(segments[1].points.len(), 1);
    }

    #[test]
    fn test_disabled_point_skipped() {
        let cfg = wide_config(20);
        let b = cfg.find_point("pcs", "b").unwrap();
        b.runtime.lock().unwrap().is_enabled = false;
        let group = &cfg.groups[0];
        let segments = plan_group_reads(&cfg, group);
        // b occupies offset 2 → two runs: 0..2 and 3..20
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start, segments[0].count), (0, 2));
        assert_eq!((segments[1].start, segments[1].count), (3, 17));
        assert!(segments.iter().all(|s| s
            .points
            .iter()
            .all(|&p| cfg.point(p).id != "b")));
    }

    #[test]
    fn test_pub_works_numbering() {
        let cfg = wide_config(300);
        let pool = WorkPool::new(8);
        let works = build_pub_works(&cfg, crate::config::model::CompId(0), 1.5, &pool);
        let n = works.len() as u32;
        assert!(n >= 3);
        for (i, w) in works.iter().enumerate() {
            assert_eq!(w.work_id, i as u32);
            assert_eq!(w.work_group, n);
            assert_eq!(w.t_now, 1.5);
            assert_eq!(w.work_name, "pub_components_pcs");
            assert!(!w.local);
        }
    }

    #[test]
    fn test_get_works_are_local_with_replyto() {
        let cfg = wide_config(20);
        let pool = WorkPool::new(8);
        let works = build_get_works(
            &cfg,
            crate::config::model::CompId(0),
            2.0,
            &pool,
            "/reply/1".to_string(),
            true,
        );
        assert_eq!(works.len(), 1);
        assert!(works[0].local);
        assert!(works[0].raw_mode);
        assert_eq!(works[0].replyto.as_deref(), Some("/reply/1"));
        assert_eq!(works[0].work_name, "get_components_pcs");
    }

    #[test]
    fn test_set_work_encodes_registers() {
        let cfg = wide_config(20);
        let a = cfg.find_point("pcs", "a").unwrap();
        let pool = WorkPool::new(8);
        let work = build_set_work(&cfg, a, &Value::U64(0x12345), &pool, false);
        assert_eq!(work.wtype, WorkType::SetMulti);
        assert_eq!(work.num_registers, 2);
        assert_eq!(work.buf16[0], 0x0001);
        assert_eq!(work.buf16[1], 0x2345);
    }

    #[test]
    fn test_merge_adjacent_set_works() {
        let cfg = wide_config(20);
        let pool = WorkPool::new(8);
        let a = cfg.find_point("pcs", "a").unwrap();
        let b = cfg.find_point("pcs", "b").unwrap();
        let works = vec![
            build_set_work(&cfg, b, &Value::U64(7), &pool, false),
            build_set_work(&cfg, a, &Value::U64(1), &pool, false),
        ];
        let merged = merge_set_works(&cfg, works);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].offset, 0);
        assert_eq!(merged[0].num_registers, 3);
        assert_eq!(merged[0].wtype, WorkType::SetMulti);
        assert_eq!(merged[0].buf16[2], 7);
        assert_eq!(merged[0].points.len(), 2);
    }

    #[test]
    fn test_merge_respects_gaps() {
        let cfg = wide_config(20);
        let pool = WorkPool::new(8);
        let a = cfg.find_point("pcs", "a").unwrap();
        let c = cfg.find_point("pcs", "c").unwrap();
        let works = vec![
            build_set_work(&cfg, a, &Value::U64(1), &pool, false),
            build_set_work(&cfg, c, &Value::U64(2), &pool, false),
        ];
        let merged = merge_set_works(&cfg, works);
        assert_eq!(merged.len(), 2);
    }
}
