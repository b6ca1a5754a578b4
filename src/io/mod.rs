// src/io/mod.rs
//
// I/O engine plumbing shared by the batcher, workers and collator: the work
// item that travels a wire request through the system, the channel set that
// carries it, and the pool that recycles items instead of freeing them.

pub mod batcher;
pub mod collator;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::model::{CompId, GroupId, PointId, RegisterType};

// ============================================================================
// Time base
// ============================================================================

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since process start. Used for group timestamps,
/// debounce windows and timing marks.
pub fn now_s() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Current time in microseconds since UNIX epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Work items
// ============================================================================

/// Operation class of a work item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkType {
    #[default]
    Noop,
    Get,
    GetMulti,
    Set,
    SetMulti,
    BitGet,
    BitGetMulti,
    BitSet,
    BitSetMulti,
}

impl WorkType {
    pub fn is_set(&self) -> bool {
        matches!(
            self,
            WorkType::Set | WorkType::SetMulti | WorkType::BitSet | WorkType::BitSetMulti
        )
    }
}

/// Buffer capacity in registers / bits. Modbus caps a single request at 125
/// registers or 2000 bits, so 256 words is comfortably above any one wire op.
pub const WORK_BUF_LEN: usize = 256;

/// One wire request plus its response buffers and metadata. Owned by exactly
/// one channel or worker at a time, recycled through the pool.
#[derive(Clone)]
pub struct IoWork {
    /// Collator group key, e.g. `pub_components_bms`. Empty for one-shot
    /// items that reply directly.
    pub work_name: String,
    /// Index within the group, `0..work_group`.
    pub work_id: u32,
    /// Group cardinality.
    pub work_group: u32,
    /// Group timestamp, monotonic seconds.
    pub t_now: f64,
    pub device_id: u8,
    pub reg_type: RegisterType,
    pub wtype: WorkType,
    /// Absolute register offset of this request.
    pub offset: u16,
    pub num_registers: u16,
    /// Subtract one from the wire offset (1-based device maps).
    pub off_by_one: bool,
    /// Operate on the in-memory point caches instead of the wire.
    pub local: bool,
    /// Offsets known bad inside this range; reads route around them.
    pub disabled_registers: Vec<u16>,
    /// Register data (reads fill it, writes carry it).
    pub buf16: Box<[u16; WORK_BUF_LEN]>,
    /// Bit data for coil / discrete operations.
    pub buf8: Box<[u8; WORK_BUF_LEN]>,
    /// The points contained in this request, in offset order.
    pub points: Vec<PointId>,
    pub group: Option<GroupId>,
    pub comp: Option<CompId>,
    // Timing marks, monotonic seconds.
    pub t_start: f64,
    pub t_io: f64,
    pub t_done: f64,
    pub t_receive: f64,
    pub t_run: f64,
    pub connect_time: f64,
    /// Retry count consumed by this item.
    pub errors: u32,
    /// errno-style failure code; 0 = success.
    pub errno_code: i32,
    /// Reply-to uri for set/get responses.
    pub replyto: Option<String>,
    /// Drop the collator group entry once this group completes.
    pub erase_group: bool,
    /// Format the response with hex/binary wrappers.
    pub raw_mode: bool,
}

impl Default for IoWork {
    fn default() -> Self {
        Self {
            work_name: String::new(),
            work_id: 0,
            work_group: 0,
            t_now: 0.0,
            device_id: 0,
            reg_type: RegisterType::Holding,
            wtype: WorkType::Noop,
            offset: 0,
            num_registers: 0,
            off_by_one: false,
            local: false,
            disabled_registers: Vec::new(),
            buf16: Box::new([0; WORK_BUF_LEN]),
            buf8: Box::new([0; WORK_BUF_LEN]),
            points: Vec::new(),
            group: None,
            comp: None,
            t_start: 0.0,
            t_io: 0.0,
            t_done: 0.0,
            t_receive: 0.0,
            t_run: 0.0,
            connect_time: 0.0,
            errors: 0,
            errno_code: 0,
            replyto: None,
            erase_group: false,
            raw_mode: false,
        }
    }
}

impl IoWork {
    /// Fully reset a recycled item before it re-enters circulation: buffers
    /// zeroed, back-references and error state cleared.
    pub fn reset_for_reuse(&mut self) {
        self.work_name.clear();
        self.work_id = 0;
        self.work_group = 0;
        self.t_now = 0.0;
        self.device_id = 0;
        self.reg_type = RegisterType::Holding;
        self.wtype = WorkType::Noop;
        self.offset = 0;
        self.num_registers = 0;
        self.off_by_one = false;
        self.local = false;
        self.disabled_registers.clear();
        self.buf16.fill(0);
        self.buf8.fill(0);
        self.points.clear();
        self.group = None;
        self.comp = None;
        self.t_start = 0.0;
        self.t_io = 0.0;
        self.t_done = 0.0;
        self.t_receive = 0.0;
        self.t_run = 0.0;
        self.connect_time = 0.0;
        self.errors = 0;
        self.errno_code = 0;
        self.replyto = None;
        self.erase_group = false;
        self.raw_mode = false;
    }

    /// The wire offset for this request.
    pub fn wire_offset(&self) -> u16 {
        if self.off_by_one {
            self.offset.saturating_sub(1)
        } else {
            self.offset
        }
    }
}

// ============================================================================
// Work-item pool
// ============================================================================

/// Fixed-capacity recycling pool for work items. `take` prefers a recycled
/// item and falls back to allocation; `put` resets the item and drops it if
/// the pool is full.
#[derive(Clone)]
pub struct WorkPool {
    tx: mpsc::Sender<Box<IoWork>>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Box<IoWork>>>>,
}

impl WorkPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }

    pub fn take(&self) -> Box<IoWork> {
        if let Ok(mut rx) = self.rx.try_lock() {
            if let Ok(work) = rx.try_recv() {
                return work;
            }
        }
        Box::new(IoWork::default())
    }

    pub fn put(&self, mut work: Box<IoWork>) {
        work.reset_for_reuse();
        // Pool full → the item is simply dropped.
        let _ = self.tx.try_send(work);
    }
}

// ============================================================================
// Channel set
// ============================================================================

/// Channel capacity for poll/set/response queues.
pub const CHANNEL_DEPTH: usize = 512;

/// The channels wiring the batcher, workers and collator together, plus the
/// shared stop flag every loop observes within 100 ms.
#[derive(Clone)]
pub struct IoChannels {
    pub poll_tx: mpsc::Sender<Box<IoWork>>,
    pub poll_rx: Arc<AsyncMutex<mpsc::Receiver<Box<IoWork>>>>,
    pub set_tx: mpsc::Sender<Box<IoWork>>,
    pub set_rx: Arc<AsyncMutex<mpsc::Receiver<Box<IoWork>>>>,
    pub response_tx: mpsc::Sender<Box<IoWork>>,
    pub response_rx: Arc<AsyncMutex<mpsc::Receiver<Box<IoWork>>>>,
    pub pool: WorkPool,
    pub stop: Arc<AtomicBool>,
}

impl IoChannels {
    pub fn new() -> Self {
        let (poll_tx, poll_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (set_tx, set_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(CHANNEL_DEPTH);
        Self {
            poll_tx,
            poll_rx: Arc::new(AsyncMutex::new(poll_rx)),
            set_tx,
            set_rx: Arc::new(AsyncMutex::new(set_rx)),
            response_tx,
            response_rx: Arc::new(AsyncMutex::new(response_rx)),
            pool: WorkPool::new(CHANNEL_DEPTH),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Default for IoChannels {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_recycles_reset_items() {
        let pool = WorkPool::new(4);
        let mut work = pool.take();
        work.work_name = "pub_x".to_string();
        work.buf16[0] = 0xBEEF;
        work.points.push(PointId(3));
        work.errno_code = 110;
        pool.put(work);

        let recycled = pool.take();
        assert!(recycled.work_name.is_empty());
        assert_eq!(recycled.buf16[0], 0);
        assert!(recycled.points.is_empty());
        assert_eq!(recycled.errno_code, 0);
    }

    #[test]
    fn test_pool_overflow_drops() {
        let pool = WorkPool::new(1);
        pool.put(Box::new(IoWork::default()));
        // second put exceeds capacity; must not panic or block
        pool.put(Box::new(IoWork::default()));
    }

    #[test]
    fn test_wire_offset_off_by_one() {
        let mut work = IoWork::default();
        work.offset = 100;
        assert_eq!(work.wire_offset(), 100);
        work.off_by_one = true;
        assert_eq!(work.wire_offset(), 99);
        work.offset = 0;
        assert_eq!(work.wire_offset(), 0);
    }

    #[test]
    fn test_monotonic_clock() {
        let a = now_s();
        let b = now_s();
        assert!(b >= a);
    }
}
