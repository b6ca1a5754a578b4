// src/config/model.rs
//
// Runtime configuration graph: connection → components → register groups →
// io_points, stored as arenas with index handles. Descriptors are immutable
// after load; per-point and per-group mutable state (enable/force flags,
// debounce windows, bad registers, cached registers) lives behind small
// mutexes inside the arena entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Mutex;

use crate::codec::{PointCodec, Value};

// ============================================================================
// Handles
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PointId(pub usize);

// ============================================================================
// Register types
// ============================================================================

/// Modbus register class. Determines the wire function code family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    DiscreteInput,
}

impl RegisterType {
    pub fn is_bit_type(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Holding | RegisterType::Coil)
    }

    pub fn from_config_str(s: &str) -> Option<RegisterType> {
        match s.to_ascii_lowercase().as_str() {
            "holding" | "holding_registers" => Some(RegisterType::Holding),
            "input" | "input_registers" => Some(RegisterType::Input),
            "coil" | "coils" => Some(RegisterType::Coil),
            "discrete_input" | "discrete_inputs" | "discrete" => Some(RegisterType::DiscreteInput),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
            RegisterType::Coil => "coil",
            RegisterType::DiscreteInput => "discrete_input",
        }
    }

    /// Wire maximum for one request: 125 registers or 2000 bits.
    pub fn max_per_request(&self) -> u16 {
        if self.is_bit_type() {
            2000
        } else {
            125
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Transport endpoint: Modbus TCP or RTU over a serial device.
#[derive(Clone, Debug)]
pub enum Transport {
    Tcp {
        host: String,
        port: u16,
    },
    Rtu {
        device: String,
        baud_rate: u32,
        parity: char,
        data_bits: u8,
        stop_bits: u8,
    },
}

impl Transport {
    pub fn describe(&self) -> String {
        match self {
            Transport::Tcp { host, port } => format!("{}:{}", host, port),
            Transport::Rtu { device, baud_rate, .. } => format!("{}@{}", device, baud_rate),
        }
    }
}

/// Endpoint descriptor. Owns the worker pool sizing and I/O policy knobs.
#[derive(Clone, Debug)]
pub struct Connection {
    pub name: String,
    pub transport: Transport,
    pub max_num_connections: usize,
    pub device_id: u8,
    pub connection_timeout_ms: u64,
    pub max_io_tries: u32,
    pub allow_multi_sets: bool,
    pub auto_disable: bool,
    pub off_by_one: bool,
    pub debug: bool,
}

// ============================================================================
// Component
// ============================================================================

/// Heartbeat supervision settings, resolved to point handles at load.
#[derive(Clone, Debug)]
pub struct HeartbeatCfg {
    pub freq_ms: u64,
    pub timeout_ms: u64,
    pub read_point: PointId,
    pub write_point: Option<PointId>,
}

/// Mutable per-component state.
#[derive(Debug, Default)]
pub struct CompRuntime {
    /// Device considered alive (heartbeat / consecutive-failure tracking).
    pub connected: AtomicBool,
    /// Consecutive failed publication cycles.
    pub consecutive_fails: AtomicU32,
}

/// One logical device under the connection.
#[derive(Debug)]
pub struct Component {
    pub idx: CompId,
    pub id: String,
    /// Publication uri, `/<base>/<id>`.
    pub uri: String,
    pub frequency_ms: u64,
    pub offset_time_ms: u64,
    pub device_id: u8,
    pub is_word_swap: bool,
    pub is_byte_swap: bool,
    pub debounce_ms: u64,
    pub heartbeat: Option<HeartbeatCfg>,
    pub groups: Vec<GroupId>,
    /// Point id → handle, for bus set/get resolution.
    pub point_index: HashMap<String, PointId>,
    pub runtime: CompRuntime,
}

// ============================================================================
// Register group
// ============================================================================

#[derive(Debug, Default)]
pub struct GroupRuntime {
    /// Offsets the device rejected; batching routes around them.
    pub bad_regs: Vec<u16>,
}

/// One contiguous range of a single register type.
#[derive(Debug)]
pub struct RegGroup {
    pub idx: GroupId,
    pub comp: CompId,
    pub reg_type: RegisterType,
    pub starting_offset: u16,
    pub number_of_registers: u16,
    pub enabled: bool,
    pub device_id: u8,
    /// Points sorted by offset.
    pub points: Vec<PointId>,
    /// Offset → owning point, for decode dispatch.
    pub offset_index: BTreeMap<u16, PointId>,
    pub runtime: Mutex<GroupRuntime>,
}

impl RegGroup {
    pub fn end_offset(&self) -> u16 {
        self.starting_offset + self.number_of_registers
    }

    /// The point owning `offset`, if any: the nearest point at or below
    /// `offset` whose span covers it.
    pub fn point_at(&self, offset: u16, points: &[IoPoint]) -> Option<PointId> {
        let (_, &pid) = self.offset_index.range(..=offset).next_back()?;
        let p = &points[pid.0];
        if offset < p.offset + p.size as u16 {
            Some(pid)
        } else {
            None
        }
    }
}

// ============================================================================
// io_point
// ============================================================================

/// Mutable per-point state.
#[derive(Clone, Debug)]
pub struct PointRuntime {
    pub is_enabled: bool,
    pub is_forced: bool,
    pub forced_val: u64,
    /// Forced/disabled expiry, monotonic seconds. 0 = no expiry.
    pub offtime: f64,
    /// Debounce window end, monotonic seconds.
    pub debounce_until: f64,
    /// Set value coalesced during the debounce window.
    pub pending_set: Option<Value>,
    /// Last value written to the device, for deadband comparison.
    pub last_set_float: f64,
    pub last_raw: u64,
    pub last_value: Option<Value>,
    pub last_float: f64,
    /// Shadow register cache for local-mode operations.
    pub cache: [u16; 4],
    pub set_time: f64,
}

impl Default for PointRuntime {
    fn default() -> Self {
        Self {
            is_enabled: true,
            is_forced: false,
            forced_val: 0,
            offtime: 0.0,
            debounce_until: 0.0,
            pending_set: None,
            last_set_float: 0.0,
            last_raw: 0,
            last_value: None,
            last_float: 0.0,
            cache: [0; 4],
            set_time: 0.0,
        }
    }
}

/// One semantic variable mapped onto one or more registers.
#[derive(Debug)]
pub struct IoPoint {
    pub idx: PointId,
    pub id: String,
    pub group: GroupId,
    pub comp: CompId,
    pub reg_type: RegisterType,
    pub device_id: u8,
    /// Absolute register offset.
    pub offset: u16,
    pub size: u8,
    pub codec: PointCodec,
    /// Prefer write_registers over write_register for single-register sets.
    pub multi_write_op_code: bool,
    /// Debounce window, seconds. 0 = off.
    pub debounce_s: f64,
    pub deadband: f64,
    pub runtime: Mutex<PointRuntime>,
}

impl IoPoint {
    /// Snapshot of the registers this point last observed, from the shadow
    /// cache, as a raw value suitable for decode.
    pub fn cached_registers(&self) -> [u16; 4] {
        self.runtime.lock().map(|r| r.cache).unwrap_or([0; 4])
    }
}

// ============================================================================
// Publication catalog
// ============================================================================

#[derive(Clone, Debug)]
pub struct PubStats {
    pub t_request: f64,
    pub t_late: f64,
    pub t_min: f64,
    pub t_max: f64,
    pub t_total: f64,
    pub count: u64,
    pub late_count: u64,
    pub errors: u64,
}

impl Default for PubStats {
    fn default() -> Self {
        Self {
            t_request: 0.0,
            t_late: 0.0,
            t_min: f64::MAX,
            t_max: 0.0,
            t_total: 0.0,
            count: 0,
            late_count: 0,
            errors: 0,
        }
    }
}

impl PubStats {
    pub fn record(&mut self, elapsed: f64) {
        self.count += 1;
        self.t_total += elapsed;
        if elapsed < self.t_min {
            self.t_min = elapsed;
        }
        if elapsed > self.t_max {
            self.t_max = elapsed;
        }
        if self.t_late > 0.0 && elapsed > self.t_late {
            self.late_count += 1;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.t_total / self.count as f64
        }
    }
}

/// One periodic read cycle.
#[derive(Debug)]
pub struct Publication {
    /// Work-name key, `pub_<base>_<comp>`.
    pub id: String,
    pub comp: CompId,
    pub frequency_ms: u64,
    pub offset_time_ms: u64,
    pub stats: Mutex<PubStats>,
}

// ============================================================================
// Top-level config
// ============================================================================

/// The whole configuration graph. Immutable after load apart from the
/// runtime cells noted above.
#[derive(Debug)]
pub struct Cfg {
    pub connection: Connection,
    pub base_uri: String,
    pub components: Vec<Component>,
    pub groups: Vec<RegGroup>,
    pub points: Vec<IoPoint>,
    /// work_name → publication.
    pub pubs: HashMap<String, Publication>,
    /// Bus subscription uris, one per component.
    pub subs: Vec<String>,
    /// Component id → handle.
    pub comp_index: HashMap<String, CompId>,
}

impl Cfg {
    pub fn comp(&self, id: CompId) -> &Component {
        &self.components[id.0]
    }

    pub fn group(&self, id: GroupId) -> &RegGroup {
        &self.groups[id.0]
    }

    pub fn point(&self, id: PointId) -> &IoPoint {
        &self.points[id.0]
    }

    pub fn find_comp(&self, id: &str) -> Option<&Component> {
        self.comp_index.get(id).map(|&c| self.comp(c))
    }

    pub fn find_point(&self, comp: &str, point: &str) -> Option<&IoPoint> {
        let comp = self.find_comp(comp)?;
        comp.point_index.get(point).map(|&p| self.point(p))
    }

    /// Publication work-name for a component.
    pub fn pub_name(&self, comp: CompId) -> String {
        format!("pub_{}_{}", self.base_uri, self.comp(comp).id)
    }
}
