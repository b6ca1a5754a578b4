// src/config/mod.rs
//
// Config file loading: parse the JSON gateway description, validate it
// field by field, and build the runtime graph (config::model). Any
// validation failure aborts the load with a diagnostic naming the
// offending component / group / point — there is no partial configuration.

pub mod model;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::codec::{BitLabel, BitStrings, EnumEntry, PackedField, PointCodec};
use model::{
    Cfg, CompId, CompRuntime, Component, Connection, GroupId, GroupRuntime, HeartbeatCfg, IoPoint,
    PointId, PubStats, Publication, RegGroup, RegisterType, Transport,
};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("connection: {0}")]
    Connection(String),
    #[error("component '{comp}': {msg}")]
    Component { comp: String, msg: String },
    #[error("component '{comp}' register group at offset {offset}: {msg}")]
    Group {
        comp: String,
        offset: u16,
        msg: String,
    },
    #[error("component '{comp}' io_point '{point}': {msg}")]
    Point {
        comp: String,
        point: String,
        msg: String,
    },
}

// ============================================================================
// File format
// ============================================================================

fn default_port() -> u16 {
    502
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_max_num_connections() -> usize {
    1
}
fn default_device_id() -> u8 {
    1
}
fn default_connection_timeout() -> u64 {
    2000
}
fn default_max_io_tries() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_base_uri() -> String {
    "components".to_string()
}
fn default_frequency() -> u64 {
    1000
}
fn default_heartbeat_freq() -> u64 {
    1000
}
fn default_heartbeat_timeout() -> u64 {
    5000
}
fn default_size() -> u8 {
    1
}

/// Deserialize a mask from either an integer or a hex string ("0xFF00").
fn deserialize_mask<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct MaskVisitor;

    impl<'de> Visitor<'de> for MaskVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer or hex string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v as u64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let s = v.trim_start_matches("0x").trim_start_matches("0X");
            u64::from_str_radix(s, 16).or_else(|_| v.parse::<u64>().map_err(de::Error::custom))
        }
    }

    deserializer.deserialize_any(MaskVisitor)
}

fn deserialize_mask_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_mask(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct GatewayFile {
    pub connection: ConnectionFile,
    pub components: Vec<ComponentFile>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionFile {
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub serial_device: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_max_num_connections")]
    pub max_num_connections: usize,
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    /// Per-operation timeout, milliseconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_max_io_tries")]
    pub max_io_tries: u32,
    #[serde(default = "default_true")]
    pub allow_multi_sets: bool,
    #[serde(default = "default_true")]
    pub auto_disable: bool,
    #[serde(default)]
    pub off_by_one: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct ComponentFile {
    pub id: String,
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default)]
    pub offset_time: u64,
    #[serde(default)]
    pub device_id: Option<u8>,
    #[serde(default)]
    pub word_swap: bool,
    #[serde(default)]
    pub byte_swap: bool,
    #[serde(default)]
    pub debounce: u64,
    #[serde(default)]
    pub heartbeat_enabled: bool,
    #[serde(default = "default_heartbeat_freq")]
    pub modbus_heartbeat_freq_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub component_heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub component_heartbeat_read_uri: Option<String>,
    #[serde(default)]
    pub component_heartbeat_write_uri: Option<String>,
    pub registers: Vec<RegisterFile>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFile {
    #[serde(rename = "type")]
    pub reg_type: String,
    pub starting_offset: u16,
    pub number_of_registers: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub device_id: Option<u8>,
    pub map: Vec<MapFile>,
}

#[derive(Debug, Deserialize)]
pub struct MapFile {
    pub id: String,
    pub offset: u16,
    #[serde(default = "default_size")]
    pub size: u8,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub float: bool,
    #[serde(default)]
    pub float64: bool,
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub shift: i32,
    #[serde(default, deserialize_with = "deserialize_mask_opt")]
    pub invert_mask: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_mask_opt")]
    pub care_mask: Option<u64>,
    #[serde(default)]
    pub starting_bit_pos: u32,
    #[serde(default)]
    pub number_of_bits: u32,
    #[serde(default)]
    pub word_swap: Option<bool>,
    #[serde(default)]
    pub byte_swap: Option<bool>,
    #[serde(default)]
    pub individual_bits: bool,
    #[serde(default)]
    pub bit_field: bool,
    #[serde(default, rename = "enum")]
    pub is_enum: bool,
    /// Labels for individual_bits / bit_field (strings, null for gaps,
    /// "IGNORE" to skip) or `{value, string}` objects for enums.
    #[serde(default)]
    pub bit_strings: Option<Vec<serde_json::Value>>,
    /// Sub-fields of a packed register.
    #[serde(default)]
    pub packed_register: Option<Vec<MapFile>>,
    #[serde(default)]
    pub multi_write_op_code: bool,
    #[serde(default)]
    pub debounce: Option<u64>,
    #[serde(default)]
    pub deadband: f64,
    #[serde(default)]
    pub use_bool: bool,
    #[serde(default)]
    pub use_hex: bool,
}

// ============================================================================
// Loading
// ============================================================================

/// Load and validate a gateway config file.
pub fn load_config(path: &Path) -> Result<Cfg, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let file: GatewayFile = serde_json::from_str(&text)?;
    build(file)
}

/// Build the runtime graph from a parsed file, validating as we go.
pub fn build(file: GatewayFile) -> Result<Cfg, ConfigError> {
    let connection = build_connection(&file.connection)?;
    let base_uri = file.connection.base_uri.clone();

    let mut components: Vec<Component> = Vec::new();
    let mut groups: Vec<RegGroup> = Vec::new();
    let mut points: Vec<IoPoint> = Vec::new();
    let mut comp_index = HashMap::new();
    let mut pubs = HashMap::new();
    let mut subs = Vec::new();

    for comp_file in &file.components {
        if comp_index.contains_key(&comp_file.id) {
            return Err(ConfigError::Component {
                comp: comp_file.id.clone(),
                msg: "duplicate component id".to_string(),
            });
        }
        let comp_id = CompId(components.len());
        let device_id = comp_file.device_id.unwrap_or(connection.device_id);
        let uri = format!("/{}/{}", base_uri, comp_file.id);

        let mut comp = Component {
            idx: comp_id,
            id: comp_file.id.clone(),
            uri: uri.clone(),
            frequency_ms: comp_file.frequency,
            offset_time_ms: comp_file.offset_time,
            device_id,
            is_word_swap: comp_file.word_swap,
            is_byte_swap: comp_file.byte_swap,
            debounce_ms: comp_file.debounce,
            heartbeat: None,
            groups: Vec::new(),
            point_index: HashMap::new(),
            runtime: CompRuntime::default(),
        };
        comp.runtime
            .connected
            .store(true, std::sync::atomic::Ordering::Relaxed);

        if comp_file.frequency == 0 {
            return Err(ConfigError::Component {
                comp: comp.id,
                msg: "frequency must be greater than zero".to_string(),
            });
        }

        for reg_file in &comp_file.registers {
            let reg_type = RegisterType::from_config_str(&reg_file.reg_type).ok_or_else(|| {
                ConfigError::Group {
                    comp: comp.id.clone(),
                    offset: reg_file.starting_offset,
                    msg: format!("unknown register type '{}'", reg_file.reg_type),
                }
            })?;
            if reg_file.number_of_registers == 0 {
                return Err(ConfigError::Group {
                    comp: comp.id.clone(),
                    offset: reg_file.starting_offset,
                    msg: "number_of_registers must be greater than zero".to_string(),
                });
            }

            let group_id = GroupId(groups.len());
            let group_device_id = reg_file.device_id.unwrap_or(device_id);
            let mut group = RegGroup {
                idx: group_id,
                comp: comp_id,
                reg_type,
                starting_offset: reg_file.starting_offset,
                number_of_registers: reg_file.number_of_registers,
                enabled: reg_file.enabled,
                device_id: group_device_id,
                points: Vec::new(),
                offset_index: Default::default(),
                runtime: Mutex::new(GroupRuntime::default()),
            };

            let mut maps: Vec<&MapFile> = reg_file.map.iter().collect();
            maps.sort_by_key(|m| m.offset);

            let mut prev_end: Option<(u16, String)> = None;
            for map in maps {
                let point_id = PointId(points.len());
                let point = build_point(
                    map,
                    point_id,
                    &group,
                    &comp,
                    comp_file,
                )?;

                // Range and overlap checks against the group.
                let end = point.offset as u32 + point.size as u32;
                if point.offset < group.starting_offset
                    || end > group.end_offset() as u32
                {
                    return Err(ConfigError::Point {
                        comp: comp.id.clone(),
                        point: point.id.clone(),
                        msg: format!(
                            "offset {}..{} outside group range {}..{}",
                            point.offset,
                            end,
                            group.starting_offset,
                            group.end_offset()
                        ),
                    });
                }
                if let Some((prev, ref prev_id)) = prev_end {
                    if point.offset < prev {
                        return Err(ConfigError::Point {
                            comp: comp.id.clone(),
                            point: point.id.clone(),
                            msg: format!("overlaps io_point '{}'", prev_id),
                        });
                    }
                }
                prev_end = Some((end as u16, point.id.clone()));

                if comp.point_index.contains_key(&point.id) {
                    return Err(ConfigError::Point {
                        comp: comp.id.clone(),
                        point: point.id.clone(),
                        msg: "duplicate io_point id within component".to_string(),
                    });
                }
                comp.point_index.insert(point.id.clone(), point_id);
                group.offset_index.insert(point.offset, point_id);
                group.points.push(point_id);
                points.push(point);
            }

            comp.groups.push(group_id);
            groups.push(group);
        }

        // Heartbeat points resolve against this component's own map.
        if comp_file.heartbeat_enabled {
            let read_id = comp_file
                .component_heartbeat_read_uri
                .as_deref()
                .ok_or_else(|| ConfigError::Component {
                    comp: comp.id.clone(),
                    msg: "heartbeat_enabled requires component_heartbeat_read_uri".to_string(),
                })?;
            let read_point = resolve_point_ref(&comp, read_id).ok_or_else(|| {
                ConfigError::Component {
                    comp: comp.id.clone(),
                    msg: format!("heartbeat read point '{}' not found", read_id),
                }
            })?;
            let write_point = match comp_file.component_heartbeat_write_uri.as_deref() {
                Some(write_id) => Some(resolve_point_ref(&comp, write_id).ok_or_else(|| {
                    ConfigError::Component {
                        comp: comp.id.clone(),
                        msg: format!("heartbeat write point '{}' not found", write_id),
                    }
                })?),
                None => None,
            };
            comp.heartbeat = Some(HeartbeatCfg {
                freq_ms: comp_file.modbus_heartbeat_freq_ms,
                timeout_ms: comp_file.component_heartbeat_timeout_ms,
                read_point,
                write_point,
            });
        }

        let pub_name = format!("pub_{}_{}", base_uri, comp.id);
        pubs.insert(
            pub_name.clone(),
            Publication {
                id: pub_name,
                comp: comp_id,
                frequency_ms: comp.frequency_ms,
                offset_time_ms: comp.offset_time_ms,
                stats: Mutex::new(PubStats {
                    t_late: comp.frequency_ms as f64 / 1000.0,
                    ..Default::default()
                }),
            },
        );
        subs.push(uri);
        comp_index.insert(comp.id.clone(), comp_id);
        components.push(comp);
    }

    if components.is_empty() {
        return Err(ConfigError::Connection(
            "config defines no components".to_string(),
        ));
    }

    Ok(Cfg {
        connection,
        base_uri,
        components,
        groups,
        points,
        pubs,
        subs,
        comp_index,
    })
}

fn build_connection(file: &ConnectionFile) -> Result<Connection, ConfigError> {
    let transport = match (&file.ip_address, &file.serial_device) {
        (Some(host), None) => Transport::Tcp {
            host: host.clone(),
            port: file.port,
        },
        (None, Some(device)) => {
            let parity = match file.parity.to_ascii_lowercase().as_str() {
                "none" | "n" => 'N',
                "even" | "e" => 'E',
                "odd" | "o" => 'O',
                other => {
                    return Err(ConfigError::Connection(format!(
                        "unknown parity '{}'",
                        other
                    )))
                }
            };
            Transport::Rtu {
                device: device.clone(),
                baud_rate: file.baud_rate,
                parity,
                data_bits: file.data_bits,
                stop_bits: file.stop_bits,
            }
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::Connection(
                "both ip_address and serial_device given; pick one".to_string(),
            ))
        }
        (None, None) => {
            return Err(ConfigError::Connection(
                "either ip_address or serial_device is required".to_string(),
            ))
        }
    };

    if file.max_num_connections == 0 {
        return Err(ConfigError::Connection(
            "max_num_connections must be at least 1".to_string(),
        ));
    }

    Ok(Connection {
        name: file.name.clone(),
        transport,
        max_num_connections: file.max_num_connections,
        device_id: file.device_id,
        connection_timeout_ms: file.connection_timeout,
        max_io_tries: file.max_io_tries,
        allow_multi_sets: file.allow_multi_sets,
        auto_disable: file.auto_disable,
        off_by_one: file.off_by_one,
        debug: file.debug,
    })
}

/// A heartbeat point reference is either a bare point id or a full uri whose
/// last segment is the point id.
fn resolve_point_ref(comp: &Component, reference: &str) -> Option<PointId> {
    let id = reference.rsplit('/').next().unwrap_or(reference);
    comp.point_index.get(id).copied()
}

fn build_point(
    map: &MapFile,
    point_id: PointId,
    group: &RegGroup,
    comp: &Component,
    comp_file: &ComponentFile,
) -> Result<IoPoint, ConfigError> {
    let point_err = |msg: String| ConfigError::Point {
        comp: comp.id.clone(),
        point: map.id.clone(),
        msg,
    };

    if !matches!(map.size, 1 | 2 | 4) {
        return Err(point_err(format!("size {} not one of 1, 2, 4", map.size)));
    }
    if map.size == 1 && (map.float || map.float64) {
        return Err(point_err("single-register points cannot be float".to_string()));
    }
    if map.float64 && map.size != 4 {
        return Err(point_err("float64 requires size 4".to_string()));
    }

    let bit_strings = build_bit_strings(map, comp)?;

    let uses_masks = map.invert_mask.is_some() || map.care_mask.is_some();
    let number_of_bits = if map.number_of_bits > 0 {
        map.number_of_bits
    } else {
        map.size as u32 * 16
    };

    let codec = PointCodec {
        size: map.size,
        is_signed: map.signed,
        is_float: map.float || map.float64,
        is_float64: map.float64,
        is_word_swap: map.word_swap.unwrap_or(comp_file.word_swap),
        is_byte_swap: map.byte_swap.unwrap_or(comp_file.byte_swap),
        invert_mask: map.invert_mask.unwrap_or(0),
        care_mask: map.care_mask.unwrap_or(!0),
        uses_masks,
        starting_bit_pos: map.starting_bit_pos,
        number_of_bits,
        scale: map.scale,
        shift: map.shift as i64,
        is_bit: group.reg_type.is_bit_type(),
        use_bool: map.use_bool || group.reg_type.is_bit_type(),
        use_hex: map.use_hex,
        bit_strings,
    };

    Ok(IoPoint {
        idx: point_id,
        id: map.id.clone(),
        group: group.idx,
        comp: comp.idx,
        reg_type: group.reg_type,
        device_id: group.device_id,
        offset: map.offset,
        size: map.size,
        codec,
        multi_write_op_code: map.multi_write_op_code,
        debounce_s: map.debounce.unwrap_or(comp_file.debounce) as f64 / 1000.0,
        deadband: map.deadband,
        runtime: Mutex::new(Default::default()),
    })
}

fn build_bit_strings(map: &MapFile, comp: &Component) -> Result<BitStrings, ConfigError> {
    let point_err = |msg: String| ConfigError::Point {
        comp: comp.id.clone(),
        point: map.id.clone(),
        msg,
    };

    let kinds = [map.individual_bits, map.bit_field, map.is_enum, map.packed_register.is_some()];
    if kinds.iter().filter(|&&k| k).count() > 1 {
        return Err(point_err(
            "individual_bits, bit_field, enum and packed_register are mutually exclusive"
                .to_string(),
        ));
    }

    if let Some(sub_maps) = &map.packed_register {
        let mut fields = Vec::new();
        for sub in sub_maps {
            if sub.number_of_bits == 0 {
                return Err(point_err(format!(
                    "packed sub-point '{}' needs number_of_bits",
                    sub.id
                )));
            }
            if sub.starting_bit_pos + sub.number_of_bits > map.size as u32 * 16 {
                return Err(point_err(format!(
                    "packed sub-point '{}' exceeds the register width",
                    sub.id
                )));
            }
            let sub_bits = build_bit_strings(sub, comp)?;
            fields.push(PackedField {
                id: sub.id.clone(),
                codec: PointCodec {
                    starting_bit_pos: sub.starting_bit_pos,
                    number_of_bits: sub.number_of_bits,
                    use_bool: sub.use_bool,
                    use_hex: sub.use_hex,
                    bit_strings: sub_bits,
                    ..Default::default()
                },
            });
        }
        return Ok(BitStrings::Packed(fields));
    }

    if map.individual_bits || map.bit_field {
        let raw = map.bit_strings.as_ref().ok_or_else(|| {
            point_err("individual_bits/bit_field requires bit_strings".to_string())
        })?;
        if raw.len() > map.size as usize * 16 {
            return Err(point_err(format!(
                "{} bit_strings but the point only spans {} bits",
                raw.len(),
                map.size as usize * 16
            )));
        }
        let mut bits = Vec::with_capacity(raw.len());
        for entry in raw {
            match entry {
                serde_json::Value::Null => bits.push(if map.individual_bits {
                    BitLabel::Ignored
                } else {
                    BitLabel::Unknown
                }),
                serde_json::Value::String(s) if s == "IGNORE" => bits.push(BitLabel::Ignored),
                serde_json::Value::String(s) => bits.push(BitLabel::Labeled(s.clone())),
                other => {
                    return Err(point_err(format!(
                        "bit_strings entries must be strings or null, got {}",
                        other
                    )))
                }
            }
        }
        return Ok(if map.individual_bits {
            BitStrings::IndividualBits(bits)
        } else {
            BitStrings::BitField(bits)
        });
    }

    if map.is_enum {
        let raw = map
            .bit_strings
            .as_ref()
            .ok_or_else(|| point_err("enum requires bit_strings".to_string()))?;
        let mut entries = Vec::with_capacity(raw.len());
        for entry in raw {
            let obj = entry
                .as_object()
                .ok_or_else(|| point_err("enum bit_strings must be {value, string} objects".to_string()))?;
            let value = obj
                .get("value")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| point_err("enum entry missing numeric 'value'".to_string()))?;
            let label = obj
                .get("string")
                .and_then(|v| v.as_str())
                .ok_or_else(|| point_err("enum entry missing 'string'".to_string()))?;
            entries.push(EnumEntry {
                value,
                label: label.to_string(),
            });
        }
        return Ok(BitStrings::Enum(entries));
    }

    Ok(BitStrings::None)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "connection": {
                "name": "plant_modbus",
                "ip_address": "192.168.1.50",
                "port": 502,
                "max_num_connections": 2,
                "device_id": 1,
                "connection_timeout": 2000
            },
            "components": [
                {
                    "id": "bms",
                    "frequency": 1000,
                    "offset_time": 20,
                    "heartbeat_enabled": true,
                    "modbus_heartbeat_freq_ms": 500,
                    "component_heartbeat_timeout_ms": 3000,
                    "component_heartbeat_read_uri": "/components/bms/hb",
                    "registers": [
                        {
                            "type": "holding",
                            "starting_offset": 100,
                            "number_of_registers": 10,
                            "map": [
                                {"id": "temp", "offset": 100, "size": 1, "signed": true, "scale": 10.0},
                                {"id": "soc", "offset": 101, "size": 2, "float": true},
                                {"id": "hb", "offset": 103, "size": 1},
                                {
                                    "id": "status", "offset": 104, "size": 1, "enum": true,
                                    "bit_strings": [
                                        {"value": 1, "string": "idle"},
                                        {"value": 2, "string": "charging"}
                                    ]
                                }
                            ]
                        },
                        {
                            "type": "coil",
                            "starting_offset": 0,
                            "number_of_registers": 8,
                            "map": [
                                {"id": "enable", "offset": 0, "size": 1}
                            ]
                        }
                    ]
                }
            ]
        })
    }

    fn load(v: serde_json::Value) -> Result<Cfg, ConfigError> {
        build(serde_json::from_value(v).expect("file shape"))
    }

    #[test]
    fn test_sample_config_builds() {
        let cfg = load(sample_json()).expect("valid config");
        assert_eq!(cfg.components.len(), 1);
        assert_eq!(cfg.groups.len(), 2);
        assert_eq!(cfg.points.len(), 5);
        assert_eq!(cfg.subs, vec!["/components/bms"]);

        let comp = cfg.find_comp("bms").unwrap();
        assert_eq!(comp.uri, "/components/bms");
        let hb = comp.heartbeat.as_ref().expect("heartbeat");
        assert_eq!(cfg.point(hb.read_point).id, "hb");
        assert!(hb.write_point.is_none());

        let temp = cfg.find_point("bms", "temp").unwrap();
        assert!(temp.codec.is_signed);
        assert_eq!(temp.codec.scale, 10.0);

        // coil points render as booleans
        let enable = cfg.find_point("bms", "enable").unwrap();
        assert!(enable.codec.is_bit);
        assert!(enable.codec.use_bool);
    }

    #[test]
    fn test_offset_lookup() {
        let cfg = load(sample_json()).unwrap();
        let comp = cfg.find_comp("bms").unwrap();
        let group = cfg.group(comp.groups[0]);
        // soc spans 101..103; offset 102 resolves to it
        let pid = group.point_at(102, &cfg.points).expect("point at 102");
        assert_eq!(cfg.point(pid).id, "soc");
        // nothing owns 109
        assert!(group.point_at(109, &cfg.points).is_none());
    }

    #[test]
    fn test_point_outside_group_rejected() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][0]["offset"] = serde_json::json!(95);
        let err = load(v).unwrap_err();
        assert!(matches!(err, ConfigError::Point { .. }), "{}", err);
    }

    #[test]
    fn test_overlapping_points_rejected() {
        let mut v = sample_json();
        // soc occupies 101..103; move hb onto 102
        v["components"][0]["registers"][0]["map"][2]["offset"] = serde_json::json!(102);
        let err = load(v).unwrap_err();
        assert!(matches!(err, ConfigError::Point { .. }), "{}", err);
    }

    #[test]
    fn test_bad_size_rejected() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][0]["size"] = serde_json::json!(3);
        assert!(load(v).is_err());
    }

    #[test]
    fn test_size_one_float_rejected() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][0]["float"] = serde_json::json!(true);
        assert!(load(v).is_err());
    }

    #[test]
    fn test_duplicate_point_id_rejected() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][2]["id"] = serde_json::json!("temp");
        assert!(load(v).is_err());
    }

    #[test]
    fn test_missing_heartbeat_point_rejected() {
        let mut v = sample_json();
        v["components"][0]["component_heartbeat_read_uri"] = serde_json::json!("/components/bms/nope");
        assert!(load(v).is_err());
    }

    #[test]
    fn test_transport_exclusive() {
        let mut v = sample_json();
        v["connection"]["serial_device"] = serde_json::json!("/dev/ttyUSB0");
        assert!(matches!(load(v), Err(ConfigError::Connection(_))));
    }

    #[test]
    fn test_rtu_transport() {
        let mut v = sample_json();
        v["connection"].as_object_mut().unwrap().remove("ip_address");
        v["connection"]["serial_device"] = serde_json::json!("/dev/ttyUSB0");
        v["connection"]["baud_rate"] = serde_json::json!(19200);
        v["connection"]["parity"] = serde_json::json!("even");
        let cfg = load(v).unwrap();
        match &cfg.connection.transport {
            Transport::Rtu { device, baud_rate, parity, .. } => {
                assert_eq!(device, "/dev/ttyUSB0");
                assert_eq!(*baud_rate, 19200);
                assert_eq!(*parity, 'E');
            }
            other => panic!("expected RTU transport, got {:?}", other),
        }
    }

    #[test]
    fn test_hex_mask_parsing() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][0]["invert_mask"] = serde_json::json!("0xFF00");
        let cfg = load(v).unwrap();
        let temp = cfg.find_point("bms", "temp").unwrap();
        assert_eq!(temp.codec.invert_mask, 0xFF00);
        assert!(temp.codec.uses_masks);
    }

    #[test]
    fn test_individual_bits_labels() {
        let mut v = sample_json();
        v["components"][0]["registers"][0]["map"][3] = serde_json::json!({
            "id": "status", "offset": 104, "size": 1, "individual_bits": true,
            "bit_strings": ["run", "fault", "IGNORE", null, "aux"]
        });
        let cfg = load(v).unwrap();
        let status = cfg.find_point("bms", "status").unwrap();
        match &status.codec.bit_strings {
            BitStrings::IndividualBits(bits) => {
                assert_eq!(bits.len(), 5);
                assert_eq!(bits[0], BitLabel::Labeled("run".into()));
                assert_eq!(bits[2], BitLabel::Ignored);
                assert_eq!(bits[3], BitLabel::Ignored);
            }
            other => panic!("expected individual bits, got {:?}", other),
        }
    }

    #[test]
    fn test_bit_string_cardinality_rejected() {
        let mut v = sample_json();
        let labels: Vec<_> = (0..17).map(|i| serde_json::json!(format!("b{}", i))).collect();
        v["components"][0]["registers"][0]["map"][3] = serde_json::json!({
            "id": "status", "offset": 104, "size": 1, "individual_bits": true,
            "bit_strings": labels
        });
        assert!(load(v).is_err());
    }
}
