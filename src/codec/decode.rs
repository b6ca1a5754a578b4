// src/codec/decode.rs
//
// Raw registers → semantic value. One authoritative path: assemble the
// registers big-endian (little-endian word order when byte-swapped), apply
// masks, reinterpret per size/signedness/float flags, then scale and shift.
// In the unscaled integer branch the shift is applied before the
// starting-bit right-shift.

use serde_json::json;

use super::{BitLabel, BitStrings, PointCodec, Value};

/// Decode one point from its registers. `regs` must hold at least
/// `codec.size` words starting at the point's offset.
/// Returns the assembled raw value (pre-mask) and the semantic value.
pub fn decode_registers(regs: &[u16], c: &PointCodec) -> (u64, Value) {
    let raw_data: u64 = match c.size {
        1 => regs[0] as u64,
        2 => ((regs[0] as u64) << 16) | (regs[1] as u64),
        _ => {
            ((regs[0] as u64) << 48)
                | ((regs[1] as u64) << 32)
                | ((regs[2] as u64) << 16)
                | (regs[3] as u64)
        }
    };

    // Word-order swap reassembles from the same registers little-endian.
    let mut val: u64 = if c.is_byte_swap && c.size > 1 {
        match c.size {
            2 => ((regs[1] as u64) << 16) | (regs[0] as u64),
            _ => {
                ((regs[3] as u64) << 48)
                    | ((regs[2] as u64) << 32)
                    | ((regs[1] as u64) << 16)
                    | (regs[0] as u64)
            }
        }
    } else {
        raw_data
    };

    if c.uses_masks {
        val ^= c.invert_mask;
        val &= c.care_mask;
    }

    let value = if c.is_float {
        let f = match c.size {
            2 => f32::from_bits(val as u32) as f64,
            _ => f64::from_bits(val),
        };
        let scaled = if c.scale != 0.0 { f / c.scale } else { f };
        Value::F64(scaled + c.shift as f64)
    } else if c.is_signed {
        let signed: i64 = match c.size {
            1 => (val as u16) as i16 as i64,
            2 => (val as u32) as i32 as i64,
            _ => val as i64,
        };
        if c.scale != 0.0 {
            Value::F64(signed as f64 / c.scale + c.shift as f64)
        } else {
            Value::I64(signed.wrapping_add(c.shift) >> c.starting_bit_pos)
        }
    } else {
        if c.scale != 0.0 {
            Value::F64(val as f64 / c.scale + c.shift as f64)
        } else {
            Value::U64(val.wrapping_add(c.shift as u64) >> c.starting_bit_pos)
        }
    };

    (raw_data, value)
}

/// Decode a single coil / discrete input bit.
pub fn decode_bit(bit: u8, _c: &PointCodec) -> (u64, Value) {
    let raw = (bit != 0) as u64;
    (raw, Value::Bool(bit != 0))
}

/// Integer view of a decoded value, for bit-string post-processing.
fn value_bits(value: &Value) -> u64 {
    match *value {
        Value::U64(v) => v,
        Value::I64(v) => v as u64,
        Value::F64(v) => v as u64,
        Value::Bool(b) => b as u64,
    }
}

/// Render a decoded value to its bus body representation.
/// `raw_mode` adds hex/binary wrappers for `/_raw` requests.
pub fn render_value(raw: u64, value: &Value, c: &PointCodec, raw_mode: bool) -> serde_json::Value {
    let rendered = match &c.bit_strings {
        BitStrings::None => render_plain(value, c),
        BitStrings::IndividualBits(bits) => {
            let val = value_bits(value);
            let mut obj = serde_json::Map::new();
            for (idx, bit) in bits.iter().enumerate() {
                if let BitLabel::Labeled(label) = bit {
                    obj.insert(label.clone(), json!(((val >> idx) & 1) == 1));
                }
            }
            serde_json::Value::Object(obj)
        }
        BitStrings::BitField(bits) => {
            let val = value_bits(value);
            let mut entries = Vec::new();
            for (idx, bit) in bits.iter().enumerate() {
                if ((val >> idx) & 1) != 1 {
                    continue;
                }
                match bit {
                    BitLabel::Labeled(label) => {
                        entries.push(json!({"value": idx, "string": label}))
                    }
                    BitLabel::Unknown => entries.push(json!({"value": idx, "string": "unknown"})),
                    BitLabel::Ignored => {}
                }
            }
            // High bits past the configured labels are unknown too.
            for idx in bits.len()..(c.size as usize * 16) {
                if ((val >> idx) & 1) == 1 {
                    entries.push(json!({"value": idx, "string": "unknown"}));
                }
            }
            serde_json::Value::Array(entries)
        }
        BitStrings::Enum(entries) => {
            let val = value_bits(value);
            match entries.iter().find(|e| e.value == val) {
                Some(e) => json!([{"value": val, "string": e.label}]),
                None => json!([{"value": val, "string": "unknown"}]),
            }
        }
        BitStrings::Packed(fields) => {
            let val = value_bits(value);
            let mut obj = serde_json::Map::new();
            for field in fields {
                let fc = &field.codec;
                let sub = (val >> fc.starting_bit_pos) & fc.bit_mask();
                let sub_value = if fc.is_bit || fc.use_bool {
                    Value::Bool(sub != 0)
                } else {
                    Value::U64(sub)
                };
                obj.insert(field.id.clone(), render_value(sub, &sub_value, fc, false));
            }
            serde_json::Value::Object(obj)
        }
    };

    if raw_mode {
        let nibbles = c.size as usize * 4;
        let bits = c.size as usize * 16;
        json!({
            "value": rendered,
            "hex": format!("0x{:0width$X}", raw, width = nibbles),
            "binary": format!("0b{:0width$b}", raw, width = bits),
        })
    } else {
        rendered
    }
}

fn render_plain(value: &Value, c: &PointCodec) -> serde_json::Value {
    match *value {
        Value::Bool(b) => {
            if c.use_bool {
                json!(b)
            } else {
                json!(b as u8)
            }
        }
        Value::U64(v) => {
            if c.use_hex {
                json!(format!("0x{:X}", v))
            } else {
                json!(v)
            }
        }
        Value::I64(v) => json!(v),
        Value::F64(v) => json!(v),
    }
}

// ============================================================================
// Tests
// ============================================================================
