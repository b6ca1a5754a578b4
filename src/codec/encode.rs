// src/codec/encode.rs
//
// Semantic value → raw registers, the reverse of decode.rs. Integers take
// the starting-bit left-shift and the shift subtraction, everything takes
// the scale multiply when scale is nonzero, the result is bit-converted to
// the target width, inverted, and serialized big-endian (little-endian word
// order when word-swapped; size-4 float64 is always little-endian).

use super::{PointCodec, Value};

/// Canonical numeric form after shift/scale: either an exact integer or a
/// scaled float that still needs truncation to the target width.
enum Canonical {
    Int(i64),
    Float(f64),
}

fn canonicalize(c: &PointCodec, input: &Value) -> Canonical {
    match *input {
        Value::Bool(b) => {
            // scale < 0 inverts boolean encoding
            let (tval, fval) = if c.scale < 0.0 { (0, 1) } else { (1, 0) };
            Canonical::Int(if b { tval } else { fval })
        }
        Value::U64(v) => {
            let shifted = ((v << c.starting_bit_pos) as i64).wrapping_sub(c.shift);
            if c.scale != 0.0 {
                Canonical::Float(shifted as f64 * c.scale)
            } else {
                Canonical::Int(shifted)
            }
        }
        Value::I64(v) => {
            let shifted = (v << c.starting_bit_pos).wrapping_sub(c.shift);
            if c.scale != 0.0 {
                Canonical::Float(shifted as f64 * c.scale)
            } else {
                Canonical::Int(shifted)
            }
        }
        Value::F64(v) => {
            if c.scale != 0.0 {
                Canonical::Float(v * c.scale)
            } else {
                Canonical::Float(v)
            }
        }
    }
}

/// Encode one point value into registers. The first `codec.size` words of
/// the returned array are valid.
pub fn encode_registers(c: &PointCodec, input: &Value) -> [u16; 4] {
    let canonical = canonicalize(c, input);
    let mut out = [0u16; 4];

    match c.size {
        1 => {
            let mut word: u16 = match canonical {
                Canonical::Int(i) => i as u16,
                Canonical::Float(f) => {
                    if c.is_signed {
                        (f as i16) as u16
                    } else {
                        f as u16
                    }
                }
            };
            word ^= c.invert_mask as u16;
            out[0] = word;
        }
        2 => {
            let mut val: u32 = match canonical {
                Canonical::Int(i) => {
                    if c.is_float {
                        (i as f32).to_bits()
                    } else {
                        i as u32
                    }
                }
                Canonical::Float(f) => {
                    if c.is_float {
                        (f as f32).to_bits()
                    } else if c.is_signed {
                        (f as i32) as u32
                    } else {
                        f as u32
                    }
                }
            };
            val ^= c.invert_mask as u32;
            if c.is_word_swap {
                out[0] = val as u16;
                out[1] = (val >> 16) as u16;
            } else {
                out[0] = (val >> 16) as u16;
                out[1] = val as u16;
            }
        }
        _ => {
            let is_f64 = c.is_float || c.is_float64;
            let mut val: u64 = match canonical {
                Canonical::Int(i) => {
                    if is_f64 {
                        (i as f64).to_bits()
                    } else {
                        i as u64
                    }
                }
                Canonical::Float(f) => {
                    if is_f64 {
                        f.to_bits()
                    } else if c.is_signed {
                        (f as i64) as u64
                    } else {
                        f as u64
                    }
                }
            };
            val ^= c.invert_mask;
            if c.is_float64 || c.is_word_swap {
                // float64 points always serialize little-endian word order
                out[0] = val as u16;
                out[1] = (val >> 16) as u16;
                out[2] = (val >> 32) as u16;
                out[3] = (val >> 48) as u16;
            } else {
                out[0] = (val >> 48) as u16;
                out[1] = (val >> 32) as u16;
                out[2] = (val >> 16) as u16;
                out[3] = val as u16;
            }
        }
    }

    out
}

/// Encode a coil / discrete value.
pub fn encode_bit(c: &PointCodec, input: &Value) -> bool {
    let high = match *input {
        Value::Bool(b) => b,
        Value::U64(v) => v != 0,
        Value::I64(v) => v != 0,
        Value::F64(v) => v != 0.0,
    };
    if c.scale < 0.0 {
        !high
    } else {
        high
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::{decode_registers, BitStrings};
    use super::*;

    fn roundtrip(c: &PointCodec, v: Value) -> Value {
        let regs = encode_registers(c, &v);
        decode_registers(&regs[..c.size as usize], c).1
    }

    #[test]
    fn test_plain_u16_roundtrip() {
        let c = PointCodec::default();
        for v in [0u64, 1, 255, 0x7FFF, 0xFFFF] {
            assert_eq!(roundtrip(&c, Value::U64(v)), Value::U64(v));
        }
    }

    #[test]
    fn test_signed_s16_roundtrip() {
        let c = PointCodec {
            is_signed: true,
            ..Default::default()
        };
        for v in [-32768i64, -100, 0, 100, 32767] {
            assert_eq!(roundtrip(&c, Value::I64(v)), Value::I64(v));
        }
    }

    #[test]
    fn test_signed_s32_roundtrip() {
        let c = PointCodec {
            size: 2,
            is_signed: true,
            ..Default::default()
        };
        for v in [i32::MIN as i64, -1, 0, 1, i32::MAX as i64] {
            assert_eq!(roundtrip(&c, Value::I64(v)), Value::I64(v));
        }
    }

    #[test]
    fn test_u64_roundtrip() {
        let c = PointCodec {
            size: 4,
            ..Default::default()
        };
        for v in [0u64, 1, u32::MAX as u64, 1 << 40] {
            assert_eq!(roundtrip(&c, Value::U64(v)), Value::U64(v));
        }
    }

    #[test]
    fn test_mask_roundtrip_property() {
        // with masks, decode(encode(v)) == (v ^ invert) & care
        let c = PointCodec {
            uses_masks: true,
            invert_mask: 0x0F0F,
            care_mask: 0x0FFF,
            ..Default::default()
        };
        let v = 0xABCDu64;
        let regs = encode_registers(&c, &Value::U64(v));
        // encode applies the invert; decode inverts again and applies care
        let (_, decoded) = decode_registers(&regs[..1], &c);
        assert_eq!(decoded, Value::U64((v ^ 0x0F0F ^ 0x0F0F) & 0x0FFF & 0xFFFF));
    }

    #[test]
    fn test_float64_write_layout() {
        // four-register float64, word_swap disabled → little-endian word layout
        let c = PointCodec {
            size: 4,
            is_float: true,
            is_float64: true,
            ..Default::default()
        };
        let regs = encode_registers(&c, &Value::F64(56.67));
        let bits = 56.67f64.to_bits();
        assert_eq!(regs[0], bits as u16);
        assert_eq!(regs[1], (bits >> 16) as u16);
        assert_eq!(regs[2], (bits >> 32) as u16);
        assert_eq!(regs[3], (bits >> 48) as u16);
    }

    #[test]
    fn test_float32_big_endian_layout() {
        let c = PointCodec {
            size: 2,
            is_float: true,
            ..Default::default()
        };
        let regs = encode_registers(&c, &Value::F64(std::f32::consts::PI as f64));
        assert_eq!(regs[0], 0x4049);
        assert_eq!(regs[1], 0x0FDB);
    }

    #[test]
    fn test_float32_word_swap_layout() {
        let c = PointCodec {
            size: 2,
            is_float: true,
            is_word_swap: true,
            ..Default::default()
        };
        let regs = encode_registers(&c, &Value::F64(std::f32::consts::PI as f64));
        assert_eq!(regs[0], 0x0FDB);
        assert_eq!(regs[1], 0x4049);
    }

    #[test]
    fn test_scaled_roundtrip() {
        // scale 10: engineering value −10.0 → wire −100 → back to −10.0
        let c = PointCodec {
            is_signed: true,
            scale: 10.0,
            ..Default::default()
        };
        let regs = encode_registers(&c, &Value::F64(-10.0));
        assert_eq!(regs[0], 0xFF9Cu16);
        assert_eq!(decode_registers(&regs[..1], &c).1, Value::F64(-10.0));
    }

    #[test]
    fn test_bool_inverted_by_negative_scale() {
        let c = PointCodec {
            scale: -1.0,
            ..Default::default()
        };
        // integer register encoding inverts 1/0
        let regs = encode_registers(
            &PointCodec {
                scale: -1.0,
                is_signed: false,
                is_float: false,
                bit_strings: BitStrings::None,
                ..Default::default()
            },
            &Value::Bool(true),
        );
        assert_eq!(regs[0], 0);
        // coil encoding inverts too
        assert!(!encode_bit(&c, &Value::Bool(true)));
        assert!(encode_bit(&c, &Value::Bool(false)));
    }

    #[test]
    fn test_shift_and_bit_pos_encode() {
        let c = PointCodec {
            shift: 2,
            starting_bit_pos: 4,
            ..Default::default()
        };
        let regs = encode_registers(&c, &Value::U64(0x10));
        // (0x10 << 4) - 2
        assert_eq!(regs[0], (0x10u16 << 4) - 2);
        // and decode reverses it
        assert_eq!(decode_registers(&regs[..1], &c).1, Value::U64(0x10));
    }
}
