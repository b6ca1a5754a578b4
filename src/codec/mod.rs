// src/codec/mod.rs
//
// Register codec: raw 16-bit Modbus registers ↔ semantic values.
//
// Decoding assembles the point's registers into a raw integer, applies the
// configured masks and reinterpretation (signed/float), then scale and shift.
// Bit-string kinds (individual bits, bit fields, enums, packed registers)
// render to structured JSON on top of the decoded integer. Encoding runs the
// same pipeline in reverse for bus writes.

mod decode;
mod encode;

pub use decode::{decode_bit, decode_registers, render_value};
pub use encode::{encode_bit, encode_registers};

// ============================================================================
// Semantic values
// ============================================================================

/// A decoded (or to-be-encoded) point value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl Value {
    /// Coerce to f64 for deadband comparisons.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U64(v) => v as f64,
            Value::I64(v) => v as f64,
            Value::F64(v) => v,
            Value::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Convert a JSON body value into a point value. Accepts numbers and
    /// bools; anything else is a set-validation failure at the dispatcher.
    pub fn from_json(v: &serde_json::Value) -> Option<Value> {
        match v {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(Value::U64(u))
                } else if let Some(i) = n.as_i64() {
                    Some(Value::I64(i))
                } else {
                    n.as_f64().map(Value::F64)
                }
            }
            // Sets often arrive as {"value": x}
            serde_json::Value::Object(map) => map.get("value").and_then(Value::from_json),
            _ => None,
        }
    }
}

// ============================================================================
// Bit-string classification
// ============================================================================

/// Per-bit classifier for individual_bits / bit_field points. A config
/// label, a `null` gap and an "IGNORE" marker all land on one of these.
#[derive(Clone, Debug, PartialEq)]
pub enum BitLabel {
    /// A named bit: decoded and published under this label.
    Labeled(String),
    /// Explicitly ignored: never published, even when high.
    Ignored,
    /// A gap in the configured labels: published as "unknown" when high.
    Unknown,
}

/// One enum entry: a named integer value.
#[derive(Clone, Debug, PartialEq)]
pub struct EnumEntry {
    pub value: u64,
    pub label: String,
}

/// One sub-field of a packed register.
#[derive(Clone, Debug)]
pub struct PackedField {
    pub id: String,
    pub codec: PointCodec,
}

/// Mutually exclusive bit-string kinds.
#[derive(Clone, Debug, Default)]
pub enum BitStrings {
    #[default]
    None,
    /// Each labeled bit publishes `label: bool`.
    IndividualBits(Vec<BitLabel>),
    /// High bits publish `{value: bit, string: label}` entries.
    BitField(Vec<BitLabel>),
    /// The whole value resolves to one `{value, string}` entry.
    Enum(Vec<EnumEntry>),
    /// Sub-fields extracted by bit position/width, each decoded on its own.
    Packed(Vec<PackedField>),
}

// ============================================================================
// Point codec descriptor
// ============================================================================

/// Everything the codec needs to know about one point.
/// Immutable after config load.
#[derive(Clone, Debug)]
pub struct PointCodec {
    /// Register count: 1, 2 or 4.
    pub size: u8,
    pub is_signed: bool,
    pub is_float: bool,
    pub is_float64: bool,
    pub is_word_swap: bool,
    pub is_byte_swap: bool,
    pub invert_mask: u64,
    pub care_mask: u64,
    pub uses_masks: bool,
    pub starting_bit_pos: u32,
    pub number_of_bits: u32,
    /// 0 means "no scaling"; negative inverts boolean encoding.
    pub scale: f64,
    pub shift: i64,
    /// Single-bit point (coil / discrete input).
    pub is_bit: bool,
    /// Publish booleans as true/false instead of 1/0.
    pub use_bool: bool,
    /// Publish integers as hex strings.
    pub use_hex: bool,
    pub bit_strings: BitStrings,
}

impl Default for PointCodec {
    fn default() -> Self {
        Self {
            size: 1,
            is_signed: false,
            is_float: false,
            is_float64: false,
            is_word_swap: false,
            is_byte_swap: false,
            invert_mask: 0,
            care_mask: !0,
            uses_masks: false,
            starting_bit_pos: 0,
            number_of_bits: 16,
            scale: 0.0,
            shift: 0,
            is_bit: false,
            use_bool: false,
            use_hex: false,
            bit_strings: BitStrings::None,
        }
    }
}

impl PointCodec {
    /// Mask covering `number_of_bits` bits.
    pub fn bit_mask(&self) -> u64 {
        if self.number_of_bits >= 64 {
            !0
        } else {
            (1u64 << self.number_of_bits) - 1
        }
    }
}
