//! Data-driven Modbus point map: one `PointSpec` per named signal, decoded
//! according to the endpoint's byte/word order and the point's own format.
//!
//! This deliberately does not hardcode per-vendor register maps the way the
//! teacher's `hardware/modbus/battery.rs` does for specific inverter/battery
//! brands. Every point here is described entirely by configuration, the
//! pattern shown by the data-driven Modbus pollers in the retrieval pack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The nine point names every endpoint must declare.
pub const REQUIRED_POINT_NAMES: [&str; 9] = [
    "p_setpoint",
    "p_battery",
    "q_setpoint",
    "q_battery",
    "enable",
    "soc",
    "p_poi",
    "q_poi",
    "v_poi",
];

pub type PointName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    MswFirst,
    LswFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFormat {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
}

impl RegisterFormat {
    /// Number of consecutive 16-bit holding registers this format occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            RegisterFormat::Int16 | RegisterFormat::Uint16 => 1,
            RegisterFormat::Int32 | RegisterFormat::Uint32 | RegisterFormat::Float32 => 2,
        }
    }

    pub fn byte_count(&self) -> u16 {
        self.word_count() * 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointAccess {
    R,
    W,
    Rw,
}

impl PointAccess {
    pub fn is_readable(&self) -> bool {
        matches!(self, PointAccess::R | PointAccess::Rw)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, PointAccess::W | PointAccess::Rw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSpec {
    pub address: u16,
    pub format: RegisterFormat,
    pub access: PointAccess,
    pub unit: String,
    pub eng_per_count: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("expected {expected} registers, got {actual}")]
    WrongWordCount { expected: u16, actual: usize },
    #[error("eng_per_count must be > 0, got {0}")]
    InvalidScale(f64),
    #[error("engineering value {0} overflows the target register format")]
    Overflow(f64),
}

fn reorder_words(words: &[u16], word_order: WordOrder) -> Vec<u16> {
    let mut ordered = words.to_vec();
    if word_order == WordOrder::LswFirst {
        ordered.reverse();
    }
    ordered
}

/// Assemble raw register words into a big-endian byte buffer honoring both
/// word order (register ordering) and byte order (byte ordering within each
/// register), then decode as the declared format scaled by `eng_per_count`.
pub fn decode_point(
    words: &[u16],
    spec: &PointSpec,
    byte_order: ByteOrder,
    word_order: WordOrder,
) -> Result<f64, CodecError> {
    let expected = spec.format.word_count();
    if words.len() != expected as usize {
        return Err(CodecError::WrongWordCount {
            expected,
            actual: words.len(),
        });
    }
    if spec.eng_per_count <= 0.0 {
        return Err(CodecError::InvalidScale(spec.eng_per_count));
    }

    let ordered = reorder_words(words, word_order);
    let mut buf = Vec::with_capacity(ordered.len() * 2);
    for word in &ordered {
        match byte_order {
            ByteOrder::Big => buf.extend_from_slice(&word.to_be_bytes()),
            ByteOrder::Little => buf.extend_from_slice(&word.to_le_bytes()),
        }
    }

    let raw_count: f64 = match spec.format {
        RegisterFormat::Uint16 => {
            let v = read_u16(&buf, byte_order);
            v as f64
        }
        RegisterFormat::Int16 => {
            let v = read_u16(&buf, byte_order) as i16;
            v as f64
        }
        RegisterFormat::Uint32 => {
            let v = read_u32(&buf, byte_order);
            v as f64
        }
        RegisterFormat::Int32 => {
            let v = read_u32(&buf, byte_order) as i32;
            v as f64
        }
        RegisterFormat::Float32 => {
            let v = read_u32(&buf, byte_order);
            f32::from_bits(v) as f64
        }
    };

    if matches!(spec.format, RegisterFormat::Float32) {
        Ok(raw_count)
    } else {
        Ok(raw_count * spec.eng_per_count)
    }
}

/// Encode an engineering value back into register words for a write.
/// Guards against values that would overflow the target integer format and
/// silently wrap (which would reverse the commanded polarity).
pub fn encode_point(
    value: f64,
    spec: &PointSpec,
    byte_order: ByteOrder,
    word_order: WordOrder,
) -> Result<Vec<u16>, CodecError> {
    if spec.eng_per_count <= 0.0 {
        return Err(CodecError::InvalidScale(spec.eng_per_count));
    }

    let mut buf = Vec::with_capacity(spec.format.byte_count() as usize);
    match spec.format {
        RegisterFormat::Float32 => {
            let bits = (value as f32).to_bits();
            write_u32(&mut buf, bits, byte_order);
        }
        RegisterFormat::Uint16 => {
            let raw = value / spec.eng_per_count;
            if !(0.0..=u16::MAX as f64).contains(&raw.round()) {
                return Err(CodecError::Overflow(value));
            }
            write_u16(&mut buf, raw.round() as u16, byte_order);
        }
        RegisterFormat::Int16 => {
            let raw = value / spec.eng_per_count;
            if !(i16::MIN as f64..=i16::MAX as f64).contains(&raw.round()) {
                return Err(CodecError::Overflow(value));
            }
            write_u16(&mut buf, raw.round() as i16 as u16, byte_order);
        }
        RegisterFormat::Uint32 => {
            let raw = value / spec.eng_per_count;
            if !(0.0..=u32::MAX as f64).contains(&raw.round()) {
                return Err(CodecError::Overflow(value));
            }
            write_u32(&mut buf, raw.round() as u32, byte_order);
        }
        RegisterFormat::Int32 => {
            let raw = value / spec.eng_per_count;
            if !(i32::MIN as f64..=i32::MAX as f64).contains(&raw.round()) {
                return Err(CodecError::Overflow(value));
            }
            write_u32(&mut buf, raw.round() as i32 as u32, byte_order);
        }
    }

    let mut words = Vec::with_capacity(spec.format.word_count() as usize);
    for chunk in buf.chunks(2) {
        words.push(match byte_order {
            ByteOrder::Big => u16::from_be_bytes([chunk[0], chunk[1]]),
            ByteOrder::Little => u16::from_le_bytes([chunk[0], chunk[1]]),
        });
    }
    Ok(reorder_words(&words, word_order))
}

fn read_u16(buf: &[u8], order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Big => u16::from_be_bytes([buf[0], buf[1]]),
        ByteOrder::Little => u16::from_le_bytes([buf[0], buf[1]]),
    }
}

fn read_u32(buf: &[u8], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Big => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        ByteOrder::Little => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
    }
}

fn write_u16(buf: &mut Vec<u8>, v: u16, order: ByteOrder) {
    match order {
        ByteOrder::Big => buf.extend_from_slice(&v.to_be_bytes()),
        ByteOrder::Little => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32, order: ByteOrder) {
    match order {
        ByteOrder::Big => buf.extend_from_slice(&v.to_be_bytes()),
        ByteOrder::Little => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(format: RegisterFormat, eng_per_count: f64) -> PointSpec {
        PointSpec {
            address: 0,
            format,
            access: PointAccess::Rw,
            unit: "kW".to_string(),
            eng_per_count,
        }
    }

    #[rstest::rstest]
    #[case(RegisterFormat::Int16, ByteOrder::Big, WordOrder::MswFirst)]
    #[case(RegisterFormat::Int32, ByteOrder::Big, WordOrder::MswFirst)]
    #[case(RegisterFormat::Int32, ByteOrder::Little, WordOrder::LswFirst)]
    #[case(RegisterFormat::Uint32, ByteOrder::Big, WordOrder::MswFirst)]
    #[case(RegisterFormat::Float32, ByteOrder::Big, WordOrder::MswFirst)]
    fn round_trips_within_one_lsb(
        #[case] format: RegisterFormat,
        #[case] byte_order: ByteOrder,
        #[case] word_order: WordOrder,
    ) {
        let eng_per_count = if matches!(format, RegisterFormat::Float32) {
            1.0
        } else {
            0.1
        };
        let spec = spec(format, eng_per_count);
        let value = 123.4_f64;
        let words = encode_point(value, &spec, byte_order, word_order).unwrap();
        let decoded = decode_point(&words, &spec, byte_order, word_order).unwrap();
        assert!((decoded - value).abs() <= eng_per_count.max(0.01));
    }

    #[test]
    fn negative_int16_round_trips() {
        let spec = spec(RegisterFormat::Int16, 0.1);
        let words = encode_point(-50.0, &spec, ByteOrder::Big, WordOrder::MswFirst).unwrap();
        let decoded = decode_point(&words, &spec, ByteOrder::Big, WordOrder::MswFirst).unwrap();
        assert!((decoded - (-50.0)).abs() <= 0.1);
    }

    #[test]
    fn overflow_is_rejected_not_wrapped() {
        let spec = spec(RegisterFormat::Int16, 0.001);
        let err = encode_point(1_000_000.0, &spec, ByteOrder::Big, WordOrder::MswFirst).unwrap_err();
        assert!(matches!(err, CodecError::Overflow(_)));
    }

    #[test]
    fn word_order_reverses_register_sequence() {
        let spec = spec(RegisterFormat::Uint32, 1.0);
        let msw = encode_point(70000.0, &spec, ByteOrder::Big, WordOrder::MswFirst).unwrap();
        let lsw = encode_point(70000.0, &spec, ByteOrder::Big, WordOrder::LswFirst).unwrap();
        assert_eq!(msw, vec![lsw[1], lsw[0]]);
    }

    #[test]
    fn wrong_word_count_is_rejected() {
        let spec = spec(RegisterFormat::Int32, 1.0);
        let err = decode_point(&[0], &spec, ByteOrder::Big, WordOrder::MswFirst).unwrap_err();
        assert_eq!(err, CodecError::WrongWordCount { expected: 2, actual: 1 });
    }
}
