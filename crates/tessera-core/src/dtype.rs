use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a tensor can be requested with.
///
/// `Fp32` and `Fp16` have dense storage backends. `QInt8` and `QInt4` are
/// quantized weight formats: they can be stored and dequantized but never
/// take part in arithmetic directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit IEEE 754 single-precision float
    #[default]
    Fp32,
    /// 16-bit IEEE 754 half-precision float
    Fp16,
    /// 8-bit symmetric quantized integer with per-channel scales
    QInt8,
    /// 4-bit symmetric quantized integer, packed 2 values per byte
    QInt4,
}

impl DataType {
    /// Size in bytes of a single element, or None for packed types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DataType::Fp32 => Some(4),
            DataType::Fp16 => Some(2),
            DataType::QInt8 => Some(1),
            DataType::QInt4 => None,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        match self {
            DataType::QInt4 => n.div_ceil(2),
            DataType::Fp32 => 4 * n,
            DataType::Fp16 => 2 * n,
            DataType::QInt8 => n,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Fp32 | DataType::Fp16)
    }

    /// Whether this dtype is a quantized integer type.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DataType::QInt8 | DataType::QInt4)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Fp32 => write!(f, "fp32"),
            DataType::Fp16 => write!(f, "fp16"),
            DataType::QInt8 => write!(f, "qint8"),
            DataType::QInt4 => write!(f, "qint4"),
        }
    }
}

/// Memory layout tag.
///
/// Determines which logical axis is unit-stride and therefore how every
/// index formula, contiguity check and matrix view is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Channel-minor: memory order batch, channel, height, width.
    #[default]
    Nchw,
    /// Channel-major: memory order batch, height, width, channel.
    Nhwc,
}

impl Format {
    /// Logical axes (b=0, c=1, h=2, w=3) listed from outermost to innermost in memory.
    pub fn memory_order(&self) -> [usize; 4] {
        match self {
            Format::Nchw => [0, 1, 2, 3],
            Format::Nhwc => [0, 2, 3, 1],
        }
    }

    /// The axis holding features: width for NCHW, channel for NHWC.
    pub fn unit_axis(&self) -> usize {
        match self {
            Format::Nchw => 3,
            Format::Nhwc => 1,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Nchw => write!(f, "NCHW"),
            Format::Nhwc => write!(f, "NHWC"),
        }
    }
}

/// Layout plus element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorType {
    pub format: Format,
    pub data_type: DataType,
}

impl TensorType {
    pub fn new(format: Format, data_type: DataType) -> Self {
        Self { format, data_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::Fp32.element_size(), Some(4));
        assert_eq!(DataType::Fp16.element_size(), Some(2));
        assert_eq!(DataType::QInt8.element_size(), Some(1));
        assert_eq!(DataType::QInt4.element_size(), None);
    }

    #[test]
    fn test_storage_bytes() {
        assert_eq!(DataType::Fp32.storage_bytes(10), 40);
        assert_eq!(DataType::Fp16.storage_bytes(10), 20);
        assert_eq!(DataType::QInt4.storage_bytes(5), 3);
        assert_eq!(DataType::QInt4.storage_bytes(6), 3);
    }

    #[test]
    fn test_dtype_categories() {
        assert!(DataType::Fp32.is_float());
        assert!(!DataType::Fp32.is_quantized());
        assert!(DataType::QInt8.is_quantized());
        assert!(!DataType::QInt4.is_float());
    }

    #[test]
    fn test_memory_order() {
        assert_eq!(Format::Nchw.memory_order(), [0, 1, 2, 3]);
        assert_eq!(Format::Nhwc.memory_order(), [0, 2, 3, 1]);
        assert_eq!(Format::Nchw.unit_axis(), 3);
        assert_eq!(Format::Nhwc.unit_axis(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DataType::Fp16), "fp16");
        assert_eq!(format!("{}", Format::Nhwc), "NHWC");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TensorType::new(Format::Nhwc, DataType::QInt8)).unwrap();
        assert_eq!(json, r#"{"format":"nhwc","data_type":"qint8"}"#);
    }
}
