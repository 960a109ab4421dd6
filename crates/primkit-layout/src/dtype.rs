//! Element data types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Element type of a tensor or attribute buffer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Undef,
    F64,
    F32,
    F16,
    Bf16,
    F8E5m2,
    F8E4m3,
    U32,
    S32,
    S8,
    U8,
    S4,
    U4,
}

impl DataType {
    pub const ALL: [DataType; 12] = [
        DataType::F64,
        DataType::F32,
        DataType::F16,
        DataType::Bf16,
        DataType::F8E5m2,
        DataType::F8E4m3,
        DataType::U32,
        DataType::S32,
        DataType::S8,
        DataType::U8,
        DataType::S4,
        DataType::U4,
    ];

    /// Width in bits.
    pub fn bits(&self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F64 => 64,
            DataType::F32 | DataType::U32 | DataType::S32 => 32,
            DataType::F16 | DataType::Bf16 => 16,
            DataType::F8E5m2 | DataType::F8E4m3 | DataType::S8 | DataType::U8 => 8,
            DataType::S4 | DataType::U4 => 4,
        }
    }

    /// Storage size in bytes of one element, rounded up.
    pub fn size(&self) -> usize {
        self.bits().div_ceil(8)
    }

    /// Byte count for `n` packed elements.
    pub fn size_of(&self, n: usize) -> usize {
        (n * self.bits()).div_ceil(8)
    }

    pub fn is_signed(&self) -> bool {
        !matches!(
            self,
            DataType::U32 | DataType::U8 | DataType::U4 | DataType::Undef
        )
    }

    pub fn is_int(&self) -> bool {
        matches!(
            self,
            DataType::U32
                | DataType::S32
                | DataType::S8
                | DataType::U8
                | DataType::S4
                | DataType::U4
        )
    }

    pub fn is_fp(&self) -> bool {
        matches!(
            self,
            DataType::F64
                | DataType::F32
                | DataType::F16
                | DataType::Bf16
                | DataType::F8E5m2
                | DataType::F8E4m3
        )
    }

    /// True for 8-bit integer types used by quantized kernels.
    pub fn is_int8(&self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Undef => "undef",
            DataType::F64 => "f64",
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::F8E5m2 => "f8_e5m2",
            DataType::F8E4m3 => "f8_e4m3",
            DataType::U32 => "u32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
            DataType::S4 => "s4",
            DataType::U4 => "u4",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "undef" {
            return Ok(DataType::Undef);
        }
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.name() == s)
            .ok_or_else(|| format!("unknown data type '{s}'"))
    }
}
