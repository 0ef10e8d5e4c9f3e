// This module defines the machine modes carried by every graph node. A mode is the result
// type of a node: integer widths with signedness, the two float widths, a 64-bit reference
// mode for pointers, and the token modes used for tuples, memory ordering, control flow and
// condition flags. Modes drive operand legality checks after selection, the width-class
// bucketing of conversions and the access width recorded on loads and stores.

use std::fmt;
use std::str::FromStr;

/// Result type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// 64-bit reference (pointer) value.
    Ptr,
    /// Multi-result value, consumed through projections.
    Tuple,
    /// Memory ordering token.
    Mem,
    /// Control flow token.
    Ctrl,
    /// Boolean / condition flags.
    Bool,
    /// Result-less bookkeeping nodes (keep-alives).
    Any,
}

impl Mode {
    /// Width in bits of data modes, 0 for token modes.
    pub fn bits(self) -> u32 {
        match self {
            Mode::I8 | Mode::U8 => 8,
            Mode::I16 | Mode::U16 => 16,
            Mode::I32 | Mode::U32 | Mode::F32 => 32,
            Mode::I64 | Mode::U64 | Mode::F64 | Mode::Ptr => 64,
            Mode::Bool => 1,
            Mode::Tuple | Mode::Mem | Mode::Ctrl | Mode::Any => 0,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            Mode::I8
                | Mode::I16
                | Mode::I32
                | Mode::I64
                | Mode::U8
                | Mode::U16
                | Mode::U32
                | Mode::U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Mode::I8 | Mode::I16 | Mode::I32 | Mode::I64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Mode::F32 | Mode::F64)
    }

    pub fn is_reference(self) -> bool {
        self == Mode::Ptr
    }

    /// Integer or reference, i.e. lives in a general purpose register.
    pub fn is_int_like(self) -> bool {
        self.is_int() || self.is_reference()
    }

    /// Any value mode (integer, reference, float).
    pub fn is_data(self) -> bool {
        self.is_int_like() || self.is_float()
    }

    /// Data or boolean.
    pub fn is_datab(self) -> bool {
        self.is_data() || self == Mode::Bool
    }

    /// Integer mode with the given width and signedness.
    pub fn int(bits: u32, signed: bool) -> Option<Mode> {
        Some(match (bits, signed) {
            (8, true) => Mode::I8,
            (16, true) => Mode::I16,
            (32, true) => Mode::I32,
            (64, true) => Mode::I64,
            (8, false) => Mode::U8,
            (16, false) => Mode::U16,
            (32, false) => Mode::U32,
            (64, false) => Mode::U64,
            _ => return None,
        })
    }

    /// Same width, signed flavour. References map to `I64`.
    pub fn to_signed(self) -> Mode {
        match self {
            Mode::U8 => Mode::I8,
            Mode::U16 => Mode::I16,
            Mode::U32 => Mode::I32,
            Mode::U64 | Mode::Ptr => Mode::I64,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::I8 => "i8",
            Mode::I16 => "i16",
            Mode::I32 => "i32",
            Mode::I64 => "i64",
            Mode::U8 => "u8",
            Mode::U16 => "u16",
            Mode::U32 => "u32",
            Mode::U64 => "u64",
            Mode::F32 => "f32",
            Mode::F64 => "f64",
            Mode::Ptr => "ptr",
            Mode::Tuple => "T",
            Mode::Mem => "M",
            Mode::Ctrl => "X",
            Mode::Bool => "b",
            Mode::Any => "any",
        }
    }

    /// Truncates `value` to this mode's width and re-extends it per signedness.
    pub fn wrap(self, value: i64) -> i64 {
        let bits = self.bits();
        if bits == 0 || bits >= 64 {
            return value;
        }
        let shift = 64 - bits;
        if self.is_signed() {
            (value << shift) >> shift
        } else {
            ((value as u64) << shift >> shift) as i64
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "i8" => Mode::I8,
            "i16" => Mode::I16,
            "i32" => Mode::I32,
            "i64" => Mode::I64,
            "u8" => Mode::U8,
            "u16" => Mode::U16,
            "u32" => Mode::U32,
            "u64" => Mode::U64,
            "f32" => Mode::F32,
            "f64" => Mode::F64,
            "ptr" => Mode::Ptr,
            "T" => Mode::Tuple,
            "M" => Mode::Mem,
            "X" => Mode::Ctrl,
            "b" => Mode::Bool,
            "any" => Mode::Any,
            other => return Err(format!("Unknown mode '{}'", other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_respects_signedness() {
        assert_eq!(Mode::I8.wrap(0xff), -1);
        assert_eq!(Mode::U8.wrap(0x1ff), 0xff);
        assert_eq!(Mode::I32.wrap(0x8000_0000), -0x8000_0000);
        assert_eq!(Mode::I64.wrap(-5), -5);
    }

    #[test]
    fn test_mode_round_trips_through_name() {
        for mode in [Mode::I16, Mode::U64, Mode::F32, Mode::Ptr, Mode::Bool] {
            assert_eq!(mode.name().parse::<Mode>().unwrap(), mode);
        }
        assert!("i128".parse::<Mode>().is_err());
    }
}
