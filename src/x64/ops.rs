// This module defines the x86-64 machine operations produced by instruction selection and
// their attribute payload. Address-capable operations share a fixed operand layout: base
// and index come first (holding the graph's NoReg value when unused), followed by the data
// operands and, last, the memory input. The addressing-mode descriptor (scale, numeric and
// symbolic offset, frame entity, flavour bits) lives in MachAttr beside the immediate, the
// load/store access width, conversion source mode, comparison relation and the pinned flag
// copied from the source memory operation. Opcode properties (commutativity, branch class,
// address-mode support, operand register classes) are answered by closed matches here.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::ir::{FrameEntity, Mode, Relation, SwitchTable};

/// x86-64 machine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X64Op {
    // integer binary, layout [base, index, left, right, mem]
    Add,
    Sub,
    IMul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Cmp,
    // integer unary, layout [base, index, value, mem]
    Inc,
    Dec,
    Neg,
    Not,
    Conv,
    // address computation, layout [base, index]
    Lea,
    // memory, layouts [base, index, mem] and [base, index, value, mem]
    Load,
    Store,
    Const,
    SymConst,
    /// Sign-extends the dividend into the high half, [value].
    Cltd,
    /// Unsigned division, [dividend, divisor, high, mem].
    Div,
    /// Signed division, [dividend, divisor, high, mem].
    IDiv,
    /// One-operand widening multiply, [left, right].
    Mul1,
    Setcc,
    /// [flags, if_false, if_true]
    CMov,
    Jmp,
    Jcc,
    SwitchJmp,
    /// [mem, values...]
    Ret,
    /// [mem, args...]
    Call,
    /// Keep-alive of its operands.
    Keep,
    Undef,
    // SSE
    XAdd,
    XSub,
    XMul,
    XDiv,
    XXor,
    XAnd,
    XCmp,
    XLoad,
    XStore,
    /// int -> float, [base, index, value, mem]
    Cvtsi2s,
    /// float -> int (truncating), [base, index, value, mem]
    Cvtts2si,
    /// float -> float, [base, index, value, mem]
    XConv,
    // x87
    FAdd,
    FSub,
    FMul,
    FDiv,
    /// Compare of two stack values into the integer flags.
    FCmp,
    FChs,
    FAbs,
    FLd,
    FSt,
    /// Integer load into the x87 unit, [base, index, mem].
    Fild,
    /// Truncating integer store from the x87 unit, [base, index, value, mem].
    Fist,
    Fldz,
    Fld1,
}

/// Which address modes an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmSupport {
    None,
    Source,
    Dest,
    Both,
}

impl AmSupport {
    pub fn source(self) -> bool {
        matches!(self, AmSupport::Source | AmSupport::Both)
    }

    pub fn dest(self) -> bool {
        matches!(self, AmSupport::Dest | AmSupport::Both)
    }
}

/// Register class an operand must live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gp,
    /// Count register of variable shifts.
    Rcx,
    Xmm,
    X87,
    Flags,
    /// Memory token.
    Mem,
    /// Anything, used by keep-alives.
    Any,
}

impl RegClass {
    pub fn name(self) -> &'static str {
        match self {
            RegClass::Gp => "gp",
            RegClass::Rcx => "rcx",
            RegClass::Xmm => "xmm",
            RegClass::X87 => "x87",
            RegClass::Flags => "flags",
            RegClass::Mem => "mem",
            RegClass::Any => "any",
        }
    }
}

impl X64Op {
    pub fn name(self) -> &'static str {
        match self {
            X64Op::Add => "x64_Add",
            X64Op::Sub => "x64_Sub",
            X64Op::IMul => "x64_IMul",
            X64Op::And => "x64_And",
            X64Op::Or => "x64_Or",
            X64Op::Xor => "x64_Xor",
            X64Op::Shl => "x64_Shl",
            X64Op::Shr => "x64_Shr",
            X64Op::Sar => "x64_Sar",
            X64Op::Rol => "x64_Rol",
            X64Op::Cmp => "x64_Cmp",
            X64Op::Inc => "x64_Inc",
            X64Op::Dec => "x64_Dec",
            X64Op::Neg => "x64_Neg",
            X64Op::Not => "x64_Not",
            X64Op::Conv => "x64_Conv",
            X64Op::Lea => "x64_Lea",
            X64Op::Load => "x64_Load",
            X64Op::Store => "x64_Store",
            X64Op::Const => "x64_Const",
            X64Op::SymConst => "x64_SymConst",
            X64Op::Cltd => "x64_Cltd",
            X64Op::Div => "x64_Div",
            X64Op::IDiv => "x64_IDiv",
            X64Op::Mul1 => "x64_Mul1",
            X64Op::Setcc => "x64_Setcc",
            X64Op::CMov => "x64_CMov",
            X64Op::Jmp => "x64_Jmp",
            X64Op::Jcc => "x64_Jcc",
            X64Op::SwitchJmp => "x64_SwitchJmp",
            X64Op::Ret => "x64_Ret",
            X64Op::Call => "x64_Call",
            X64Op::Keep => "x64_Keep",
            X64Op::Undef => "x64_Undef",
            X64Op::XAdd => "x64_xAdd",
            X64Op::XSub => "x64_xSub",
            X64Op::XMul => "x64_xMul",
            X64Op::XDiv => "x64_xDiv",
            X64Op::XXor => "x64_xXor",
            X64Op::XAnd => "x64_xAnd",
            X64Op::XCmp => "x64_xCmp",
            X64Op::XLoad => "x64_xLoad",
            X64Op::XStore => "x64_xStore",
            X64Op::Cvtsi2s => "x64_Cvtsi2s",
            X64Op::Cvtts2si => "x64_Cvtts2si",
            X64Op::XConv => "x64_xConv",
            X64Op::FAdd => "x64_fAdd",
            X64Op::FSub => "x64_fSub",
            X64Op::FMul => "x64_fMul",
            X64Op::FDiv => "x64_fDiv",
            X64Op::FCmp => "x64_fCmp",
            X64Op::FChs => "x64_fChs",
            X64Op::FAbs => "x64_fAbs",
            X64Op::FLd => "x64_fLd",
            X64Op::FSt => "x64_fSt",
            X64Op::Fild => "x64_fild",
            X64Op::Fist => "x64_fist",
            X64Op::Fldz => "x64_fldz",
            X64Op::Fld1 => "x64_fld1",
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            X64Op::Add
                | X64Op::IMul
                | X64Op::And
                | X64Op::Or
                | X64Op::Xor
                | X64Op::XAdd
                | X64Op::XMul
                | X64Op::XXor
                | X64Op::XAnd
                | X64Op::FAdd
                | X64Op::FMul
        )
    }

    /// Control flow instructions, scheduled last in their block.
    pub fn is_branch(self) -> bool {
        matches!(self, X64Op::Jmp | X64Op::Jcc | X64Op::SwitchJmp | X64Op::Ret)
    }

    /// Materializes a constant without inputs.
    pub fn is_const(self) -> bool {
        matches!(self, X64Op::Const | X64Op::SymConst | X64Op::Fldz | X64Op::Fld1)
    }

    pub fn is_load(self) -> bool {
        matches!(self, X64Op::Load | X64Op::XLoad | X64Op::FLd | X64Op::Fild)
    }

    pub fn is_store(self) -> bool {
        matches!(self, X64Op::Store | X64Op::XStore | X64Op::FSt | X64Op::Fist)
    }

    /// Operations with the `[base, index, left, right, mem]` layout.
    pub fn is_binop(self) -> bool {
        matches!(
            self,
            X64Op::Add
                | X64Op::Sub
                | X64Op::IMul
                | X64Op::And
                | X64Op::Or
                | X64Op::Xor
                | X64Op::Shl
                | X64Op::Shr
                | X64Op::Sar
                | X64Op::Rol
                | X64Op::Cmp
                | X64Op::XAdd
                | X64Op::XSub
                | X64Op::XMul
                | X64Op::XDiv
                | X64Op::XXor
                | X64Op::XAnd
                | X64Op::XCmp
                | X64Op::FAdd
                | X64Op::FSub
                | X64Op::FMul
                | X64Op::FDiv
                | X64Op::FCmp
        )
    }

    /// Operations with the `[base, index, value, mem]` layout.
    pub fn is_unop(self) -> bool {
        matches!(
            self,
            X64Op::Inc
                | X64Op::Dec
                | X64Op::Neg
                | X64Op::Not
                | X64Op::Conv
                | X64Op::Cvtsi2s
                | X64Op::Cvtts2si
                | X64Op::XConv
        )
    }

    /// Whether operands 0 and 1 are the base and index of an address.
    pub fn has_address(self) -> bool {
        self.is_binop() || self.is_unop() || self.is_load() || self.is_store() || self == X64Op::Lea
    }

    pub fn is_shift(self) -> bool {
        matches!(self, X64Op::Shl | X64Op::Shr | X64Op::Sar | X64Op::Rol)
    }

    pub fn am_support(self) -> AmSupport {
        match self {
            X64Op::Add | X64Op::Sub | X64Op::And | X64Op::Or | X64Op::Xor => AmSupport::Both,
            X64Op::Cmp | X64Op::IMul => AmSupport::Source,
            X64Op::Shl | X64Op::Shr | X64Op::Sar | X64Op::Rol => AmSupport::Dest,
            X64Op::Inc | X64Op::Dec | X64Op::Neg | X64Op::Not => AmSupport::Dest,
            X64Op::Conv => AmSupport::Source,
            X64Op::XAdd
            | X64Op::XSub
            | X64Op::XMul
            | X64Op::XDiv
            | X64Op::XXor
            | X64Op::XAnd
            | X64Op::XCmp
            | X64Op::Cvtsi2s
            | X64Op::Cvtts2si
            | X64Op::XConv => AmSupport::Source,
            _ => AmSupport::None,
        }
    }

    /// Register class of the operand at `pos`. Address slots are general purpose, memory
    /// inputs have the Mem class.
    pub fn operand_class(self, pos: usize) -> Option<RegClass> {
        let address = self.has_address() && pos < 2;
        if address {
            return Some(RegClass::Gp);
        }
        if self.fixed_mem_position() == Some(pos) {
            return Some(RegClass::Mem);
        }
        let class = match self {
            X64Op::Shl | X64Op::Shr | X64Op::Sar | X64Op::Rol if pos == 3 => RegClass::Rcx,
            X64Op::XAdd
            | X64Op::XSub
            | X64Op::XMul
            | X64Op::XDiv
            | X64Op::XXor
            | X64Op::XAnd
            | X64Op::XCmp
            | X64Op::XStore
            | X64Op::Cvtts2si
            | X64Op::XConv => RegClass::Xmm,
            X64Op::FAdd
            | X64Op::FSub
            | X64Op::FMul
            | X64Op::FDiv
            | X64Op::FCmp
            | X64Op::FChs
            | X64Op::FAbs
            | X64Op::FSt
            | X64Op::Fist => RegClass::X87,
            X64Op::Setcc | X64Op::Jcc => RegClass::Flags,
            X64Op::CMov if pos == 0 => RegClass::Flags,
            X64Op::Keep => RegClass::Any,
            X64Op::Ret | X64Op::Call if pos == 0 => RegClass::Mem,
            X64Op::Ret | X64Op::Call => RegClass::Any,
            _ => RegClass::Gp,
        };
        Some(class)
    }

    fn fixed_mem_position(self) -> Option<usize> {
        if self.is_binop() {
            Some(4)
        } else if self.is_unop() || self.is_store() {
            Some(3)
        } else if self.is_load() {
            Some(2)
        } else {
            match self {
                X64Op::Div | X64Op::IDiv => Some(3),
                X64Op::Ret | X64Op::Call => Some(0),
                _ => None,
            }
        }
    }

    /// Position of the memory input, if any.
    pub fn mem_position(self, arity: usize) -> Option<usize> {
        if self.has_address() && self != X64Op::Lea {
            return arity.checked_sub(1);
        }
        match self {
            X64Op::Div | X64Op::IDiv => Some(3),
            X64Op::Ret | X64Op::Call => Some(0),
            _ => None,
        }
    }
}

impl fmt::Display for X64Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which components of an address are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AmFlavour(u8);

impl AmFlavour {
    pub const NONE: AmFlavour = AmFlavour(0);
    pub const BASE: AmFlavour = AmFlavour(1);
    pub const INDEX: AmFlavour = AmFlavour(2);
    pub const OFFSET: AmFlavour = AmFlavour(4);
    pub const SCALE: AmFlavour = AmFlavour(8);

    pub fn contains(self, other: AmFlavour) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: AmFlavour) {
        self.0 &= !other.0;
    }

    /// Offset is the only component.
    pub fn is_offset_only(self) -> bool {
        self == AmFlavour::OFFSET
    }
}

impl BitOr for AmFlavour {
    type Output = AmFlavour;

    fn bitor(self, rhs: AmFlavour) -> AmFlavour {
        AmFlavour(self.0 | rhs.0)
    }
}

impl BitOrAssign for AmFlavour {
    fn bitor_assign(&mut self, rhs: AmFlavour) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AmFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        for (bit, c) in [
            (AmFlavour::BASE, 'B'),
            (AmFlavour::INDEX, 'I'),
            (AmFlavour::OFFSET, 'O'),
            (AmFlavour::SCALE, 'S'),
        ] {
            if self.contains(bit) {
                s.push(c);
            }
        }
        if s.is_empty() {
            s.push('-');
        }
        f.write_str(&s)
    }
}

/// Link-time symbol added to (or subtracted from) an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymOffset {
    pub name: String,
    pub negated: bool,
}

/// Addressing-mode descriptor. Base and index are operands 0 and 1 of the node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct AddrMode {
    /// log2 of the index scale, 0..=3.
    pub scale: u8,
    pub offset: i64,
    pub symbol: Option<SymOffset>,
    pub frame: Option<FrameEntity>,
    pub flavour: AmFlavour,
}

impl AddrMode {
    /// Same address components, ignoring the base/index operands.
    pub fn same_components(&self, other: &AddrMode) -> bool {
        self.scale == other.scale
            && self.offset == other.offset
            && self.symbol == other.symbol
            && self.frame == other.frame
    }
}

/// Immediate operand, possibly symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Immediate {
    pub value: i64,
    pub symbol: Option<String>,
}

impl Immediate {
    pub fn int(value: i64) -> Self {
        Self {
            value,
            symbol: None,
        }
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Self {
            value: 0,
            symbol: Some(name.into()),
        }
    }
}

/// How an address-capable operation accesses memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpType {
    #[default]
    Normal,
    /// Reads its right (or only) operand from the address.
    AmSource,
    /// Reads, operates on and writes back the address.
    AmDest,
}

/// Attribute payload of machine nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachAttr {
    pub am: AddrMode,
    pub op_type: OpType,
    pub imm: Option<Immediate>,
    /// Access width of memory operands.
    pub ls_mode: Option<Mode>,
    /// Source mode of conversions.
    pub src_mode: Option<Mode>,
    pub relation: Option<Relation>,
    /// Compare operands were swapped; consumers read the relation inversed.
    pub ins_permuted: bool,
    /// Compare of unsigned values.
    pub unsigned: bool,
    pub pinned: bool,
    /// A LEA was already merged into this load/store address.
    pub got_lea: bool,
    pub switch: Option<SwitchTable>,
    pub callee: Option<String>,
    pub float: Option<f64>,
}

impl MachAttr {
    pub fn with_imm(value: i64) -> Self {
        Self {
            imm: Some(Immediate::int(value)),
            ..Self::default()
        }
    }

    pub fn with_ls_mode(mode: Mode) -> Self {
        Self {
            ls_mode: Some(mode),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavour_bits() {
        let mut f = AmFlavour::BASE | AmFlavour::OFFSET;
        assert!(f.contains(AmFlavour::BASE));
        assert!(!f.contains(AmFlavour::INDEX));
        assert_eq!(f.to_string(), "BO");
        f.remove(AmFlavour::BASE);
        assert!(f.is_offset_only());
    }

    #[test]
    fn test_operand_layouts() {
        assert!(X64Op::Add.is_binop() && X64Op::Add.has_address());
        assert_eq!(X64Op::Add.mem_position(5), Some(4));
        assert_eq!(X64Op::Lea.mem_position(2), None);
        assert_eq!(X64Op::Shl.operand_class(3), Some(RegClass::Rcx));
        assert_eq!(X64Op::XAdd.operand_class(2), Some(RegClass::Xmm));
        assert_eq!(X64Op::XAdd.operand_class(0), Some(RegClass::Gp));
        assert_eq!(X64Op::Add.operand_class(4), Some(RegClass::Mem));
        assert_eq!(X64Op::Load.operand_class(2), Some(RegClass::Mem));
        assert!(X64Op::Cmp.am_support().source() && !X64Op::Cmp.am_support().dest());
        assert!(X64Op::Jcc.is_branch() && !X64Op::Call.is_branch());
    }
}
