// This module models x86-64 registers for emission. An AsmReg is a (bank, id) pair as in the
// register file of a classic fast backend: bank 0 holds the sixteen general purpose
// registers, bank 1 the sixteen XMM registers. Registers convert to and from the iced-x86
// Register enum, which is the crate's canonical register identity, and render with the GAS
// names of the requested access width. A RegisterMap is the hand-off point from a register
// allocator to the emitter: it maps value nodes to the register they were assigned.

use std::collections::HashMap;

use iced_x86::Register;

use crate::ir::{Mode, NodeId};

pub type RegBank = u8;
pub type RegId = u8;

pub const GP_BANK: RegBank = 0;
pub const XMM_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

const GP64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const GP32_NAMES: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
    "r12d", "r13d", "r14d", "r15d",
];
const GP16_NAMES: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
    "r13w", "r14w", "r15w",
];
const GP8_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);

    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self::new(GP_BANK, id)
    }

    pub const fn xmm(id: RegId) -> Self {
        Self::new(XMM_BANK, id)
    }

    /// The iced-x86 register for an access of `bits` width.
    pub fn to_iced(self, bits: u32) -> Option<Register> {
        let id = self.id as usize;
        if id >= 16 {
            return None;
        }
        match self.bank {
            GP_BANK => Some(match bits {
                8 => GP8[id],
                16 => GP16[id],
                32 => GP32[id],
                _ => GP64[id],
            }),
            XMM_BANK => Some(XMM[id]),
            _ => None,
        }
    }

    /// Register identity of an iced-x86 register of any width.
    pub fn from_iced(reg: Register) -> Option<Self> {
        let find = |table: &[Register; 16]| table.iter().position(|&r| r == reg);
        if let Some(id) = [&GP64, &GP32, &GP16, &GP8].into_iter().find_map(find) {
            return Some(AsmReg::gp(id as RegId));
        }
        find(&XMM).map(|id| AsmReg::xmm(id as RegId))
    }

    /// GAS name (without `%`) for an access of `bits` width.
    pub fn name(self, bits: u32) -> &'static str {
        let id = (self.id as usize).min(15);
        match self.bank {
            XMM_BANK => XMM_NAMES[id],
            _ => match bits {
                8 => GP8_NAMES[id],
                16 => GP16_NAMES[id],
                32 => GP32_NAMES[id],
                _ => GP64_NAMES[id],
            },
        }
    }
}

/// Register assignment produced by a register allocator.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    regs: HashMap<NodeId, AsmReg>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, value: NodeId, reg: AsmReg) {
        self.regs.insert(value, reg);
    }

    /// Assigns from an iced-x86 register; returns false for registers outside the model.
    pub fn assign_iced(&mut self, value: NodeId, reg: Register) -> bool {
        match AsmReg::from_iced(reg) {
            Some(asm) => {
                self.regs.insert(value, asm);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, value: NodeId) -> Option<AsmReg> {
        self.regs.get(&value).copied()
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

/// Width used to name a register holding a value of `mode`.
pub fn mode_reg_bits(mode: Mode) -> u32 {
    match mode.bits() {
        8 => 8,
        16 => 16,
        32 => 32,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names_by_width() {
        assert_eq!(AsmReg::RAX.name(64), "rax");
        assert_eq!(AsmReg::RAX.name(32), "eax");
        assert_eq!(AsmReg::gp(9).name(8), "r9b");
        assert_eq!(AsmReg::xmm(3).name(64), "xmm3");
    }

    #[test]
    fn test_iced_round_trip() {
        assert_eq!(AsmReg::gp(2).to_iced(32), Some(Register::EDX));
        assert_eq!(AsmReg::from_iced(Register::R11W), Some(AsmReg::gp(11)));
        assert_eq!(AsmReg::from_iced(Register::XMM7), Some(AsmReg::xmm(7)));
        assert_eq!(AsmReg::from_iced(Register::CS), None);

        let mut map = RegisterMap::new();
        assert!(map.assign_iced(NodeId(4), Register::RCX));
        assert_eq!(map.get(NodeId(4)), Some(AsmReg::RCX));
    }
}
