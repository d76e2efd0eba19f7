use std::borrow::Cow;

use vambrace_objc::ObjcSelector;

/// One operand of a decoded instruction.
///
/// Operand kinds form a closed set; consumers pattern-match at use sites.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    /// A register, by decoder-assigned id.
    Reg(u16),
    /// An immediate value.
    Imm(i64),
    /// A base-register memory reference with displacement.
    Mem {
        /// Decoder-assigned id of the base register.
        base: u16,
        /// Byte displacement from the base register.
        displacement: i64,
    },
}

/// A decoded instruction as produced by the external decoder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    /// Virtual address of the instruction.
    pub address: u64,
    /// Lower-case mnemonic.
    pub mnemonic: String,
    /// Operand list in architectural order.
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// The register id of operand `index`, if it is a register.
    pub fn reg_operand(&self, index: usize) -> Option<u16> {
        match self.operands.get(index) {
            Some(Operand::Reg(reg)) => Some(*reg),
            _ => None,
        }
    }

    /// The immediate value of operand `index`, if it is an immediate.
    pub fn imm_operand(&self, index: usize) -> Option<i64> {
        match self.operands.get(index) {
            Some(Operand::Imm(value)) => Some(*value),
            _ => None,
        }
    }

    /// The memory operand at `index`, if it is a memory reference.
    pub fn mem_operand(&self, index: usize) -> Option<(u16, i64)> {
        match self.operands.get(index) {
            Some(Operand::Mem { base, displacement }) => Some((*base, *displacement)),
            _ => None,
        }
    }
}

/// The external ARM64 instruction decoder consumed by the analyzer.
///
/// The analysis core never decodes machine code itself; clients plug in a
/// decoder that yields `(address, mnemonic, operands)` triples for a byte
/// range and can name registers by id.
pub trait InstructionDecoder: Send + Sync {
    /// Decodes `bytes` into the instruction sequence starting at
    /// `base_address`.
    fn decode(&self, bytes: &[u8], base_address: u64) -> Vec<Instruction>;

    /// The architectural name of a register id (e.g. `"x1"`).
    fn reg_name(&self, reg: u16) -> Option<Cow<'_, str>>;
}

/// Whether the mnemonic is a branch, conditional or unconditional, including
/// calls and dynamic-register branches.
pub fn is_branch_mnemonic(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "b" | "bl" | "br" | "blr" | "cbz" | "cbnz" | "tbz" | "tbnz"
    ) || mnemonic.starts_with("b.")
}

/// The immediate branch destination of an instruction, if it has one.
///
/// Conditional forms carry the target as their final operand; dynamic
/// register branches (`br`, `blr`) have none.
pub fn branch_destination(instruction: &Instruction) -> Option<u64> {
    if !is_branch_mnemonic(&instruction.mnemonic) {
        return None;
    }
    match instruction.operands.last() {
        Some(Operand::Imm(value)) => Some(*value as u64),
        _ => None,
    }
}

/// An instruction wrapped with the semantic tags the analyzer could attach.
///
/// For branches, `destination_address` holds the immediate target;
/// `symbol` names the imported callee when the target is a `__stubs`
/// trampoline, and `selector` carries the recovered Objective-C selector for
/// message-send dispatch calls.
#[derive(Clone, Debug)]
pub struct WrappedInstruction {
    /// The underlying instruction.
    pub instruction: Instruction,
    /// Immediate branch target, when present.
    pub destination_address: Option<u64>,
    /// Name of the external callee, when the target is a symbol stub.
    pub symbol: Option<String>,
    /// The selector passed to an Objective-C dispatch call, when recovered.
    pub selector: Option<ObjcSelector>,
}

impl WrappedInstruction {
    /// Whether the wrapped instruction is any kind of branch.
    pub fn is_branch(&self) -> bool {
        is_branch_mnemonic(&self.instruction.mnemonic)
    }

    /// Whether this is a call through the Objective-C dispatch machinery.
    pub fn is_msg_send(&self) -> bool {
        matches!(
            self.symbol.as_deref(),
            Some("_objc_msgSend") | Some("_objc_msgSendSuper2")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(mnemonic: &str, operands: Vec<Operand>) -> Instruction {
        Instruction {
            address: 0x1000,
            mnemonic: mnemonic.into(),
            operands,
        }
    }

    #[test]
    fn test_branch_mnemonics() {
        assert!(is_branch_mnemonic("b"));
        assert!(is_branch_mnemonic("b.ne"));
        assert!(is_branch_mnemonic("cbz"));
        assert!(is_branch_mnemonic("blr"));
        assert!(!is_branch_mnemonic("mov"));
        assert!(!is_branch_mnemonic("bic"));
    }

    #[test]
    fn test_branch_destination() {
        let direct = ins("b", vec![Operand::Imm(0x2000)]);
        assert_eq!(branch_destination(&direct), Some(0x2000));

        let conditional = ins("cbz", vec![Operand::Reg(0), Operand::Imm(0x2010)]);
        assert_eq!(branch_destination(&conditional), Some(0x2010));

        let dynamic = ins("blr", vec![Operand::Reg(8)]);
        assert_eq!(branch_destination(&dynamic), None);

        let not_a_branch = ins("mov", vec![Operand::Reg(0), Operand::Imm(1)]);
        assert_eq!(branch_destination(&not_a_branch), None);
    }
}
