//! A canned stand-in for the external ARM64 instruction decoder.

use std::borrow::Cow;
use std::collections::HashMap;

use vambrace_analyze::{Instruction, InstructionDecoder, Operand};

/// An [`InstructionDecoder`] that returns pre-built instruction lists keyed
/// by decode base address, and names registers the way the real decoder
/// does (`x0..x30`, `xzr`, `sp`).
#[derive(Default)]
pub struct FixtureDecoder {
    functions: HashMap<u64, Vec<Instruction>>,
}

impl FixtureDecoder {
    /// A decoder with no functions registered.
    pub fn new() -> Self {
        FixtureDecoder::default()
    }

    /// Registers the instruction sequence decoded at `entry`.
    pub fn add_function(&mut self, entry: u64, instructions: Vec<Instruction>) -> &mut Self {
        self.functions.insert(entry, instructions);
        self
    }
}

impl InstructionDecoder for FixtureDecoder {
    fn decode(&self, _bytes: &[u8], base_address: u64) -> Vec<Instruction> {
        self.functions
            .get(&base_address)
            .cloned()
            .unwrap_or_default()
    }

    fn reg_name(&self, reg: u16) -> Option<Cow<'_, str>> {
        match reg {
            0..=30 => Some(Cow::Owned(format!("x{reg}"))),
            31 => Some(Cow::Borrowed("xzr")),
            32 => Some(Cow::Borrowed("sp")),
            _ => None,
        }
    }
}

/// Builds an [`Instruction`] for fixture functions.
pub fn ins(address: u64, mnemonic: &str, operands: Vec<Operand>) -> Instruction {
    Instruction {
        address,
        mnemonic: mnemonic.into(),
        operands,
    }
}

/// A register operand, by fixture-decoder id (`0..=30` are `x0..x30`).
pub fn reg(id: u16) -> Operand {
    Operand::Reg(id)
}

/// An immediate operand.
pub fn imm(value: i64) -> Operand {
    Operand::Imm(value)
}

/// A base-plus-displacement memory operand.
pub fn mem(base: u16, displacement: i64) -> Operand {
    Operand::Mem { base, displacement }
}
