//! Backward register data-flow over a function's instruction stream.
//!
//! The resolver answers one narrow question: what does a register hold
//! immediately before a given instruction executes? It walks the
//! straight-line predecessor path back to the function entry, folding the
//! small set of recognized defining instructions (`mov` immediates, register
//! copies, `adrp` page materializations with `add`/`ldr` fix-ups, and `ldr`
//! chains through already-resolved immediate bases). No join across block
//! boundaries is attempted; anything the walk cannot prove is
//! [`RegisterContents::Unknown`], never an error.

use crate::instruction::{is_branch_mnemonic, Instruction, InstructionDecoder};

/// The provable contents of a register at a program point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterContents {
    /// The register provably holds this value.
    Immediate(u64),
    /// The register holds the unmodified k-th function argument (`x0..x7`).
    FunctionArg(u8),
    /// Nothing could be proven.
    Unknown,
}

/// An operation to replay, in program order, once the base value is known.
enum PendingOp {
    Add(i64),
    Deref(i64),
}

/// Resolves the contents of `register` immediately before
/// `instructions[at_index]` executes.
///
/// `read_pointer` reads a pointer-sized word from an initialized data
/// section, returning `None` outside of one.
pub(crate) fn resolve_register(
    instructions: &[Instruction],
    at_index: usize,
    register: &str,
    decoder: &dyn InstructionDecoder,
    read_pointer: &dyn Fn(u64) -> Option<u64>,
) -> RegisterContents {
    let mut target = canonical_register(register);
    let mut pending: Vec<PendingOp> = Vec::new();

    let reg_name = |id: u16| -> Option<String> {
        decoder.reg_name(id).map(|name| canonical_register(&name))
    };

    for instruction in instructions[..at_index].iter().rev() {
        let mnemonic = instruction.mnemonic.as_str();

        // branches, stores and compares read their first operand
        if is_branch_mnemonic(mnemonic)
            || mnemonic.starts_with("st")
            || matches!(mnemonic, "cmp" | "cmn" | "tst" | "ccmp" | "ret")
        {
            continue;
        }

        let dst = instruction.reg_operand(0).and_then(reg_name);

        if mnemonic == "ldp" {
            // both destinations are overwritten; neither is foldable
            let dst1 = instruction.reg_operand(1).and_then(reg_name);
            if dst.as_deref() == Some(target.as_str()) || dst1.as_deref() == Some(target.as_str())
            {
                return RegisterContents::Unknown;
            }
            continue;
        }

        if dst.as_deref() != Some(target.as_str()) {
            continue;
        }

        match mnemonic {
            "mov" | "movz" => {
                if let Some(value) = instruction.imm_operand(1) {
                    return apply(value as u64, &pending, read_pointer);
                }
                match instruction.reg_operand(1).and_then(reg_name) {
                    Some(src) if src == "xzr" => {
                        return apply(0, &pending, read_pointer);
                    }
                    Some(src) => {
                        target = src;
                    }
                    None => return RegisterContents::Unknown,
                }
            }
            "adrp" | "adr" => match instruction.imm_operand(1) {
                Some(page) => return apply(page as u64, &pending, read_pointer),
                None => return RegisterContents::Unknown,
            },
            "add" => {
                // only `add Rd, Rn, #imm` folds
                match (
                    instruction.reg_operand(1).and_then(reg_name),
                    instruction.imm_operand(2),
                ) {
                    (Some(src), Some(offset)) => {
                        pending.push(PendingOp::Add(offset));
                        target = src;
                    }
                    _ => return RegisterContents::Unknown,
                }
            }
            "ldr" => {
                if let Some((base, displacement)) = instruction.mem_operand(1) {
                    match reg_name(base) {
                        Some(src) => {
                            pending.push(PendingOp::Deref(displacement));
                            target = src;
                        }
                        None => return RegisterContents::Unknown,
                    }
                } else if let Some(literal) = instruction.imm_operand(1) {
                    // pc-relative literal load
                    pending.push(PendingOp::Deref(0));
                    return apply(literal as u64, &pending, read_pointer);
                } else {
                    return RegisterContents::Unknown;
                }
            }
            // any other definition of the traced register
            _ => return RegisterContents::Unknown,
        }
    }

    // reached the function entry with the trace still live
    if pending.is_empty() {
        if let Some(index) = argument_register_index(&target) {
            return RegisterContents::FunctionArg(index);
        }
    }
    RegisterContents::Unknown
}

/// Replays the pending operations on top of a known base value. Pending ops
/// were pushed walking backward, so program order is the reverse.
fn apply(
    base: u64,
    pending: &[PendingOp],
    read_pointer: &dyn Fn(u64) -> Option<u64>,
) -> RegisterContents {
    let mut value = base;
    for op in pending.iter().rev() {
        match op {
            PendingOp::Add(offset) => value = value.wrapping_add(*offset as u64),
            PendingOp::Deref(displacement) => {
                match read_pointer(value.wrapping_add(*displacement as u64)) {
                    Some(loaded) => value = loaded,
                    None => return RegisterContents::Unknown,
                }
            }
        }
    }
    RegisterContents::Immediate(value)
}

/// Normalizes a register name: lower-case, with 32-bit `wN` views folded
/// onto their 64-bit `xN` registers.
fn canonical_register(name: &str) -> String {
    let name = name.to_ascii_lowercase();
    if let Some(rest) = name.strip_prefix('w') {
        if rest.chars().all(|c| c.is_ascii_digit()) {
            return format!("x{rest}");
        }
    }
    match name.as_str() {
        "lr" => "x30".into(),
        "fp" => "x29".into(),
        "wzr" => "xzr".into(),
        _ => name,
    }
}

/// The argument slot of a register name, for `x0..x7`.
fn argument_register_index(name: &str) -> Option<u8> {
    let index: u8 = name.strip_prefix('x')?.parse().ok()?;
    (index < 8).then_some(index)
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::collections::HashMap;

    use super::*;
    use crate::instruction::{Instruction, Operand};

    /// Names registers `x0..x30`, `xzr` and `sp` by id, like the real
    /// decoder does.
    struct NameDecoder;

    impl InstructionDecoder for NameDecoder {
        fn decode(&self, _bytes: &[u8], _base_address: u64) -> Vec<Instruction> {
            Vec::new()
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

    fn ins(address: u64, mnemonic: &str, operands: Vec<Operand>) -> Instruction {
        Instruction {
            address,
            mnemonic: mnemonic.into(),
            operands,
        }
    }

    fn resolve(
        instructions: &[Instruction],
        register: &str,
        memory: &HashMap<u64, u64>,
    ) -> RegisterContents {
        let read = |address: u64| memory.get(&address).copied();
        resolve_register(
            instructions,
            instructions.len() - 1,
            register,
            &NameDecoder,
            &read,
        )
    }

    #[test]
    fn test_mov_immediate() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(2), Operand::Imm(0x2a)]),
            ins(0x1004, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x2", &HashMap::new()),
            RegisterContents::Immediate(0x2a)
        );
    }

    #[test]
    fn test_register_copy_chain_to_immediate() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(8), Operand::Imm(7)]),
            ins(0x1004, "mov", vec![Operand::Reg(2), Operand::Reg(8)]),
            ins(0x1008, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x2", &HashMap::new()),
            RegisterContents::Immediate(7)
        );
    }

    #[test]
    fn test_unmodified_function_argument() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(20), Operand::Reg(3)]),
            ins(0x1004, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x20", &HashMap::new()),
            RegisterContents::FunctionArg(3)
        );
        // x0 untouched along the path
        assert_eq!(
            resolve(&instructions, "x0", &HashMap::new()),
            RegisterContents::FunctionArg(0)
        );
    }

    #[test]
    fn test_adrp_add_pair() {
        let instructions = vec![
            ins(0x1000, "adrp", vec![Operand::Reg(1), Operand::Imm(0x100008000)]),
            ins(
                0x1004,
                "add",
                vec![Operand::Reg(1), Operand::Reg(1), Operand::Imm(0x30)],
            ),
            ins(0x1008, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x1", &HashMap::new()),
            RegisterContents::Immediate(0x100008030)
        );
    }

    #[test]
    fn test_adrp_ldr_chain_through_memory() {
        let memory = HashMap::from([(0x100008010u64, 0x100005028u64)]);
        let instructions = vec![
            ins(0x1000, "adrp", vec![Operand::Reg(8), Operand::Imm(0x100008000)]),
            ins(
                0x1004,
                "ldr",
                vec![
                    Operand::Reg(8),
                    Operand::Mem {
                        base: 8,
                        displacement: 0x10,
                    },
                ],
            ),
            ins(0x1008, "blr", vec![Operand::Reg(8)]),
        ];
        assert_eq!(
            resolve(&instructions, "x8", &memory),
            RegisterContents::Immediate(0x100005028)
        );
    }

    #[test]
    fn test_load_outside_data_sections_is_unknown() {
        let instructions = vec![
            ins(0x1000, "adrp", vec![Operand::Reg(8), Operand::Imm(0x100008000)]),
            ins(
                0x1004,
                "ldr",
                vec![
                    Operand::Reg(8),
                    Operand::Mem {
                        base: 8,
                        displacement: 0x10,
                    },
                ],
            ),
            ins(0x1008, "blr", vec![Operand::Reg(8)]),
        ];
        assert_eq!(
            resolve(&instructions, "x8", &HashMap::new()),
            RegisterContents::Unknown
        );
    }

    #[test]
    fn test_unrecognized_definition_is_unknown() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(2), Operand::Imm(5)]),
            ins(
                0x1004,
                "mul",
                vec![Operand::Reg(2), Operand::Reg(2), Operand::Reg(3)],
            ),
            ins(0x1008, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x2", &HashMap::new()),
            RegisterContents::Unknown
        );
    }

    #[test]
    fn test_stores_and_compares_are_transparent() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(2), Operand::Imm(9)]),
            ins(
                0x1004,
                "str",
                vec![
                    Operand::Reg(2),
                    Operand::Mem {
                        base: 32,
                        displacement: 16,
                    },
                ],
            ),
            ins(0x1008, "cmp", vec![Operand::Reg(2), Operand::Imm(0)]),
            ins(0x100c, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x2", &HashMap::new()),
            RegisterContents::Immediate(9)
        );
    }

    #[test]
    fn test_zero_register_copy() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(2), Operand::Reg(31)]),
            ins(0x1004, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "x2", &HashMap::new()),
            RegisterContents::Immediate(0)
        );
    }

    #[test]
    fn test_w_register_aliases_x_register() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(4), Operand::Imm(0x11)]),
            ins(0x1004, "bl", vec![Operand::Imm(0x9000)]),
        ];
        assert_eq!(
            resolve(&instructions, "w4", &HashMap::new()),
            RegisterContents::Immediate(0x11)
        );
    }

    #[test]
    fn test_repeated_queries_are_deterministic() {
        let instructions = vec![
            ins(0x1000, "mov", vec![Operand::Reg(2), Operand::Imm(1)]),
            ins(0x1004, "bl", vec![Operand::Imm(0x9000)]),
        ];
        let first = resolve(&instructions, "x2", &HashMap::new());
        for _ in 0..8 {
            assert_eq!(resolve(&instructions, "x2", &HashMap::new()), first);
        }
    }
}
