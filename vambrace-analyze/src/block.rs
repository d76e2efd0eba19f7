use std::collections::BTreeSet;

use crate::instruction::{branch_destination, is_branch_mnemonic, Instruction};

/// ARM64 instructions are fixed-width.
const INSTRUCTION_SIZE: u64 = 4;

/// A maximal straight-line instruction range of a function.
///
/// `end_address` is exclusive: it is the address of the instruction *after*
/// the last instruction of the block.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct BasicBlock {
    /// Address of the first instruction of the block.
    pub start_address: u64,
    /// Address one past the last instruction of the block.
    pub end_address: u64,
}

impl BasicBlock {
    /// Whether the given address falls within this block.
    pub fn contains(&self, address: u64) -> bool {
        self.start_address <= address && address < self.end_address
    }
}

/// Partitions a function's instruction sequence into basic blocks.
///
/// The first instruction leads a block; every in-function branch target
/// leads a block, as does the instruction following such a branch. Branches
/// leaving the function (calls, tail calls) do not split: a function whose
/// only branches are outward yields a single block. Blocks are contiguous,
/// non-overlapping, returned in ascending address order, and their union
/// covers the whole instruction range.
pub fn compute_basic_blocks(instructions: &[Instruction]) -> Vec<BasicBlock> {
    let first = match instructions.first() {
        Some(first) => first,
        None => return Vec::new(),
    };
    let last = instructions.last().expect("nonempty");
    let function_end = last.address + INSTRUCTION_SIZE;

    let known_addresses: BTreeSet<u64> =
        instructions.iter().map(|instruction| instruction.address).collect();

    let mut leaders = BTreeSet::new();
    leaders.insert(first.address);

    for (index, instruction) in instructions.iter().enumerate() {
        if !is_branch_mnemonic(&instruction.mnemonic) {
            continue;
        }
        if let Some(destination) = branch_destination(instruction) {
            if known_addresses.contains(&destination) {
                leaders.insert(destination);
                if let Some(next) = instructions.get(index + 1) {
                    leaders.insert(next.address);
                }
            }
        }
    }

    let leaders: Vec<u64> = leaders.into_iter().collect();
    leaders
        .iter()
        .enumerate()
        .map(|(index, &start_address)| BasicBlock {
            start_address,
            end_address: leaders.get(index + 1).copied().unwrap_or(function_end),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Operand;

    fn linear(mnemonics: &[(&str, Option<u64>)], base: u64) -> Vec<Instruction> {
        mnemonics
            .iter()
            .enumerate()
            .map(|(index, (mnemonic, target))| Instruction {
                address: base + index as u64 * 4,
                mnemonic: (*mnemonic).into(),
                operands: target.map(|t| Operand::Imm(t as i64)).into_iter().collect(),
            })
            .collect()
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let instructions = linear(
            &[("sub", None), ("stp", None), ("mov", None), ("ret", None)],
            0x100004000,
        );
        let blocks = compute_basic_blocks(&instructions);
        assert_eq!(
            blocks,
            vec![BasicBlock {
                start_address: 0x100004000,
                end_address: 0x100004010
            }]
        );
    }

    #[test]
    fn test_trailing_tail_call_is_one_block() {
        // an unconditional jump as the last instruction adds no leader
        let instructions = linear(
            &[("mov", None), ("mov", None), ("b", Some(0x100009000))],
            0x100004000,
        );
        let blocks = compute_basic_blocks(&instructions);
        assert_eq!(
            blocks,
            vec![BasicBlock {
                start_address: 0x100004000,
                end_address: 0x10000400c
            }]
        );
    }

    #[test]
    fn test_forward_branch_splits_blocks() {
        let instructions = linear(
            &[
                ("cmp", None),
                ("b.ne", Some(0x100004010)),
                ("mov", None),
                ("orr", None),
                ("ret", None),
            ],
            0x100004000,
        );
        let blocks = compute_basic_blocks(&instructions);
        assert_eq!(
            blocks,
            vec![
                BasicBlock {
                    start_address: 0x100004000,
                    end_address: 0x100004008
                },
                BasicBlock {
                    start_address: 0x100004008,
                    end_address: 0x100004010
                },
                BasicBlock {
                    start_address: 0x100004010,
                    end_address: 0x100004014
                },
            ]
        );
    }

    #[test]
    fn test_backward_branch_target_leads_block() {
        let instructions = linear(
            &[
                ("mov", None),
                ("add", None),
                ("cmp", None),
                ("b.lt", Some(0x100004004)),
                ("ret", None),
            ],
            0x100004000,
        );
        let blocks = compute_basic_blocks(&instructions);
        assert_eq!(
            blocks,
            vec![
                BasicBlock {
                    start_address: 0x100004000,
                    end_address: 0x100004004
                },
                BasicBlock {
                    start_address: 0x100004004,
                    end_address: 0x100004010
                },
                BasicBlock {
                    start_address: 0x100004010,
                    end_address: 0x100004014
                },
            ]
        );
    }

    #[test]
    fn test_blocks_are_contiguous_and_cover_range() {
        let instructions = linear(
            &[
                ("cbz", Some(0x100004014)),
                ("mov", None),
                ("bl", Some(0x100020000)),
                ("mov", None),
                ("b", Some(0x100004018)),
                ("mov", None),
                ("ret", None),
            ],
            0x100004000,
        );
        let blocks = compute_basic_blocks(&instructions);

        assert_eq!(blocks.first().unwrap().start_address, 0x100004000);
        assert_eq!(blocks.last().unwrap().end_address, 0x10000401c);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end_address, pair[1].start_address);
            assert!(pair[0].start_address < pair[1].start_address);
        }
    }
}
