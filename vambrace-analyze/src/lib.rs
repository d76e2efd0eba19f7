//! Function-level analysis over parsed Mach-O slices.
//!
//! [`MachoAnalyzer`] binds a parsed slice to its Objective-C metadata and
//! hands out immutable per-function views ([`FunctionAnalyzer`]) on demand.
//! A function view owns the function's decoded instruction list and its
//! basic-block partition, and answers register-content queries through a
//! backward data-flow walk.
//!
//! Instruction decoding itself is delegated to an external collaborator
//! through the [`InstructionDecoder`] trait; any decoder able to produce
//! `(address, mnemonic, operands)` triples and register names can drive the
//! analysis.

#![warn(missing_docs)]

mod analyzer;
mod block;
mod dataflow;
mod function;
mod instruction;

pub use analyzer::MachoAnalyzer;
pub use block::{compute_basic_blocks, BasicBlock};
pub use dataflow::RegisterContents;
pub use function::FunctionAnalyzer;
pub use instruction::{
    branch_destination, is_branch_mnemonic, Instruction, InstructionDecoder, Operand,
    WrappedInstruction,
};
