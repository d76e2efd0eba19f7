use std::fmt;
use std::sync::Arc;

use vambrace_macho::MachoBinary;
use vambrace_objc::ObjcRuntimeData;

use crate::block::{compute_basic_blocks, BasicBlock};
use crate::dataflow::{resolve_register, RegisterContents};
use crate::instruction::{branch_destination, Instruction, InstructionDecoder, WrappedInstruction};

const SECTION_TYPE_MASK: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;

/// ARM64 instructions are fixed-width.
const INSTRUCTION_SIZE: u64 = 4;

/// An immutable per-function view: the decoded instruction list, the
/// basic-block partition, and register-content queries against it.
///
/// Created on demand by [`crate::MachoAnalyzer::get_function_analyzer`] and
/// cached for the lifetime of the owning analyzer; never mutated after
/// construction.
pub struct FunctionAnalyzer {
    entry_address: u64,
    instructions: Vec<Instruction>,
    basic_blocks: Vec<BasicBlock>,
    binary: Arc<MachoBinary>,
    objc: Arc<ObjcRuntimeData>,
    decoder: Arc<dyn InstructionDecoder>,
}

impl FunctionAnalyzer {
    /// Builds a function view over an already-decoded instruction sequence.
    pub fn new(
        entry_address: u64,
        instructions: Vec<Instruction>,
        binary: Arc<MachoBinary>,
        objc: Arc<ObjcRuntimeData>,
        decoder: Arc<dyn InstructionDecoder>,
    ) -> Self {
        let basic_blocks = compute_basic_blocks(&instructions);
        FunctionAnalyzer {
            entry_address,
            instructions,
            basic_blocks,
            binary,
            objc,
            decoder,
        }
    }

    /// The function's entry address.
    pub fn entry_address(&self) -> u64 {
        self.entry_address
    }

    /// One past the address of the function's last instruction.
    pub fn end_address(&self) -> u64 {
        self.instructions
            .last()
            .map(|instruction| instruction.address + INSTRUCTION_SIZE)
            .unwrap_or(self.entry_address)
    }

    /// The function's decoded instructions, in address order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The function's basic blocks, contiguous and in ascending order.
    pub fn basic_blocks(&self) -> &[BasicBlock] {
        &self.basic_blocks
    }

    /// Whether an address falls within the function's instruction range.
    pub fn contains_address(&self, address: u64) -> bool {
        self.entry_address <= address && address < self.end_address()
    }

    /// Looks up the instruction at an exact address.
    pub fn get_instruction_at_address(&self, address: u64) -> Option<&Instruction> {
        self.instructions
            .iter()
            .find(|instruction| instruction.address == address)
    }

    /// Wraps an instruction with its semantic classification.
    ///
    /// Branch targets inside the function stay plain local branches. A
    /// target that is a `__stubs` trampoline is tagged with the imported
    /// callee's name; for Objective-C dispatch calls, the selector is
    /// recovered by resolving `x1` at the call site. Targets elsewhere in
    /// the image keep their destination with no symbol, and dynamic register
    /// branches carry neither.
    pub fn wrap_instruction(&self, instruction: &Instruction) -> WrappedInstruction {
        let destination_address = branch_destination(instruction);
        let mut wrapped = WrappedInstruction {
            instruction: instruction.clone(),
            destination_address,
            symbol: None,
            selector: None,
        };

        if let Some(destination) = destination_address {
            if !self.contains_address(destination) {
                if let Some(symbol) = self.objc.symbol_for_stub(destination) {
                    wrapped.symbol = Some(symbol.to_owned());
                    if wrapped.is_msg_send() {
                        // the selector reference travels in x1
                        if let RegisterContents::Immediate(selref) =
                            self.get_register_contents_at_instruction("x1", &wrapped)
                        {
                            wrapped.selector = self.objc.selector_for_selref(selref);
                        }
                    }
                }
            }
        }
        wrapped
    }

    /// Wraps every instruction of the function, in order.
    pub fn wrapped_instructions(&self) -> Vec<WrappedInstruction> {
        self.instructions
            .iter()
            .map(|instruction| self.wrap_instruction(instruction))
            .collect()
    }

    /// Whether the wrapped branch targets an address inside this function.
    pub fn is_local_branch(&self, wrapped: &WrappedInstruction) -> bool {
        wrapped
            .destination_address
            .map(|destination| self.contains_address(destination))
            .unwrap_or(false)
    }

    /// The provable contents of `register` immediately before the wrapped
    /// instruction executes.
    ///
    /// Never fails: anything the backward walk cannot prove is
    /// [`RegisterContents::Unknown`].
    pub fn get_register_contents_at_instruction(
        &self,
        register: &str,
        wrapped: &WrappedInstruction,
    ) -> RegisterContents {
        let index = match self
            .instructions
            .iter()
            .position(|instruction| instruction.address == wrapped.instruction.address)
        {
            Some(index) => index,
            None => return RegisterContents::Unknown,
        };

        let binary = &self.binary;
        let read_pointer = move |address: u64| -> Option<u64> {
            let section = binary.section_for_address(address)?;
            // only initialized data counts; the best-effort section fallback
            // and zero-fill sections do not
            if !section.contains(address)
                || section.cmd.flags & SECTION_TYPE_MASK == S_ZEROFILL
            {
                return None;
            }
            binary.read_pointer_at_address(address).ok()
        };

        resolve_register(
            &self.instructions,
            index,
            register,
            self.decoder.as_ref(),
            &read_pointer,
        )
    }

    /// Resolves the arguments of a message-send call site: `x2` through
    /// `x(1 + argcount)`, where `argcount` is the number of colons in the
    /// recovered selector name.
    pub fn get_selector_arguments(&self, wrapped: &WrappedInstruction) -> Vec<RegisterContents> {
        let argcount = wrapped
            .selector
            .as_ref()
            .map(|selector| selector.name.matches(':').count())
            .unwrap_or(0);

        (0..argcount)
            .map(|index| {
                let register = format!("x{}", index + 2);
                self.get_register_contents_at_instruction(&register, wrapped)
            })
            .collect()
    }
}

impl fmt::Debug for FunctionAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionAnalyzer")
            .field("entry_address", &self.entry_address)
            .field("instructions", &self.instructions.len())
            .field("basic_blocks", &self.basic_blocks.len())
            .finish()
    }
}
