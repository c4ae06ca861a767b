//! Thin layer over `FunctionBuilder`
//!
//! Owns the per-instruction labels, the shared unwind block, helper-call
//! signatures, the scratch stack slot and the annotation listing.

use cranelift_codegen::ir::{
    self, types, Block, InstBuilder, SigRef, SourceLoc, StackSlot, StackSlotData, StackSlotKind, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

use super::abi;
use crate::jit::runtime::helpers::Helper;

pub struct Emitter<'a> {
    pub(crate) b: FunctionBuilder<'a>,
    call_conv: CallConv,
    sigs: [Option<SigRef>; Helper::COUNT],
    labels: Vec<Block>,
    unwind: Block,
    scratch: StackSlot,
    listing: Option<Vec<String>>,
}

impl<'a> Emitter<'a> {
    /// Start a function with `num_labels` instruction labels. The caller
    /// binds them in order; label `num_labels - 1` is the exit.
    pub fn new(
        func: &'a mut ir::Function,
        ctx: &'a mut FunctionBuilderContext,
        call_conv: CallConv,
        num_labels: usize,
        capture_listing: bool,
    ) -> Self {
        let mut b = FunctionBuilder::new(func, ctx);
        let labels = (0..num_labels).map(|_| b.create_block()).collect();
        let unwind = b.create_block();
        let scratch = b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            abi::SCRATCH_SIZE,
            abi::SCRATCH_ALIGN_SHIFT,
        ));
        Emitter {
            b,
            call_conv,
            sigs: [None; Helper::COUNT],
            labels,
            unwind,
            scratch,
            listing: capture_listing.then(Vec::new),
        }
    }

    /// Create the entry block, bind the incoming arguments and make it current.
    pub fn entry(&mut self) -> Vec<Value> {
        let block = self.b.create_block();
        self.b.append_block_params_for_function_params(block);
        self.b.switch_to_block(block);
        self.b.block_params(block).to_vec()
    }

    pub fn label(&self, index: usize) -> Block {
        self.labels[index]
    }

    pub fn unwind_block(&self) -> Block {
        self.unwind
    }

    /// Bind the label of instruction `index`, falling through from the
    /// previous block when it is still open.
    pub fn bind(&mut self, index: usize) {
        let block = self.labels[index];
        if !self.is_terminated() {
            self.b.ins().jump(block, &[]);
        }
        self.b.switch_to_block(block);
    }

    /// Whether the current block already ends in a terminator.
    fn is_terminated(&self) -> bool {
        let Some(block) = self.b.current_block() else {
            return true;
        };
        let func = &self.b.func;
        func.layout
            .last_inst(block)
            .is_some_and(|inst| func.dfg.insts[inst].opcode().is_terminator())
    }

    pub fn jump(&mut self, block: Block) {
        self.b.ins().jump(block, &[]);
    }

    /// Branch to `taken` when `cond` is non-zero, otherwise to `not_taken`.
    pub fn branch(&mut self, cond: Value, taken: Block, not_taken: Block) {
        if taken == not_taken {
            self.b.ins().jump(taken, &[]);
        } else {
            self.b.ins().brif(cond, taken, &[], not_taken, &[]);
        }
    }

    /// Call a helper routine through its address.
    pub fn call_helper(&mut self, helper: Helper, args: &[Value]) -> Option<Value> {
        let sig = match self.sigs[helper.index()] {
            Some(sig) => sig,
            None => {
                let sig = self.b.import_signature(abi::helper_signature(helper, self.call_conv));
                self.sigs[helper.index()] = Some(sig);
                sig
            }
        };
        let callee = self.b.ins().iconst(types::I64, helper.address() as i64);
        let call = self.b.ins().call_indirect(sig, callee, args);
        self.b.inst_results(call).first().copied()
    }

    pub fn iconst_ptr(&mut self, addr: usize) -> Value {
        self.b.ins().iconst(types::I64, addr as i64)
    }

    pub fn scratch_addr(&mut self, offset: u32) -> Value {
        self.b.ins().stack_addr(types::I64, self.scratch, offset as i32)
    }

    /// Tag subsequent instructions with a bytecode index and record an annotation.
    pub fn annotate(&mut self, pc: usize, text: impl FnOnce() -> String) {
        self.b.set_srcloc(SourceLoc::new(pc as u32));
        if let Some(listing) = self.listing.as_mut() {
            listing.push(text());
        }
    }

    /// Seal every block and finish the function, returning the listing.
    pub fn finish(mut self) -> Option<Vec<String>> {
        self.b.seal_all_blocks();
        self.b.finalize();
        self.listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{AbiParam, Function, Opcode, Signature, UserFuncName};

    #[test]
    fn test_bind_falls_through_only_from_open_blocks() {
        let mut sig = Signature::new(CallConv::SystemV);
        sig.returns.push(AbiParam::new(types::I32));
        let mut func = Function::with_name_signature(UserFuncName::default(), sig);
        let mut ctx = FunctionBuilderContext::new();

        let mut e = Emitter::new(&mut func, &mut ctx, CallConv::SystemV, 3, false);
        e.entry();
        assert!(!e.is_terminated());
        e.bind(0);
        let next = e.label(1);
        e.jump(next);
        assert!(e.is_terminated());
        e.bind(1);
        assert!(!e.is_terminated());
        e.bind(2);
        let zero = e.b.ins().iconst(types::I32, 0);
        e.b.ins().return_(&[zero]);
        assert!(e.is_terminated());
        let unwind = e.unwind_block();
        e.b.switch_to_block(unwind);
        let zero = e.b.ins().iconst(types::I32, 0);
        e.b.ins().return_(&[zero]);
        e.finish();

        // entry -> 0, 0 -> 1 (explicit, not doubled), 1 -> 2
        let jumps = func
            .layout
            .blocks()
            .flat_map(|block| func.layout.block_insts(block))
            .filter(|inst| func.dfg.insts[*inst].opcode() == Opcode::Jump)
            .count();
        assert_eq!(jumps, 3);
    }
}
