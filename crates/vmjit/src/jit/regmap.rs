//! Virtual register to native storage mapping
//!
//! Every virtual register gets one Cranelift variable for the whole function.
//! Integer registers are `I32`, float registers `F64`, pointer registers
//! `I64`; string registers hold the `I64` address of their frame slot since
//! strings never leave the frame.

use cranelift_codegen::ir::{types, Type};
use cranelift_frontend::{FunctionBuilder, Variable};

use crate::bytecode::{RegClass, RegisterCounts};

pub fn native_type(class: RegClass) -> Type {
    match class {
        RegClass::Int => types::I32,
        RegClass::Float => types::F64,
        RegClass::String | RegClass::Pointer => types::I64,
    }
}

fn class_index(class: RegClass) -> usize {
    match class {
        RegClass::Int => 0,
        RegClass::Float => 1,
        RegClass::String => 2,
        RegClass::Pointer => 3,
    }
}

pub struct RegisterMap {
    vars: [Vec<Variable>; 4],
}

impl RegisterMap {
    pub fn declare(b: &mut FunctionBuilder<'_>, counts: RegisterCounts) -> Self {
        let mut vars: [Vec<Variable>; 4] = Default::default();
        for class in [RegClass::Int, RegClass::Float, RegClass::String, RegClass::Pointer] {
            let ty = native_type(class);
            vars[class_index(class)] = (0..counts.of(class)).map(|_| b.declare_var(ty)).collect();
        }
        RegisterMap { vars }
    }

    pub fn var(&self, class: RegClass, index: usize) -> Variable {
        self.vars[class_index(class)][index]
    }

    pub fn count(&self, class: RegClass) -> usize {
        self.vars[class_index(class)].len()
    }
}

/// Per-instruction temporaries, reused once the cursor is reset.
#[derive(Default)]
pub struct TempPool {
    vars: [Vec<Variable>; 4],
    used: [usize; 4],
}

impl TempPool {
    pub fn take(&mut self, b: &mut FunctionBuilder<'_>, class: RegClass) -> Variable {
        let i = class_index(class);
        if self.used[i] == self.vars[i].len() {
            let var = b.declare_var(native_type(class));
            self.vars[i].push(var);
        }
        let var = self.vars[i][self.used[i]];
        self.used[i] += 1;
        var
    }

    pub fn reset(&mut self) {
        self.used = [0; 4];
    }

    /// Temporaries ever declared for `class`.
    pub fn allocated(&self, class: RegClass) -> usize {
        self.vars[class_index(class)].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{Function, InstBuilder, Signature};
    use cranelift_codegen::isa::CallConv;
    use cranelift_frontend::FunctionBuilderContext;

    #[test]
    fn test_map_and_temp_reuse() {
        let mut func = Function::with_name_signature(Default::default(), Signature::new(CallConv::SystemV));
        let mut ctx = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut func, &mut ctx);
        let block = b.create_block();
        b.switch_to_block(block);

        let map = RegisterMap::declare(&mut b, RegisterCounts::new(2, 1, 0, 3));
        assert_eq!(map.count(RegClass::Int), 2);
        assert_eq!(map.count(RegClass::String), 0);
        assert_ne!(map.var(RegClass::Int, 0), map.var(RegClass::Int, 1));

        let mut temps = TempPool::default();
        let t0 = temps.take(&mut b, RegClass::Float);
        let t1 = temps.take(&mut b, RegClass::Float);
        assert_ne!(t0, t1);
        temps.reset();
        assert_eq!(temps.take(&mut b, RegClass::Float), t0);
        assert_eq!(temps.allocated(RegClass::Float), 2);

        b.ins().return_(&[]);
        b.seal_all_blocks();
        b.finalize();
    }
}
