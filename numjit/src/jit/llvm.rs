//! LLVM backend via inkwell.
//!
//! Registers are SSA values: the code is straight-line, so each write just
//! replaces the register's current `FloatValue` and no allocas or phis are
//! needed. Every artifact gets its own context, module and execution engine.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use inkwell::OptimizationLevel;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;
use inkwell::targets::{InitializationConfig, Target};
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::FloatValue;

use super::analysis::{EligibleFunction, NumOp};
use super::options::LlvmOpt;
use super::{Backend, BackendKind, CompiledArtifact, JitError};
use crate::bytecode::ArithOp;

impl From<LlvmOpt> for OptimizationLevel {
    fn from(opt: LlvmOpt) -> Self {
        match opt {
            LlvmOpt::None => OptimizationLevel::None,
            LlvmOpt::Less => OptimizationLevel::Less,
            LlvmOpt::Default => OptimizationLevel::Default,
            LlvmOpt::Aggressive => OptimizationLevel::Aggressive,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlvmBackend {
    opt: LlvmOpt,
}

impl LlvmBackend {
    pub fn new(opt: LlvmOpt) -> Self {
        LlvmBackend { opt }
    }
}

/// Engine, module and the context they borrow from.
///
/// The context is heap-allocated and its lifetime erased to `'static`; the
/// engine and module are dropped before it is freed.
struct LlvmCode {
    engine: ManuallyDrop<ExecutionEngine<'static>>,
    module: ManuallyDrop<Module<'static>>,
    context: NonNull<Context>,
}

// SAFETY: the execution engine is never touched after the entry address is
// read; the holder only exists to release it. LLVM contexts may be dropped on
// any thread as long as nothing else uses them concurrently, and nothing does.
unsafe impl Send for LlvmCode {}
unsafe impl Sync for LlvmCode {}

impl Drop for LlvmCode {
    fn drop(&mut self) {
        // SAFETY: both borrow `context`, so they go first; each field is
        // dropped exactly once here.
        unsafe {
            ManuallyDrop::drop(&mut self.engine);
            ManuallyDrop::drop(&mut self.module);
            drop(Box::from_raw(self.context.as_ptr()));
        }
    }
}

struct Lowered {
    engine: ExecutionEngine<'static>,
    module: Module<'static>,
    address: usize,
}

impl LlvmBackend {
    fn lower(
        &self,
        context: &'static Context,
        func: &EligibleFunction<'_>,
    ) -> Result<Lowered, String> {
        let module = context.create_module(func.name());
        let builder = context.create_builder();
        let f64_type = context.f64_type();

        let params: Vec<BasicMetadataTypeEnum> = (0..func.arity()).map(|_| f64_type.into()).collect();
        let function = module.add_function(func.name(), f64_type.fn_type(&params, false), None);
        let entry = context.append_basic_block(function, "entry");
        builder.position_at_end(entry);

        let mut regs: Vec<FloatValue<'static>> = Vec::with_capacity(func.register_count() as usize);
        for r in 0..func.register_count() as usize {
            let value = if r < func.arity() {
                function
                    .get_nth_param(r as u32)
                    .ok_or_else(|| format!("missing parameter {r}"))?
                    .into_float_value()
            } else {
                f64_type.const_float(0.0)
            };
            regs.push(value);
        }

        for op in func.ops() {
            match op {
                NumOp::Arith { op, dst, lhs, rhs } => {
                    let v = arith(&builder, op, regs[lhs as usize], regs[rhs as usize])?;
                    regs[dst as usize] = v;
                }
                NumOp::ArithK { op, dst, lhs, k } => {
                    let v = arith(&builder, op, regs[lhs as usize], f64_type.const_float(k))?;
                    regs[dst as usize] = v;
                }
                NumOp::Load { dst, k } => regs[dst as usize] = f64_type.const_float(k),
                NumOp::Move { dst, src } => regs[dst as usize] = regs[src as usize],
                NumOp::Neg { dst, src } => {
                    regs[dst as usize] = builder
                        .build_float_neg(regs[src as usize], "neg")
                        .map_err(|e| e.to_string())?;
                }
                NumOp::Ret { src } => {
                    builder
                        .build_return(Some(&regs[src as usize]))
                        .map_err(|e| e.to_string())?;
                }
            }
        }

        module.verify().map_err(|e| e.to_string())?;
        let engine = module
            .create_jit_execution_engine(self.opt.into())
            .map_err(|e| e.to_string())?;
        let address = engine
            .get_function_address(func.name())
            .map_err(|e| e.to_string())?;
        Ok(Lowered {
            engine,
            module,
            address,
        })
    }
}

fn arith(
    builder: &Builder<'static>,
    op: ArithOp,
    lhs: FloatValue<'static>,
    rhs: FloatValue<'static>,
) -> Result<FloatValue<'static>, String> {
    let v = match op {
        ArithOp::Add => builder.build_float_add(lhs, rhs, "add"),
        ArithOp::Sub => builder.build_float_sub(lhs, rhs, "sub"),
        ArithOp::Mul => builder.build_float_mul(lhs, rhs, "mul"),
        ArithOp::Div => builder.build_float_div(lhs, rhs, "div"),
    };
    v.map_err(|e| e.to_string())
}

impl Backend for LlvmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Llvm
    }

    fn name(&self) -> String {
        format!("llvm (opt={})", self.opt)
    }

    fn availability(&self) -> Result<(), String> {
        Target::initialize_native(&InitializationConfig::default())
            .map_err(|e| format!("cannot initialize the native LLVM target: {e}"))
    }

    fn emit(&self, func: EligibleFunction<'_>) -> Result<CompiledArtifact, JitError> {
        let raw = NonNull::from(Box::leak(Box::new(Context::create())));
        // SAFETY: `raw` stays allocated until `LlvmCode` drops, after every
        // value borrowing it.
        let context: &'static Context = unsafe { raw.as_ref() };

        let lowered = match self.lower(context, &func) {
            Ok(l) => l,
            Err(message) => {
                // SAFETY: `lower` returned, so every borrow of the context
                // created inside it is gone.
                unsafe { drop(Box::from_raw(raw.as_ptr())) };
                return Err(JitError::Compile {
                    backend: BackendKind::Llvm,
                    function: func.name().to_string(),
                    message,
                });
            }
        };

        let entry = lowered.address as *const u8;
        let code = LlvmCode {
            engine: ManuallyDrop::new(lowered.engine),
            module: ManuallyDrop::new(lowered.module),
            context: raw,
        };
        // SAFETY: the address comes from the engine now owned by `code`.
        Ok(unsafe {
            CompiledArtifact::from_raw_parts(
                BackendKind::Llvm,
                func.name(),
                func.arity(),
                entry,
                None,
                Box::new(code),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Function, Instruction, Literal, Opcode, Param};
    use crate::jit::compile;

    #[test]
    fn compiles_tot() {
        let f = Function::new(
            "tot",
            vec![Param::num("p"), Param::num("q"), Param::num("r")],
            6,
            vec![
                Instruction::regs3(Opcode::MulN, 3, 0, 1),
                Instruction::regs3(Opcode::MulN, 4, 3, 2),
                Instruction::regs3(Opcode::AddN, 5, 3, 4),
                Instruction::ret(5),
            ],
        );
        let artifact = compile(&LlvmBackend::default(), &f).unwrap();
        assert_eq!(artifact.invoke(&[10.0, 20.0, 30.0]).unwrap(), 6200.0);
    }

    #[test]
    fn constants_and_negation() {
        let f = Function::new(
            "k",
            vec![Param::num("x")],
            2,
            vec![
                Instruction::load(1, Literal::Num(3.0)),
                Instruction::regs3(Opcode::SubN, 1, 0, 1),
                Instruction::regs2(Opcode::Neg, 0, 1),
                Instruction::with_const(Opcode::DivK, 0, 0, 2.0),
                Instruction::ret(0),
            ],
        );
        for opt in [LlvmOpt::None, LlvmOpt::Aggressive] {
            let artifact = compile(&LlvmBackend::new(opt), &f).unwrap();
            assert_eq!(artifact.invoke(&[10.0]).unwrap(), -3.5, "{opt}");
        }
    }

    #[test]
    fn artifacts_outlive_each_other_independently() {
        let f = Function::new("id", vec![Param::num("x")], 1, vec![Instruction::ret(0)]);
        let a = compile(&LlvmBackend::default(), &f).unwrap();
        let b = compile(&LlvmBackend::default(), &f).unwrap();
        drop(a);
        assert_eq!(b.invoke(&[1.25]).unwrap(), 1.25);
    }
}
