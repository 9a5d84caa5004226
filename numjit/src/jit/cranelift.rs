//! Cranelift backend.
//!
//! One `JITModule` per artifact. Each virtual register becomes a Cranelift
//! `Variable` of type `f64`; every bytecode op is one builder call and the
//! framework does register allocation and instruction selection.

use std::fmt;

use cranelift_codegen::ir::{AbiParam, InstBuilder, Value, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};

use super::analysis::{EligibleFunction, NumOp};
use super::options::CraneliftOpt;
use super::{Backend, BackendKind, CompiledArtifact, JitError};
use crate::bytecode::ArithOp;

#[derive(Debug, Clone, Default)]
pub struct CraneliftBackend {
    opt: CraneliftOpt,
}

impl CraneliftBackend {
    pub fn new(opt: CraneliftOpt) -> Self {
        CraneliftBackend { opt }
    }

    fn fail(&self, func: &EligibleFunction<'_>, message: impl fmt::Display) -> JitError {
        JitError::Compile {
            backend: BackendKind::Cranelift,
            function: func.name().to_string(),
            message: message.to_string(),
        }
    }

    fn module(&self) -> Result<JITModule, String> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", self.opt.as_str())
            .map_err(|e| e.to_string())?;
        let isa = cranelift_native::builder()
            .map_err(|e| format!("native ISA not available: {e}"))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| e.to_string())?;
        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        Ok(JITModule::new(builder))
    }
}

/// Keeps the module's code pages mapped for as long as the artifact lives.
struct JitCode {
    module: Option<JITModule>,
}

// SAFETY: after `finalize_definitions` the module is only held to free its
// memory on drop. Nothing reads or writes it in between.
unsafe impl Send for JitCode {}
unsafe impl Sync for JitCode {}

impl Drop for JitCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the artifact owning this holder is being dropped, so no
            // pointer into the module's code can be called again.
            unsafe { module.free_memory() };
        }
    }
}

fn arith(b: &mut FunctionBuilder<'_>, op: ArithOp, lhs: Value, rhs: Value) -> Value {
    match op {
        ArithOp::Add => b.ins().fadd(lhs, rhs),
        ArithOp::Sub => b.ins().fsub(lhs, rhs),
        ArithOp::Mul => b.ins().fmul(lhs, rhs),
        ArithOp::Div => b.ins().fdiv(lhs, rhs),
    }
}

impl Backend for CraneliftBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cranelift
    }

    fn name(&self) -> String {
        format!("cranelift (opt_level={})", self.opt)
    }

    fn availability(&self) -> Result<(), String> {
        cranelift_native::builder()
            .map(|_| ())
            .map_err(|e| format!("native ISA not available: {e}"))
    }

    fn emit(&self, func: EligibleFunction<'_>) -> Result<CompiledArtifact, JitError> {
        let mut module = self.module().map_err(|e| self.fail(&func, e))?;

        let mut sig = module.make_signature();
        for _ in 0..func.arity() {
            sig.params.push(AbiParam::new(types::F64));
        }
        sig.returns.push(AbiParam::new(types::F64));
        let id = module
            .declare_function(func.name(), Linkage::Export, &sig)
            .map_err(|e| self.fail(&func, e))?;

        let mut ctx = module.make_context();
        ctx.func.signature = sig;
        let mut fb_ctx = FunctionBuilderContext::new();
        {
            let mut b = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
            let entry = b.create_block();
            b.append_block_params_for_function_params(entry);
            b.switch_to_block(entry);
            b.seal_block(entry);

            let mut vars: Vec<Variable> = Vec::with_capacity(func.register_count() as usize);
            for r in 0..func.register_count() as usize {
                let var = b.declare_var(types::F64);
                let init = if r < func.arity() {
                    b.block_params(entry)[r]
                } else {
                    b.ins().f64const(0.0)
                };
                b.def_var(var, init);
                vars.push(var);
            }

            for op in func.ops() {
                match op {
                    NumOp::Arith { op, dst, lhs, rhs } => {
                        let l = b.use_var(vars[lhs as usize]);
                        let r = b.use_var(vars[rhs as usize]);
                        let v = arith(&mut b, op, l, r);
                        b.def_var(vars[dst as usize], v);
                    }
                    NumOp::ArithK { op, dst, lhs, k } => {
                        let l = b.use_var(vars[lhs as usize]);
                        let r = b.ins().f64const(k);
                        let v = arith(&mut b, op, l, r);
                        b.def_var(vars[dst as usize], v);
                    }
                    NumOp::Load { dst, k } => {
                        let v = b.ins().f64const(k);
                        b.def_var(vars[dst as usize], v);
                    }
                    NumOp::Move { dst, src } => {
                        let v = b.use_var(vars[src as usize]);
                        b.def_var(vars[dst as usize], v);
                    }
                    NumOp::Neg { dst, src } => {
                        let s = b.use_var(vars[src as usize]);
                        let v = b.ins().fneg(s);
                        b.def_var(vars[dst as usize], v);
                    }
                    NumOp::Ret { src } => {
                        let v = b.use_var(vars[src as usize]);
                        b.ins().return_(&[v]);
                    }
                }
            }
            b.finalize();
        }

        module
            .define_function(id, &mut ctx)
            .map_err(|e| self.fail(&func, format!("{e:?}")))?;
        let code_size = ctx.compiled_code().map(|c| c.code_buffer().len());
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| self.fail(&func, e))?;
        let entry = module.get_finalized_function(id);

        // SAFETY: `entry` was finalized by `module`, which moves into the
        // holder and is only freed when the artifact drops.
        Ok(unsafe {
            CompiledArtifact::from_raw_parts(
                BackendKind::Cranelift,
                func.name(),
                func.arity(),
                entry,
                code_size,
                Box::new(JitCode {
                    module: Some(module),
                }),
            )
        })
    }
}
