//! Reference interpreter for the numeric subset of the bytecode.
//!
//! Registers are plain `f64`s and arithmetic is IEEE-754, exactly what the
//! native backends compute, so results from here and from compiled code are
//! directly comparable. Anything outside the numeric subset is refused.

use thiserror::Error;
use tracing::trace;

use crate::bytecode::{Function, Instruction, Literal, Opcode, Operand};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpError {
    #[error("`{function}` takes {expected} argument(s), {given} given")]
    Arity {
        function: String,
        expected: usize,
        given: usize,
    },
    #[error("`{function}` instruction {index}: `{opcode}` is outside the numeric subset")]
    Unsupported {
        function: String,
        index: usize,
        opcode: Opcode,
    },
    #[error("`{function}` instruction {index}: {message}")]
    Malformed {
        function: String,
        index: usize,
        message: String,
    },
    #[error("`{function}` ends without a `ret`")]
    MissingReturn { function: String },
}

/// Execute `func` on `args` and return the value of its `ret` register.
pub fn run(func: &Function, args: &[f64]) -> Result<f64, InterpError> {
    if args.len() != func.arity() {
        return Err(InterpError::Arity {
            function: func.name().to_string(),
            expected: func.arity(),
            given: args.len(),
        });
    }

    let mut regs = vec![0.0f64; func.register_count() as usize];
    regs[..args.len()].copy_from_slice(args);
    let mut frame = Frame {
        func,
        regs: &mut regs,
    };

    for (index, inst) in func.code().iter().enumerate() {
        trace!(function = func.name(), index, %inst, "interp");
        if let Some(value) = frame.step(index, inst)? {
            return Ok(value);
        }
    }
    Err(InterpError::MissingReturn {
        function: func.name().to_string(),
    })
}

struct Frame<'a> {
    func: &'a Function,
    regs: &'a mut [f64],
}

impl Frame<'_> {
    /// Execute one instruction. `Some` carries the returned value.
    fn step(&mut self, index: usize, inst: &Instruction) -> Result<Option<f64>, InterpError> {
        match inst.op {
            Opcode::AddN | Opcode::SubN | Opcode::MulN | Opcode::DivN => {
                let op = inst.op.arith().ok_or_else(|| self.unsupported(index, inst.op))?;
                let lhs = self.read(index, &inst.b)?;
                let rhs = self.read(index, &inst.c)?;
                self.write(index, &inst.a, op.apply(lhs, rhs))?;
            }
            Opcode::AddK | Opcode::SubK | Opcode::MulK | Opcode::DivK => {
                let op = inst.op.arith().ok_or_else(|| self.unsupported(index, inst.op))?;
                let lhs = self.read(index, &inst.b)?;
                let k = self.constant(index, &inst.c)?;
                self.write(index, &inst.a, op.apply(lhs, k))?;
            }
            Opcode::LoadK => {
                let k = self.constant(index, &inst.b)?;
                self.write(index, &inst.a, k)?;
            }
            Opcode::Move => {
                let v = self.read(index, &inst.b)?;
                self.write(index, &inst.a, v)?;
            }
            Opcode::Neg => {
                let v = self.read(index, &inst.b)?;
                self.write(index, &inst.a, -v)?;
            }
            Opcode::Ret => return self.read(index, &inst.a).map(Some),
            other => return Err(self.unsupported(index, other)),
        }
        Ok(None)
    }

    fn slot(&self, index: usize, operand: &Operand) -> Result<usize, InterpError> {
        let Operand::Reg(r) = operand else {
            return Err(self.malformed(index, format!("expected a register, found `{operand}`")));
        };
        let r = *r as usize;
        if r >= self.regs.len() {
            return Err(self.malformed(
                index,
                format!("register r{r} outside the {} declared", self.regs.len()),
            ));
        }
        Ok(r)
    }

    fn read(&self, index: usize, operand: &Operand) -> Result<f64, InterpError> {
        let r = self.slot(index, operand)?;
        Ok(self.regs[r])
    }

    fn write(&mut self, index: usize, operand: &Operand, value: f64) -> Result<(), InterpError> {
        let r = self.slot(index, operand)?;
        self.regs[r] = value;
        Ok(())
    }

    fn constant(&self, index: usize, operand: &Operand) -> Result<f64, InterpError> {
        match operand {
            Operand::Imm(Literal::Num(n)) => Ok(*n),
            Operand::Imm(other) => Err(self.malformed(
                index,
                format!("{} constant in numeric code", other.kind_name()),
            )),
            other => Err(self.malformed(index, format!("expected a constant, found `{other}`"))),
        }
    }

    fn unsupported(&self, index: usize, opcode: Opcode) -> InterpError {
        InterpError::Unsupported {
            function: self.func.name().to_string(),
            index,
            opcode,
        }
    }

    fn malformed(&self, index: usize, message: String) -> InterpError {
        InterpError::Malformed {
            function: self.func.name().to_string(),
            index,
            message,
        }
    }
}
