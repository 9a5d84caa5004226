//! Eligibility analysis: which functions may be compiled to native code.
//!
//! The check is a whitelist. Every instruction must be one of the numeric
//! opcodes in [`ALLOWED`], every parameter must be numeric, operands must be
//! well formed, and the function must end in its only `ret`. The first
//! violation found in a single forward scan is reported.

use std::fmt;

use crate::bytecode::{ArithOp, Function, Instruction, Literal, Opcode, Operand, ParamType};

/// Opcodes native code may contain.
pub const ALLOWED: [Opcode; 12] = [
    Opcode::AddN,
    Opcode::SubN,
    Opcode::MulN,
    Opcode::DivN,
    Opcode::AddK,
    Opcode::SubK,
    Opcode::MulK,
    Opcode::DivK,
    Opcode::LoadK,
    Opcode::Move,
    Opcode::Neg,
    Opcode::Ret,
];

pub fn is_allowed(op: Opcode) -> bool {
    ALLOWED.contains(&op)
}

/// Why a function cannot be compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligibility {
    DisallowedOpcode { index: usize, opcode: Opcode },
    NonNumericParam { position: usize, name: String, ty: ParamType },
    NonNumericConstant { index: usize, opcode: Opcode, kind: &'static str },
    MissingReturn,
    EarlyReturn { index: usize },
    MalformedOperand { index: usize, message: String },
}

impl Ineligibility {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            Ineligibility::DisallowedOpcode { .. } => "ELG_001",
            Ineligibility::NonNumericParam { .. } => "ELG_002",
            Ineligibility::NonNumericConstant { .. } => "ELG_003",
            Ineligibility::MissingReturn | Ineligibility::EarlyReturn { .. } => "ELG_004",
            Ineligibility::MalformedOperand { .. } => "ELG_005",
        }
    }

    /// Index of the offending instruction, when there is one.
    pub fn instruction(&self) -> Option<usize> {
        match self {
            Ineligibility::DisallowedOpcode { index, .. }
            | Ineligibility::NonNumericConstant { index, .. }
            | Ineligibility::EarlyReturn { index }
            | Ineligibility::MalformedOperand { index, .. } => Some(*index),
            Ineligibility::NonNumericParam { .. } | Ineligibility::MissingReturn => None,
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            Ineligibility::DisallowedOpcode { opcode, .. } if opcode.is_branch() => {
                Some("native code is straight-line only; run this function in the interpreter".into())
            }
            Ineligibility::DisallowedOpcode { opcode: Opcode::Call, .. } => {
                Some("inline the callee or run this function in the interpreter".into())
            }
            Ineligibility::DisallowedOpcode {
                opcode: opcode @ (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div),
                ..
            } => Some(format!("`{opcode}` is untyped; the numeric form is `{opcode}n`")),
            Ineligibility::NonNumericParam { name, .. } => {
                Some(format!("declare `{name}` as `num` to make the function compilable"))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligibility::DisallowedOpcode { index, opcode } => {
                write!(f, "contains a `{opcode}` instruction (at {index})")
            }
            Ineligibility::NonNumericParam { position, name, ty } => {
                write!(f, "parameter {position} `{name}` is `{ty}`, not numeric")
            }
            Ineligibility::NonNumericConstant { index, opcode, kind } => {
                write!(f, "`{opcode}` at {index} loads a {kind} constant")
            }
            Ineligibility::MissingReturn => f.write_str("does not end in a `ret` instruction"),
            Ineligibility::EarlyReturn { index } => {
                write!(f, "returns at {index} before the last instruction")
            }
            Ineligibility::MalformedOperand { index, message } => {
                write!(f, "malformed instruction at {index}: {message}")
            }
        }
    }
}

/// A function that passed [`analyze`]. Only this module can build one, so
/// every emitter receives code that has been checked.
#[derive(Debug, Clone, Copy)]
pub struct EligibleFunction<'a> {
    func: &'a Function,
}

impl<'a> EligibleFunction<'a> {
    pub fn function(&self) -> &'a Function {
        self.func
    }

    pub fn name(&self) -> &'a str {
        self.func.name()
    }

    pub fn arity(&self) -> usize {
        self.func.arity()
    }

    pub fn register_count(&self) -> u8 {
        self.func.register_count()
    }

    /// The instructions in decoded form.
    pub fn ops(&self) -> impl Iterator<Item = NumOp> + 'a {
        self.func.code().iter().map(NumOp::decode)
    }

    /// Every register the code reads or writes, ascending.
    pub fn used_registers(&self) -> Vec<u8> {
        let mut used: Vec<u8> = self
            .func
            .code()
            .iter()
            .flat_map(|inst| inst.reads().chain(inst.writes()))
            .collect();
        used.sort_unstable();
        used.dedup();
        used
    }

    /// Non-parameter registers read before any instruction writes them.
    /// Such reads observe `0.0`.
    pub fn read_before_write(&self) -> Vec<u8> {
        let mut written = vec![false; self.register_count() as usize];
        for w in written.iter_mut().take(self.arity()) {
            *w = true;
        }
        let mut out = Vec::new();
        for inst in self.func.code() {
            for r in inst.reads() {
                if !written[r as usize] && !out.contains(&r) {
                    out.push(r);
                }
            }
            if let Some(w) = inst.writes() {
                written[w as usize] = true;
            }
        }
        out
    }
}

/// One whitelisted instruction, operands extracted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumOp {
    Arith { op: ArithOp, dst: u8, lhs: u8, rhs: u8 },
    ArithK { op: ArithOp, dst: u8, lhs: u8, k: f64 },
    Load { dst: u8, k: f64 },
    Move { dst: u8, src: u8 },
    Neg { dst: u8, src: u8 },
    Ret { src: u8 },
}

impl NumOp {
    /// Decode an instruction of an analyzed function.
    ///
    /// # Panics
    ///
    /// On anything [`analyze`] rejects. Reaching that means a backend was fed
    /// unchecked code, and emitting it would produce wrong machine code.
    fn decode(inst: &Instruction) -> NumOp {
        let reg = |o: &Operand| match o {
            Operand::Reg(r) => *r,
            other => unreachable!("`{}` operand `{other}` reached a native emitter", inst.op),
        };
        let num = |o: &Operand| match o {
            Operand::Imm(Literal::Num(n)) => *n,
            other => unreachable!("`{}` operand `{other}` reached a native emitter", inst.op),
        };
        match inst.op {
            Opcode::AddN | Opcode::SubN | Opcode::MulN | Opcode::DivN => NumOp::Arith {
                op: arith(inst.op),
                dst: reg(&inst.a),
                lhs: reg(&inst.b),
                rhs: reg(&inst.c),
            },
            Opcode::AddK | Opcode::SubK | Opcode::MulK | Opcode::DivK => NumOp::ArithK {
                op: arith(inst.op),
                dst: reg(&inst.a),
                lhs: reg(&inst.b),
                k: num(&inst.c),
            },
            Opcode::LoadK => NumOp::Load {
                dst: reg(&inst.a),
                k: num(&inst.b),
            },
            Opcode::Move => NumOp::Move {
                dst: reg(&inst.a),
                src: reg(&inst.b),
            },
            Opcode::Neg => NumOp::Neg {
                dst: reg(&inst.a),
                src: reg(&inst.b),
            },
            Opcode::Ret => NumOp::Ret { src: reg(&inst.a) },
            other => unreachable!("disallowed opcode `{other}` reached a native emitter"),
        }
    }
}

fn arith(op: Opcode) -> ArithOp {
    match op.arith() {
        Some(a) => a,
        None => unreachable!("`{op}` is not arithmetic"),
    }
}

/// Classify `func` without executing it.
pub fn analyze(func: &Function) -> Result<EligibleFunction<'_>, Ineligibility> {
    for (position, param) in func.params().iter().enumerate() {
        if !param.ty.is_numeric() {
            return Err(Ineligibility::NonNumericParam {
                position,
                name: param.name.clone(),
                ty: param.ty.clone(),
            });
        }
    }

    let code = func.code();
    let regs = func.register_count();
    for (index, inst) in code.iter().enumerate() {
        if !is_allowed(inst.op) {
            return Err(Ineligibility::DisallowedOpcode {
                index,
                opcode: inst.op,
            });
        }
        if let Err(mismatch) = inst.check() {
            return Err(Ineligibility::MalformedOperand {
                index,
                message: mismatch.to_string(),
            });
        }
        for operand in inst.operands() {
            match operand {
                Operand::Reg(r) if *r >= regs => {
                    return Err(Ineligibility::MalformedOperand {
                        index,
                        message: format!("register r{r} outside the {regs} declared"),
                    });
                }
                Operand::Imm(lit) if lit.as_num().is_none() => {
                    return Err(Ineligibility::NonNumericConstant {
                        index,
                        opcode: inst.op,
                        kind: lit.kind_name(),
                    });
                }
                _ => {}
            }
        }
        if inst.op == Opcode::Ret && index + 1 != code.len() {
            return Err(Ineligibility::EarlyReturn { index });
        }
    }

    match code.last() {
        Some(last) if last.op == Opcode::Ret => Ok(EligibleFunction { func }),
        _ => Err(Ineligibility::MissingReturn),
    }
}

pub fn is_eligible(func: &Function) -> bool {
    analyze(func).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Param;

    fn nums(n: usize) -> Vec<Param> {
        (0..n).map(|i| Param::num(format!("a{i}"))).collect()
    }

    #[test]
    fn numeric_function_is_eligible() {
        let f = Function::new(
            "f",
            nums(2),
            4,
            vec![
                Instruction::regs3(Opcode::AddN, 2, 0, 1),
                Instruction::with_const(Opcode::MulK, 3, 2, 0.5),
                Instruction::ret(3),
            ],
        );
        let eligible = analyze(&f).unwrap();
        assert_eq!(eligible.arity(), 2);
        let ops: Vec<_> = eligible.ops().collect();
        assert_eq!(
            ops[1],
            NumOp::ArithK {
                op: ArithOp::Mul,
                dst: 3,
                lhs: 2,
                k: 0.5
            }
        );
    }

    #[test]
    fn zero_arity_is_eligible() {
        let f = Function::new(
            "k",
            vec![],
            1,
            vec![Instruction::load(0, Literal::Num(42.0)), Instruction::ret(0)],
        );
        assert!(is_eligible(&f));
    }

    #[test]
    fn names_the_disallowed_opcode() {
        let f = Function::new(
            "c",
            nums(1),
            2,
            vec![
                Instruction::with_const(Opcode::AddK, 1, 0, 1.0),
                Instruction::new(Opcode::Call, Operand::Reg(1), Operand::Index(0), Operand::Index(1)),
                Instruction::ret(1),
            ],
        );
        let err = analyze(&f).unwrap_err();
        assert_eq!(
            err,
            Ineligibility::DisallowedOpcode {
                index: 1,
                opcode: Opcode::Call
            }
        );
        assert_eq!(err.to_string(), "contains a `call` instruction (at 1)");
        assert_eq!(err.code(), "ELG_001");
    }

    #[test]
    fn non_numeric_param_is_reported_first() {
        let f = Function::new(
            "p",
            vec![Param::num("x"), Param::new("s", ParamType::Text)],
            2,
            vec![Instruction::regs3(Opcode::Lt, 0, 0, 1), Instruction::ret(0)],
        );
        let err = analyze(&f).unwrap_err();
        assert_eq!(err.code(), "ELG_002");
        assert_eq!(err.to_string(), "parameter 1 `s` is `text`, not numeric");
        assert!(err.suggestion().unwrap().contains("`s`"));
    }

    #[test]
    fn text_constant_is_rejected() {
        let f = Function::new(
            "t",
            vec![],
            1,
            vec![
                Instruction::load(0, Literal::Text("hi".into())),
                Instruction::ret(0),
            ],
        );
        let err = analyze(&f).unwrap_err();
        assert_eq!(err.code(), "ELG_003");
        assert_eq!(err.instruction(), Some(0));
    }

    #[test]
    fn return_must_be_last_and_present() {
        let early = Function::new("e", nums(1), 1, vec![Instruction::ret(0), Instruction::ret(0)]);
        assert_eq!(analyze(&early).unwrap_err(), Ineligibility::EarlyReturn { index: 0 });

        let none = Function::new("n", nums(1), 1, vec![Instruction::regs2(Opcode::Neg, 0, 0)]);
        assert_eq!(analyze(&none).unwrap_err(), Ineligibility::MissingReturn);

        let empty = Function::new("x", vec![], 0, vec![]);
        assert_eq!(analyze(&empty).unwrap_err(), Ineligibility::MissingReturn);
    }

    #[test]
    fn malformed_operands_are_rejected() {
        let out_of_range = Function::new("r", nums(1), 1, vec![Instruction::ret(3)]);
        let err = analyze(&out_of_range).unwrap_err();
        assert_eq!(err.code(), "ELG_005");
        assert!(err.to_string().contains("r3"));

        let wrong_kind = Function::new(
            "w",
            nums(1),
            2,
            vec![
                Instruction::new(Opcode::Move, Operand::Reg(1), Operand::Offset(2), Operand::None),
                Instruction::ret(1),
            ],
        );
        assert_eq!(analyze(&wrong_kind).unwrap_err().code(), "ELG_005");
    }

    #[test]
    fn untyped_arithmetic_suggests_numeric_form() {
        let f = Function::new(
            "u",
            nums(2),
            3,
            vec![Instruction::regs3(Opcode::Add, 2, 0, 1), Instruction::ret(2)],
        );
        let err = analyze(&f).unwrap_err();
        assert_eq!(err.suggestion().as_deref(), Some("`add` is untyped; the numeric form is `addn`"));
    }

    #[test]
    fn read_before_write_ignores_params() {
        let f = Function::new(
            "z",
            nums(1),
            4,
            vec![
                Instruction::regs3(Opcode::AddN, 1, 0, 2),
                Instruction::regs3(Opcode::AddN, 3, 1, 2),
                Instruction::regs3(Opcode::AddN, 3, 3, 1),
                Instruction::ret(3),
            ],
        );
        let eligible = analyze(&f).unwrap();
        assert_eq!(eligible.read_before_write(), vec![2]);
    }

    #[test]
    fn used_registers_skip_declared_only_ones() {
        let f = Function::new(
            "sparse",
            nums(2),
            16,
            vec![
                Instruction::with_const(Opcode::AddK, 15, 0, 1.0),
                Instruction::regs2(Opcode::Move, 9, 15),
                Instruction::ret(15),
            ],
        );
        assert_eq!(analyze(&f).unwrap().used_registers(), vec![0, 9, 15]);
    }
}
