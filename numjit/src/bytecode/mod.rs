//! Register bytecode as produced by the upstream compiler.
//!
//! Functions are immutable once built. Each instruction carries an opcode and
//! three operand slots whose kinds are fixed by the opcode (see
//! [`Opcode::shape`]).

pub mod asm;

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Instructions of the register VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // -- Generic arithmetic (operands of unknown type, checked at runtime) --
    Add,
    Sub,
    Mul,
    Div,

    // -- Comparison --
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,

    // -- Logic --
    Not,

    // -- Result values --
    WrapOk,
    WrapErr,
    IsOk,
    IsErr,
    Unwrap,

    // -- Records and lists --
    RecFld,
    RecNew,
    RecWith,
    ListGet,
    ListNew,

    // -- Control flow --
    Jmp,
    JmpF,
    JmpT,
    Call,

    // -- Numeric (both operands known to be numbers) --
    AddN,
    SubN,
    MulN,
    DivN,
    /// `R[A] = R[B] + K`
    AddK,
    SubK,
    MulK,
    DivK,

    // -- Moves and constants --
    LoadK,
    Move,
    Neg,

    // -- Termination --
    Ret,
}

/// What an operand slot of an opcode holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg,
    Imm,
    Offset,
    Index,
    None,
}

/// Scalar float operation shared by the `*N` and `*K` opcode families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithOp::Add => lhs + rhs,
            ArithOp::Sub => lhs - rhs,
            ArithOp::Mul => lhs * rhs,
            ArithOp::Div => lhs / rhs,
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, ArithOp::Add | ArithOp::Mul)
    }
}

impl Opcode {
    pub const ALL: [Opcode; 37] = [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Eq,
        Opcode::Ne,
        Opcode::Gt,
        Opcode::Lt,
        Opcode::Ge,
        Opcode::Le,
        Opcode::Not,
        Opcode::WrapOk,
        Opcode::WrapErr,
        Opcode::IsOk,
        Opcode::IsErr,
        Opcode::Unwrap,
        Opcode::RecFld,
        Opcode::RecNew,
        Opcode::RecWith,
        Opcode::ListGet,
        Opcode::ListNew,
        Opcode::Jmp,
        Opcode::JmpF,
        Opcode::JmpT,
        Opcode::Call,
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

    /// Assembly mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Gt => "gt",
            Opcode::Lt => "lt",
            Opcode::Ge => "ge",
            Opcode::Le => "le",
            Opcode::Not => "not",
            Opcode::WrapOk => "wrapok",
            Opcode::WrapErr => "wraperr",
            Opcode::IsOk => "isok",
            Opcode::IsErr => "iserr",
            Opcode::Unwrap => "unwrap",
            Opcode::RecFld => "recfld",
            Opcode::RecNew => "recnew",
            Opcode::RecWith => "recwith",
            Opcode::ListGet => "listget",
            Opcode::ListNew => "listnew",
            Opcode::Jmp => "jmp",
            Opcode::JmpF => "jmpf",
            Opcode::JmpT => "jmpt",
            Opcode::Call => "call",
            Opcode::AddN => "addn",
            Opcode::SubN => "subn",
            Opcode::MulN => "muln",
            Opcode::DivN => "divn",
            Opcode::AddK => "addk",
            Opcode::SubK => "subk",
            Opcode::MulK => "mulk",
            Opcode::DivK => "divk",
            Opcode::LoadK => "loadk",
            Opcode::Move => "move",
            Opcode::Neg => "neg",
            Opcode::Ret => "ret",
        }
    }

    /// Operand kinds expected in slots A, B and C.
    pub fn shape(self) -> [OperandKind; 3] {
        use OperandKind::{Imm, Index, None, Offset, Reg};
        match self {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Gt
            | Opcode::Lt
            | Opcode::Ge
            | Opcode::Le
            | Opcode::ListGet
            | Opcode::AddN
            | Opcode::SubN
            | Opcode::MulN
            | Opcode::DivN => [Reg, Reg, Reg],
            Opcode::Not
            | Opcode::WrapOk
            | Opcode::WrapErr
            | Opcode::IsOk
            | Opcode::IsErr
            | Opcode::Unwrap
            | Opcode::Move
            | Opcode::Neg => [Reg, Reg, None],
            Opcode::RecFld => [Reg, Reg, Index],
            Opcode::RecNew | Opcode::RecWith | Opcode::Call => [Reg, Index, Index],
            Opcode::ListNew => [Reg, Index, None],
            Opcode::Jmp => [Offset, None, None],
            Opcode::JmpF | Opcode::JmpT => [Reg, Offset, None],
            Opcode::AddK | Opcode::SubK | Opcode::MulK | Opcode::DivK => [Reg, Reg, Imm],
            Opcode::LoadK => [Reg, Imm, None],
            Opcode::Ret => [Reg, None, None],
        }
    }

    /// The float operation behind a numeric arithmetic opcode.
    pub fn arith(self) -> Option<ArithOp> {
        match self {
            Opcode::AddN | Opcode::AddK => Some(ArithOp::Add),
            Opcode::SubN | Opcode::SubK => Some(ArithOp::Sub),
            Opcode::MulN | Opcode::MulK => Some(ArithOp::Mul),
            Opcode::DivN | Opcode::DivK => Some(ArithOp::Div),
            _ => None,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::JmpF | Opcode::JmpT)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for Opcode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

/// Constant embedded in an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Num(f64),
    Text(Rc<str>),
    Bool(bool),
    Nil,
}

impl Literal {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Literal::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Literal::Num(_) => "number",
            Literal::Text(_) => "text",
            Literal::Bool(_) => "bool",
            Literal::Nil => "nil",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Num(n) => write!(f, "{n}"),
            Literal::Text(s) => write!(f, "{s:?}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Nil => f.write_str("nil"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Operand {
    #[default]
    None,
    Reg(u8),
    Imm(Literal),
    /// Relative jump displacement in instructions.
    Offset(i16),
    /// Function, field or element-count index.
    Index(u16),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Reg(_) => OperandKind::Reg,
            Operand::Imm(_) => OperandKind::Imm,
            Operand::Offset(_) => OperandKind::Offset,
            Operand::Index(_) => OperandKind::Index,
        }
    }

    pub fn reg(&self) -> Option<u8> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn imm(&self) -> Option<&Literal> {
        match self {
            Operand::Imm(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Reg(r) => write!(f, "r{r}"),
            Operand::Imm(l) => write!(f, "{l}"),
            Operand::Offset(o) => write!(f, "{o:+}"),
            Operand::Index(i) => write!(f, "#{i}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: Operand,
    pub b: Operand,
    pub c: Operand,
}

/// An operand that does not match its opcode's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct OperandMismatch {
    pub slot: char,
    pub expected: OperandKind,
    pub found: OperandKind,
}

impl fmt::Display for OperandMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operand {} should be {:?}, found {:?}",
            self.slot, self.expected, self.found
        )
    }
}

impl Instruction {
    pub fn new(op: Opcode, a: Operand, b: Operand, c: Operand) -> Self {
        Instruction { op, a, b, c }
    }

    /// `op rA, rB, rC`
    pub fn regs3(op: Opcode, a: u8, b: u8, c: u8) -> Self {
        Instruction::new(op, Operand::Reg(a), Operand::Reg(b), Operand::Reg(c))
    }

    /// `op rA, rB`
    pub fn regs2(op: Opcode, a: u8, b: u8) -> Self {
        Instruction::new(op, Operand::Reg(a), Operand::Reg(b), Operand::None)
    }

    /// `op rA, rB, k` for the `*K` family.
    pub fn with_const(op: Opcode, a: u8, b: u8, k: f64) -> Self {
        Instruction::new(op, Operand::Reg(a), Operand::Reg(b), Operand::Imm(Literal::Num(k)))
    }

    pub fn load(a: u8, value: Literal) -> Self {
        Instruction::new(Opcode::LoadK, Operand::Reg(a), Operand::Imm(value), Operand::None)
    }

    pub fn ret(a: u8) -> Self {
        Instruction::new(Opcode::Ret, Operand::Reg(a), Operand::None, Operand::None)
    }

    pub fn operands(&self) -> [&Operand; 3] {
        [&self.a, &self.b, &self.c]
    }

    /// Registers read by this instruction.
    pub fn reads(&self) -> impl Iterator<Item = u8> {
        let slots = match self.op {
            Opcode::Ret | Opcode::JmpF | Opcode::JmpT => [self.a.reg(), None],
            _ => [self.b.reg(), self.c.reg()],
        };
        slots.into_iter().flatten()
    }

    /// Register written by this instruction, if any.
    pub fn writes(&self) -> Option<u8> {
        match self.op {
            Opcode::Ret | Opcode::Jmp | Opcode::JmpF | Opcode::JmpT => None,
            _ => self.a.reg(),
        }
    }

    /// Check every operand against the opcode's shape.
    pub fn check(&self) -> Result<(), OperandMismatch> {
        for ((slot, operand), expected) in ['A', 'B', 'C']
            .into_iter()
            .zip(self.operands())
            .zip(self.op.shape())
        {
            let found = operand.kind();
            if found != expected {
                return Err(OperandMismatch {
                    slot,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        let mut first = true;
        for operand in self.operands() {
            if matches!(operand, Operand::None) {
                continue;
            }
            f.write_str(if first { " " } else { ", " })?;
            write!(f, "{operand}")?;
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Num,
    Text,
    Bool,
    List,
    /// A user-defined record type.
    Named(String),
}

impl ParamType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ParamType::Num)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Num => f.write_str("num"),
            ParamType::Text => f.write_str("text"),
            ParamType::Bool => f.write_str("bool"),
            ParamType::List => f.write_str("list"),
            ParamType::Named(n) => f.write_str(n),
        }
    }
}

impl FromStr for ParamType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "num" | "n" => ParamType::Num,
            "text" | "t" => ParamType::Text,
            "bool" | "b" => ParamType::Bool,
            "list" | "L" => ParamType::List,
            other => ParamType::Named(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: ParamType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Param {
            name: name.into(),
            ty,
        }
    }

    pub fn num(name: impl Into<String>) -> Self {
        Param::new(name, ParamType::Num)
    }
}

/// A compiled function. Parameters arrive in registers `r0..rN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    name: String,
    params: Vec<Param>,
    register_count: u8,
    code: Vec<Instruction>,
}

impl Function {
    /// Build a function. `register_count` is raised to cover the parameters.
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        register_count: u8,
        code: Vec<Instruction>,
    ) -> Self {
        let register_count = register_count.max(params.len().min(u8::MAX as usize) as u8);
        Function {
            name: name.into(),
            params,
            register_count,
            code,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn register_count(&self) -> u8 {
        self.register_count
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", p.name, p.ty)?;
        }
        writeln!(f, ") regs={} {{", self.register_count)?;
        for inst in &self.code {
            writeln!(f, "    {inst}")?;
        }
        f.write_str("}")
    }
}

/// An ordered set of functions. The first one is the default entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    functions: Vec<Function>,
}

impl Program {
    pub fn new(functions: Vec<Function>) -> Self {
        Program { functions }
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn entry(&self) -> Option<&Function> {
        self.functions.first()
    }

    /// Look up `name`, or the entry function when `name` is `None`.
    pub fn select(&self, name: Option<&str>) -> Option<&Function> {
        match name {
            Some(n) => self.get(n),
            None => self.entry(),
        }
    }
}
