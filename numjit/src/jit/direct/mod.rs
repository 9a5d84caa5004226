//! Direct machine-code backend.
//!
//! Walks an eligible function once and appends hand-encoded instructions per
//! bytecode op, with no intermediate representation. Numeric constants go to
//! a pool after the code and are loaded PC-relatively, so the bytes run at
//! any address.
//!
//! Each [`TargetArch`] hand-encodes exactly one instruction set. Both
//! encoders assemble on any host (see `numjit asm`), but a
//! `DirectBackend<A>` only reports itself available where `A` is the host.

mod aarch64;
mod x64;

pub use aarch64::Aarch64;
pub use x64::X86_64;

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use numjit_rt::ExecutableRegion;

use super::analysis::{EligibleFunction, NumOp};
use super::regmap::{Exhausted, NativeRegisterMap, RegisterBank};
use super::{Backend, BackendKind, CompiledArtifact, JitError};
use crate::bytecode::ArithOp;

// ---------------------------------------------------------------------------
// Target description
// ---------------------------------------------------------------------------

/// One hand-encoded instruction set and its calling convention.
///
/// Every method appends a complete native instruction sequence to `buf`.
/// Register operands are hardware register numbers.
pub trait TargetArch: Send + Sync + 'static {
    const ARCH: Arch;
    const BANK: RegisterBank;
    /// Filler between code and constant pool.
    const PAD: &'static [u8];

    /// Set `d` to `+0.0`.
    fn zero(buf: &mut CodeBuffer, d: u8);
    /// `d = a op b`. `b` may be the scratch register.
    fn arith(buf: &mut CodeBuffer, op: ArithOp, d: u8, a: u8, b: u8);
    /// Load a pooled constant into `d`.
    fn load_const(buf: &mut CodeBuffer, d: u8, value: f64);
    fn mov(buf: &mut CodeBuffer, d: u8, s: u8);
    fn neg(buf: &mut CodeBuffer, d: u8, s: u8);
    fn ret(buf: &mut CodeBuffer);
    /// Point the constant reference recorded at `at` to pool offset `target`.
    fn patch(code: &mut [u8], at: usize, target: usize);
}

/// Instruction sets the direct backend can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Aarch64,
    X86_64,
}

impl Arch {
    pub const ALL: [Arch; 2] = [Arch::Aarch64, Arch::X86_64];

    pub fn name(self) -> &'static str {
        match self {
            Arch::Aarch64 => "aarch64",
            Arch::X86_64 => "x86_64",
        }
    }

    /// Whether code for this architecture can run here. The encoders assume
    /// AAPCS64 and System V respectively, so x86_64 Windows does not count.
    pub fn is_host(self) -> bool {
        match self {
            Arch::Aarch64 => cfg!(all(target_arch = "aarch64", unix)),
            Arch::X86_64 => cfg!(all(target_arch = "x86_64", unix)),
        }
    }

    pub fn host() -> Option<Arch> {
        Arch::ALL.into_iter().find(|a| a.is_host())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86_64" | "x64" | "amd64" => Ok(Arch::X86_64),
            other => Err(format!("unknown architecture `{other}` (expected aarch64 or x86_64)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Code buffer and constant pool
// ---------------------------------------------------------------------------

/// Pending reference from an instruction to a pool slot.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    slot: usize,
}

/// Constants keyed by bit pattern, so `0.0` and `-0.0` get separate slots and
/// repeated values share one.
#[derive(Debug, Default)]
pub struct ConstPool {
    values: Vec<u64>,
}

impl ConstPool {
    pub fn slot(&mut self, value: f64) -> usize {
        let bits = value.to_bits();
        match self.values.iter().position(|v| *v == bits) {
            Some(i) => i,
            None => {
                self.values.push(bits);
                self.values.len() - 1
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    pool: ConstPool,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn put_u32(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Record that the bytes at `at` must address `value` in the pool.
    pub fn reference(&mut self, at: usize, value: f64) {
        let slot = self.pool.slot(value);
        self.fixups.push(Fixup { at, slot });
    }

    /// Lay out code, padding and pool, then resolve every reference.
    fn finish<A: TargetArch>(self) -> MachineCode {
        let CodeBuffer {
            mut bytes,
            pool,
            fixups,
        } = self;
        let code_len = bytes.len();
        if !pool.is_empty() {
            let mut pad = A::PAD.iter().cycle();
            while bytes.len() % 8 != 0 {
                bytes.push(pad.next().copied().unwrap_or(0));
            }
        }
        let pool_offset = bytes.len();
        for bits in &pool.values {
            bytes.extend_from_slice(&bits.to_le_bytes());
        }
        for fixup in fixups {
            A::patch(&mut bytes, fixup.at, pool_offset + fixup.slot * 8);
        }
        MachineCode {
            bytes,
            code_len,
            pool_offset,
            constants: pool.len(),
        }
    }
}

/// Assembled bytes of one function: code, padding, then constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCode {
    pub bytes: Vec<u8>,
    pub code_len: usize,
    pub pool_offset: usize,
    pub constants: usize,
}

impl MachineCode {
    pub fn code(&self) -> &[u8] {
        &self.bytes[..self.code_len]
    }

    pub fn pool(&self) -> &[u8] {
        &self.bytes[self.pool_offset..]
    }
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

/// Encode `func` for `A`. Pure: touches no executable memory.
pub fn assemble<A: TargetArch>(func: EligibleFunction<'_>) -> Result<MachineCode, Exhausted> {
    let map = NativeRegisterMap::new(func.arity(), &func.used_registers(), &A::BANK)?;
    let scratch = A::BANK.scratch;
    let mut buf = CodeBuffer::default();

    for r in func.read_before_write() {
        A::zero(&mut buf, map.get(r));
    }

    for op in func.ops() {
        match op {
            NumOp::Arith { op, dst, lhs, rhs } => {
                A::arith(&mut buf, op, map.get(dst), map.get(lhs), map.get(rhs));
            }
            NumOp::ArithK { op, dst, lhs, k } => {
                A::load_const(&mut buf, scratch, k);
                A::arith(&mut buf, op, map.get(dst), map.get(lhs), scratch);
            }
            NumOp::Load { dst, k } => A::load_const(&mut buf, map.get(dst), k),
            NumOp::Move { dst, src } => {
                let (d, s) = (map.get(dst), map.get(src));
                if d != s {
                    A::mov(&mut buf, d, s);
                }
            }
            NumOp::Neg { dst, src } => A::neg(&mut buf, map.get(dst), map.get(src)),
            NumOp::Ret { src } => {
                let s = map.get(src);
                if s != A::BANK.ret() {
                    A::mov(&mut buf, A::BANK.ret(), s);
                }
                A::ret(&mut buf);
            }
        }
    }
    Ok(buf.finish::<A>())
}

/// Encode `func` for an architecture picked at runtime.
pub fn assemble_for(arch: Arch, func: EligibleFunction<'_>) -> Result<MachineCode, Exhausted> {
    match arch {
        Arch::Aarch64 => assemble::<Aarch64>(func),
        Arch::X86_64 => assemble::<X86_64>(func),
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct DirectBackend<A: TargetArch> {
    _arch: PhantomData<fn() -> A>,
}

impl<A: TargetArch> DirectBackend<A> {
    pub fn new() -> Self {
        DirectBackend { _arch: PhantomData }
    }

    pub fn arch(&self) -> Arch {
        A::ARCH
    }
}

impl<A: TargetArch> Default for DirectBackend<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: TargetArch> Backend for DirectBackend<A> {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn name(&self) -> String {
        format!("direct ({})", A::ARCH)
    }

    fn availability(&self) -> Result<(), String> {
        if A::ARCH.is_host() {
            Ok(())
        } else {
            Err(format!(
                "encodes {} only; this host is {}-{}",
                A::ARCH,
                std::env::consts::ARCH,
                std::env::consts::OS
            ))
        }
    }

    fn emit(&self, func: EligibleFunction<'_>) -> Result<CompiledArtifact, JitError> {
        let code = assemble::<A>(func).map_err(|e| JitError::RegisterPressure {
            backend: BackendKind::Direct,
            function: func.name().to_string(),
            needed: e.needed,
            available: e.available,
        })?;
        let region = ExecutableRegion::load(&code.bytes).map_err(|source| JitError::Memory {
            function: func.name().to_string(),
            source,
        })?;
        let entry = region.entry(0).ok_or_else(|| JitError::Compile {
            backend: BackendKind::Direct,
            function: func.name().to_string(),
            message: "empty code region".to_string(),
        })?;
        // SAFETY: `entry` is the start of `region`, which was sealed
        // executable and is moved into the artifact alongside the pointer.
        Ok(unsafe {
            CompiledArtifact::from_raw_parts(
                BackendKind::Direct,
                func.name(),
                func.arity(),
                entry,
                Some(code.bytes.len()),
                Box::new(region),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Function, Instruction, Literal, Opcode, Param};
    use crate::jit::analysis::analyze;

    fn tot() -> Function {
        Function::new(
            "tot",
            vec![Param::num("p"), Param::num("q"), Param::num("r")],
            6,
            vec![
                Instruction::regs3(Opcode::MulN, 3, 0, 1),
                Instruction::regs3(Opcode::MulN, 4, 3, 2),
                Instruction::regs3(Opcode::AddN, 5, 3, 4),
                Instruction::ret(5),
            ],
        )
    }

    #[test]
    fn pool_dedups_by_bit_pattern() {
        let mut pool = ConstPool::default();
        assert_eq!(pool.slot(1.5), 0);
        assert_eq!(pool.slot(0.0), 1);
        assert_eq!(pool.slot(-0.0), 2);
        assert_eq!(pool.slot(1.5), 0);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn pool_is_aligned_and_after_code() {
        for arch in Arch::ALL {
            let f = Function::new(
                "k",
                vec![Param::num("x")],
                2,
                vec![
                    Instruction::with_const(Opcode::AddK, 1, 0, 2.0),
                    Instruction::with_const(Opcode::MulK, 1, 1, 2.0),
                    Instruction::load(0, Literal::Num(7.0)),
                    Instruction::regs3(Opcode::AddN, 0, 0, 1),
                    Instruction::ret(0),
                ],
            );
            let code = assemble_for(arch, analyze(&f).unwrap()).unwrap();
            assert_eq!(code.pool_offset % 8, 0, "{arch}");
            assert!(code.pool_offset >= code.code_len, "{arch}");
            assert_eq!(code.constants, 2, "{arch}");
            assert_eq!(code.pool(), [2.0f64.to_le_bytes(), 7.0f64.to_le_bytes()].concat());
        }
    }

    #[test]
    fn no_pool_means_no_padding() {
        for arch in Arch::ALL {
            let code = assemble_for(arch, analyze(&tot()).unwrap()).unwrap();
            assert_eq!(code.bytes.len(), code.code_len, "{arch}");
            assert_eq!(code.constants, 0);
        }
    }

    #[test]
    fn register_pressure_is_an_error() {
        let mut code: Vec<Instruction> = (0..16).map(|r| Instruction::load(r * 10, Literal::Num(1.0))).collect();
        code.push(Instruction::ret(0));
        let f = Function::new("big", vec![], 200, code);
        let err = assemble::<X86_64>(analyze(&f).unwrap()).unwrap_err();
        assert_eq!(err.needed, 16);
        assert_eq!(err.available, X86_64::BANK.capacity());
    }

    #[test]
    fn declared_but_unused_registers_cost_nothing() {
        let f = Function::new(
            "sparse",
            vec![Param::num("x")],
            200,
            vec![Instruction::with_const(Opcode::AddK, 199, 0, 1.0), Instruction::ret(199)],
        );
        for arch in Arch::ALL {
            assert!(assemble_for(arch, analyze(&f).unwrap()).is_ok(), "{arch}");
        }
    }

    #[test]
    fn exactly_one_direct_backend_matches_the_host() {
        let hosts = [
            DirectBackend::<Aarch64>::new().is_available(),
            DirectBackend::<X86_64>::new().is_available(),
        ];
        let expected = usize::from(Arch::host().is_some());
        assert_eq!(hosts.iter().filter(|h| **h).count(), expected);
    }

    #[test]
    fn arch_parses() {
        assert_eq!("arm64".parse::<Arch>(), Ok(Arch::Aarch64));
        assert_eq!("x86_64".parse::<Arch>(), Ok(Arch::X86_64));
        assert!("riscv64".parse::<Arch>().is_err());
    }
}
