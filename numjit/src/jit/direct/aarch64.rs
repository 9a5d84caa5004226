//! AArch64 encoder (AAPCS64).
//!
//! Scalar double-precision forms only. `d0-d7` carry arguments and the
//! result, `d16-d30` are caller-saved temporaries, `d31` is scratch.
//! `d8-d15` are callee-saved and never used.

use super::{Arch, CodeBuffer, TargetArch};
use crate::bytecode::ArithOp;
use crate::jit::regmap::RegisterBank;

pub struct Aarch64;

// Instruction words with all register fields zero.
const FADD_D: u32 = 0x1E60_2800;
const FSUB_D: u32 = 0x1E60_3800;
const FMUL_D: u32 = 0x1E60_0800;
const FDIV_D: u32 = 0x1E60_1800;
const FMOV_D: u32 = 0x1E60_4000;
const FNEG_D: u32 = 0x1E61_4000;
/// `FMOV Dd, XZR`
const FMOV_D_XZR: u32 = 0x9E67_03E0;
/// `LDR Dt, <label>`
const LDR_D_LIT: u32 = 0x5C00_0000;
const RET: u32 = 0xD65F_03C0;
const NOP: u32 = 0xD503_201F;

fn three(base: u32, d: u8, n: u8, m: u8) -> u32 {
    base | (m as u32) << 16 | (n as u32) << 5 | d as u32
}

fn two(base: u32, d: u8, n: u8) -> u32 {
    base | (n as u32) << 5 | d as u32
}

pub fn fadd(d: u8, n: u8, m: u8) -> u32 {
    three(FADD_D, d, n, m)
}

pub fn fsub(d: u8, n: u8, m: u8) -> u32 {
    three(FSUB_D, d, n, m)
}

pub fn fmul(d: u8, n: u8, m: u8) -> u32 {
    three(FMUL_D, d, n, m)
}

pub fn fdiv(d: u8, n: u8, m: u8) -> u32 {
    three(FDIV_D, d, n, m)
}

pub fn fmov(d: u8, n: u8) -> u32 {
    two(FMOV_D, d, n)
}

pub fn fneg(d: u8, n: u8) -> u32 {
    two(FNEG_D, d, n)
}

pub fn fmov_zero(d: u8) -> u32 {
    FMOV_D_XZR | d as u32
}

/// `LDR Dt, pc + 4 * imm19`.
pub fn ldr_literal(t: u8, imm19: i32) -> u32 {
    LDR_D_LIT | ((imm19 as u32) & 0x7FFFF) << 5 | t as u32
}

impl TargetArch for Aarch64 {
    const ARCH: Arch = Arch::Aarch64;
    const BANK: RegisterBank = RegisterBank {
        args: &[0, 1, 2, 3, 4, 5, 6, 7],
        temps: &[16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30],
        scratch: 31,
    };
    const PAD: &'static [u8] = &NOP.to_le_bytes();

    fn zero(buf: &mut CodeBuffer, d: u8) {
        buf.put_u32(fmov_zero(d));
    }

    fn arith(buf: &mut CodeBuffer, op: ArithOp, d: u8, a: u8, b: u8) {
        let word = match op {
            ArithOp::Add => fadd(d, a, b),
            ArithOp::Sub => fsub(d, a, b),
            ArithOp::Mul => fmul(d, a, b),
            ArithOp::Div => fdiv(d, a, b),
        };
        buf.put_u32(word);
    }

    fn load_const(buf: &mut CodeBuffer, d: u8, value: f64) {
        buf.reference(buf.offset(), value);
        buf.put_u32(ldr_literal(d, 0));
    }

    fn mov(buf: &mut CodeBuffer, d: u8, s: u8) {
        buf.put_u32(fmov(d, s));
    }

    fn neg(buf: &mut CodeBuffer, d: u8, s: u8) {
        buf.put_u32(fneg(d, s));
    }

    fn ret(buf: &mut CodeBuffer) {
        buf.put_u32(RET);
    }

    fn patch(code: &mut [u8], at: usize, target: usize) {
        let imm19 = (target as i64 - at as i64) / 4;
        let mut word = [0u8; 4];
        word.copy_from_slice(&code[at..at + 4]);
        let patched = u32::from_le_bytes(word) | ((imm19 as u32) & 0x7FFFF) << 5;
        code[at..at + 4].copy_from_slice(&patched.to_le_bytes());
    }
}
