//! x86-64 SSE2 encoder (System V).
//!
//! `xmm0-xmm7` carry arguments and the result, `xmm8-xmm14` are temporaries
//! and `xmm15` is scratch. Every XMM register is caller-saved under System V.
//! SSE arithmetic is two-operand, so `d = a op b` may need a copy first.

use super::{Arch, CodeBuffer, TargetArch};
use crate::bytecode::ArithOp;
use crate::jit::regmap::RegisterBank;

pub struct X86_64;

const RET: u8 = 0xC3;
const INT3: u8 = 0xCC;

/// Mandatory prefix and second opcode byte of each `0F xx` form used.
#[derive(Debug, Clone, Copy)]
enum Sse {
    Addsd,
    Subsd,
    Mulsd,
    Divsd,
    Movapd,
    Xorpd,
    /// `movsd xmm, m64`
    MovsdLoad,
}

impl Sse {
    fn prefix_and_opcode(self) -> (u8, u8) {
        match self {
            Sse::Addsd => (0xF2, 0x58),
            Sse::Mulsd => (0xF2, 0x59),
            Sse::Subsd => (0xF2, 0x5C),
            Sse::Divsd => (0xF2, 0x5E),
            Sse::Movapd => (0x66, 0x28),
            Sse::Xorpd => (0x66, 0x57),
            Sse::MovsdLoad => (0xF2, 0x10),
        }
    }

    fn from_arith(op: ArithOp) -> Sse {
        match op {
            ArithOp::Add => Sse::Addsd,
            ArithOp::Sub => Sse::Subsd,
            ArithOp::Mul => Sse::Mulsd,
            ArithOp::Div => Sse::Divsd,
        }
    }
}

/// Register-register form: `op reg, rm`.
fn rr(op: Sse, reg: u8, rm: u8) -> Vec<u8> {
    let (prefix, opcode) = op.prefix_and_opcode();
    let mut out = vec![prefix];
    let rex = 0x40 | (reg >> 3 & 1) << 2 | (rm >> 3 & 1);
    if rex != 0x40 {
        out.push(rex);
    }
    out.extend_from_slice(&[0x0F, opcode, 0xC0 | (reg & 7) << 3 | (rm & 7)]);
    out
}

/// RIP-relative load, `op reg, [rip + disp32]`. The displacement is the last
/// four bytes.
fn rip(op: Sse, reg: u8, disp: i32) -> Vec<u8> {
    let (prefix, opcode) = op.prefix_and_opcode();
    let mut out = vec![prefix];
    if reg >= 8 {
        out.push(0x44);
    }
    out.extend_from_slice(&[0x0F, opcode, (reg & 7) << 3 | 0b101]);
    out.extend_from_slice(&disp.to_le_bytes());
    out
}

pub fn addsd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Addsd, d, s)
}

pub fn subsd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Subsd, d, s)
}

pub fn mulsd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Mulsd, d, s)
}

pub fn divsd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Divsd, d, s)
}

pub fn movapd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Movapd, d, s)
}

pub fn xorpd(d: u8, s: u8) -> Vec<u8> {
    rr(Sse::Xorpd, d, s)
}

pub fn movsd_rip(d: u8, disp: i32) -> Vec<u8> {
    rip(Sse::MovsdLoad, d, disp)
}

impl TargetArch for X86_64 {
    const ARCH: Arch = Arch::X86_64;
    const BANK: RegisterBank = RegisterBank {
        args: &[0, 1, 2, 3, 4, 5, 6, 7],
        temps: &[8, 9, 10, 11, 12, 13, 14],
        scratch: 15,
    };
    const PAD: &'static [u8] = &[INT3];

    fn zero(buf: &mut CodeBuffer, d: u8) {
        buf.put(&xorpd(d, d));
    }

    fn arith(buf: &mut CodeBuffer, op: ArithOp, d: u8, a: u8, b: u8) {
        let sse = Sse::from_arith(op);
        if d == a {
            buf.put(&rr(sse, d, b));
        } else if d == b && op.is_commutative() {
            buf.put(&rr(sse, d, a));
        } else if d == b {
            let s = Self::BANK.scratch;
            buf.put(&movapd(s, b));
            buf.put(&movapd(d, a));
            buf.put(&rr(sse, d, s));
        } else {
            buf.put(&movapd(d, a));
            buf.put(&rr(sse, d, b));
        }
    }

    fn load_const(buf: &mut CodeBuffer, d: u8, value: f64) {
        let inst = movsd_rip(d, 0);
        let at = buf.offset() + inst.len() - 4;
        buf.reference(at, value);
        buf.put(&inst);
    }

    fn mov(buf: &mut CodeBuffer, d: u8, s: u8) {
        buf.put(&movapd(d, s));
    }

    fn neg(buf: &mut CodeBuffer, d: u8, s: u8) {
        let mask = Self::BANK.scratch;
        Self::load_const(buf, mask, -0.0);
        if d != s {
            buf.put(&movapd(d, s));
        }
        buf.put(&xorpd(d, mask));
    }

    fn ret(buf: &mut CodeBuffer) {
        buf.put(&[RET]);
    }

    fn patch(code: &mut [u8], at: usize, target: usize) {
        let disp = (target as i64 - (at as i64 + 4)) as i32;
        code[at..at + 4].copy_from_slice(&disp.to_le_bytes());
    }
}
