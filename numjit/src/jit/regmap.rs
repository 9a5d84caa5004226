//! Virtual-to-native register assignment.
//!
//! Parameter `rN` stays in the N-th floating-point argument register, where
//! the calling convention put it. The other registers a function actually
//! names are packed into the remaining argument registers, then into
//! caller-saved temporaries. Callee-saved registers are never handed out,
//! which keeps compiled functions free of prologues and epilogues.

use std::fmt;

/// Where a virtual register lives, independent of architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The n-th FP argument register.
    Arg(u8),
    /// The n-th caller-saved temporary.
    Temp(u8),
}

/// The FP registers one target hands to generated code.
#[derive(Debug, Clone, Copy)]
pub struct RegisterBank {
    /// Argument registers, in calling-convention order. `args[0]` also
    /// carries the return value.
    pub args: &'static [u8],
    pub temps: &'static [u8],
    /// Reserved for constants and operand shuffles; never mapped.
    pub scratch: u8,
}

impl RegisterBank {
    pub fn capacity(&self) -> usize {
        self.args.len() + self.temps.len()
    }

    pub fn ret(&self) -> u8 {
        self.args[0]
    }

    fn resolve(&self, slot: Slot) -> u8 {
        match slot {
            Slot::Arg(i) => self.args[i as usize],
            Slot::Temp(i) => self.temps[i as usize],
        }
    }
}

/// A function uses more virtual registers than the bank holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub needed: usize,
    pub available: usize,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "needs {} registers, {} available", self.needed, self.available)
    }
}

#[derive(Debug, Clone)]
pub struct NativeRegisterMap {
    slots: Vec<Option<Slot>>,
    physical: Vec<Option<u8>>,
}

impl NativeRegisterMap {
    /// Assign slots for a function with `arity` parameters whose code names
    /// the registers in `used` (ascending, deduplicated).
    ///
    /// Parameters keep their argument registers. Every other used register
    /// takes the next free argument register, then the next temporary, in
    /// ascending order. Declared but unused registers get nothing.
    pub fn new(arity: usize, used: &[u8], bank: &RegisterBank) -> Result<Self, Exhausted> {
        if arity > bank.args.len() {
            return Err(Exhausted {
                needed: arity,
                available: bank.args.len(),
            });
        }
        let locals: Vec<u8> = used.iter().copied().filter(|r| *r as usize >= arity).collect();
        let needed = arity + locals.len();
        if needed > bank.capacity() {
            return Err(Exhausted {
                needed,
                available: bank.capacity(),
            });
        }

        let size = used.iter().map(|r| *r as usize + 1).max().unwrap_or(0).max(arity);
        let mut slots = vec![None; size];
        for (i, slot) in slots.iter_mut().take(arity).enumerate() {
            *slot = Some(Slot::Arg(i as u8));
        }
        let free = (arity..bank.args.len())
            .map(|i| Slot::Arg(i as u8))
            .chain((0..bank.temps.len()).map(|i| Slot::Temp(i as u8)));
        for (r, slot) in locals.iter().zip(free) {
            slots[*r as usize] = Some(slot);
        }
        let physical = slots.iter().map(|s| s.map(|s| bank.resolve(s))).collect();
        Ok(NativeRegisterMap { slots, physical })
    }

    /// Hardware register number for `vreg`.
    ///
    /// # Panics
    ///
    /// If `vreg` was not in the `used` set given to [`NativeRegisterMap::new`].
    pub fn get(&self, vreg: u8) -> u8 {
        match self.physical.get(vreg as usize).copied().flatten() {
            Some(p) => p,
            None => unreachable!("r{vreg} has no native register"),
        }
    }

    pub fn slot(&self, vreg: u8) -> Option<Slot> {
        self.slots.get(vreg as usize).copied().flatten()
    }

    /// Number of virtual registers holding a native register.
    pub fn len(&self) -> usize {
        self.physical.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: RegisterBank = RegisterBank {
        args: &[0, 1, 2, 3, 4, 5, 6, 7],
        temps: &[16, 17, 18],
        scratch: 31,
    };

    fn dense(n: u8) -> Vec<u8> {
        (0..n).collect()
    }

    #[test]
    fn params_stay_in_argument_registers() {
        let map = NativeRegisterMap::new(3, &dense(3), &BANK).unwrap();
        assert_eq!((0..3).map(|r| map.get(r)).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(map.slot(2), Some(Slot::Arg(2)));
    }

    #[test]
    fn unused_params_keep_their_slot() {
        let map = NativeRegisterMap::new(2, &[1, 5], &BANK).unwrap();
        assert_eq!(map.slot(0), Some(Slot::Arg(0)));
        assert_eq!(map.get(1), 1);
        assert_eq!(map.get(5), 2);
    }

    #[test]
    fn overflow_goes_to_temporaries() {
        let map = NativeRegisterMap::new(0, &dense(11), &BANK).unwrap();
        assert_eq!(map.slot(8), Some(Slot::Temp(0)));
        assert_eq!(map.get(8), 16);
        assert_eq!(map.get(10), 18);
    }

    #[test]
    fn sparse_registers_are_packed() {
        let map = NativeRegisterMap::new(1, &[0, 15, 200], &BANK).unwrap();
        assert_eq!(map.get(0), 0);
        assert_eq!(map.get(15), 1);
        assert_eq!(map.get(200), 2);
        assert_eq!(map.slot(7), None);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn assignments_are_distinct_and_skip_scratch() {
        let used = [0, 2, 3, 9, 12, 20, 31, 40, 50, 99];
        let map = NativeRegisterMap::new(2, &used, &BANK).unwrap();
        let mut seen: Vec<u8> = (0..2).chain(used).map(|r| map.get(r)).collect();
        assert!(!seen.contains(&BANK.scratch));
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn too_many_registers() {
        let err = NativeRegisterMap::new(0, &dense(12), &BANK).unwrap_err();
        assert_eq!(err, Exhausted { needed: 12, available: 11 });

        let err = NativeRegisterMap::new(3, &[10, 20, 30, 40, 50, 60, 70, 80, 90], &BANK).unwrap_err();
        assert_eq!(err, Exhausted { needed: 12, available: 11 });
    }
}
