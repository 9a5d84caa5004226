//! Property-based equivalence of native code and the interpreter.
//!
//! For random straight-line numeric functions and random arguments, every
//! backend available on this host must return what the interpreter returns.

use proptest::prelude::*;

use numjit::bench::agrees;
use numjit::bytecode::{Function, Instruction, Literal, Opcode, Param};
use numjit::interpreter;
use numjit::jit::{self, BackendRegistry};

fn extreme() -> impl Strategy<Value = f64> {
    prop::sample::select(vec![
        1.0e300,
        -1.0e300,
        f64::MAX,
        f64::MIN,
        f64::MIN_POSITIVE,
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::NAN,
    ])
}

fn value() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => -1.0e6f64..1.0e6,
        1 => Just(0.0),
        1 => Just(-0.0),
        1 => Just(1.0),
        2 => extreme(),
    ]
}

fn instruction(regs: u8) -> impl Strategy<Value = Instruction> {
    let r = 0..regs;
    let arith = prop::sample::select(vec![Opcode::AddN, Opcode::SubN, Opcode::MulN, Opcode::DivN]);
    let arith_k = prop::sample::select(vec![Opcode::AddK, Opcode::SubK, Opcode::MulK, Opcode::DivK]);
    prop_oneof![
        (arith, r.clone(), r.clone(), r.clone()).prop_map(|(op, a, b, c)| Instruction::regs3(op, a, b, c)),
        (arith_k, r.clone(), r.clone(), value()).prop_map(|(op, a, b, k)| Instruction::with_const(op, a, b, k)),
        (r.clone(), value()).prop_map(|(a, k)| Instruction::load(a, Literal::Num(k))),
        (r.clone(), r.clone()).prop_map(|(a, b)| Instruction::regs2(Opcode::Move, a, b)),
        (r.clone(), r).prop_map(|(a, b)| Instruction::regs2(Opcode::Neg, a, b)),
    ]
}

/// A random eligible function and arguments for it. Instructions name at
/// most 13 distinct registers, within the smallest native register file
/// (x86_64: 15). The declared count is padded past that, and unused
/// registers must not count against it.
fn function_and_args() -> impl Strategy<Value = (Function, Vec<f64>)> {
    (0usize..=5, 1u8..=8, 0u8..=100)
        .prop_flat_map(|(arity, extra, pad)| {
            let regs = arity as u8 + extra;
            (
                Just(arity),
                Just(regs + pad),
                prop::collection::vec(instruction(regs), 0..24),
                0..regs,
                prop::collection::vec(value(), arity),
            )
        })
        .prop_map(|(arity, declared, mut code, ret, args)| {
            code.push(Instruction::ret(ret));
            let params = (0..arity).map(|i| Param::num(format!("a{i}"))).collect();
            (Function::new("generated", params, declared, code), args)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn backends_match_the_interpreter((func, args) in function_and_args()) {
        let expected = interpreter::run(&func, &args).unwrap();
        let registry = BackendRegistry::with_defaults();
        for backend in registry.available() {
            let artifact = jit::compile(backend, &func)
                .unwrap_or_else(|e| panic!("{} rejected an eligible function: {e}\n{func}", backend.name()));
            let got = artifact.invoke(&args).unwrap();
            prop_assert!(
                agrees(got, expected),
                "{}: got {got}, interpreter {expected}\n{func}",
                backend.name()
            );
        }
    }

    #[test]
    fn recompiling_gives_the_same_answer((func, args) in function_and_args()) {
        let registry = BackendRegistry::with_defaults();
        for backend in registry.available() {
            let first = jit::compile(backend, &func).unwrap();
            let second = jit::compile(backend, &func).unwrap();
            let a = first.invoke(&args).unwrap();
            let b = second.invoke(&args).unwrap();
            prop_assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()), "{}", backend.name());
            drop(first);
            // Dropping one artifact leaves the other callable.
            prop_assert!(agrees(second.invoke(&args).unwrap(), b), "{}", backend.name());
        }
    }
}

#[test]
fn division_by_zero_is_ieee_everywhere() {
    let func = Function::new(
        "ratio",
        vec![Param::num("a"), Param::num("b")],
        3,
        vec![Instruction::regs3(Opcode::DivN, 2, 0, 1), Instruction::ret(2)],
    );
    let registry = BackendRegistry::with_defaults();
    for (args, expected) in [
        ([1.0, 0.0], f64::INFINITY),
        ([-1.0, 0.0], f64::NEG_INFINITY),
        ([0.0, 0.0], f64::NAN),
    ] {
        assert!(agrees(interpreter::run(&func, &args).unwrap(), expected));
        for backend in registry.available() {
            let got = jit::compile(backend, &func).unwrap().invoke(&args).unwrap();
            assert!(agrees(got, expected), "{}: {got}", backend.name());
        }
    }
}

#[test]
fn overflow_and_non_finite_inputs_agree() {
    let func = Function::new(
        "scale",
        vec![Param::num("a"), Param::num("b")],
        3,
        vec![
            Instruction::regs3(Opcode::MulN, 2, 0, 1),
            Instruction::with_const(Opcode::MulK, 2, 2, 1.0e300),
            Instruction::ret(2),
        ],
    );
    let registry = BackendRegistry::with_defaults();
    for args in [
        [1.0e300, 1.0e10],
        [-1.0e300, 1.0e10],
        [f64::MAX, 1.0],
        [f64::MIN_POSITIVE, 1.0e-300],
        [f64::INFINITY, 0.0],
        [f64::NAN, 2.0],
        [f64::NEG_INFINITY, -1.0],
    ] {
        let expected = interpreter::run(&func, &args).unwrap();
        for backend in registry.available() {
            let got = jit::compile(backend, &func).unwrap().invoke(&args).unwrap();
            assert!(agrees(got, expected), "{}: {args:?} gave {got}, interpreter {expected}", backend.name());
        }
    }
    assert_eq!(interpreter::run(&func, &[1.0e300, 1.0e10]).unwrap(), f64::INFINITY);
    assert_eq!(interpreter::run(&func, &[-1.0e300, 1.0e10]).unwrap(), f64::NEG_INFINITY);
}

#[test]
fn sparse_high_registers_compile_everywhere() {
    // Sixteen registers declared, two used: fits every register file.
    let func = Function::new(
        "f",
        vec![Param::num("x")],
        16,
        vec![Instruction::with_const(Opcode::AddK, 15, 0, 1.0), Instruction::ret(15)],
    );
    assert_eq!(interpreter::run(&func, &[2.0]).unwrap(), 3.0);
    let registry = BackendRegistry::with_defaults();
    for backend in registry.available() {
        let artifact = jit::compile(backend, &func)
            .unwrap_or_else(|e| panic!("{} rejected a sparse function: {e}", backend.name()));
        assert_eq!(artifact.invoke(&[2.0]).unwrap(), 3.0, "{}", backend.name());
    }
}

#[test]
fn unwritten_registers_read_as_zero() {
    // r2 is never written before being read.
    let func = Function::new(
        "z",
        vec![Param::num("a")],
        3,
        vec![Instruction::regs3(Opcode::AddN, 1, 0, 2), Instruction::ret(1)],
    );
    let registry = BackendRegistry::with_defaults();
    for backend in registry.available() {
        let got = jit::compile(backend, &func).unwrap().invoke(&[7.5]).unwrap();
        assert_eq!(got, 7.5, "{}", backend.name());
    }
}

#[test]
fn artifacts_are_shared_across_threads() {
    let func = Function::new(
        "poly",
        vec![Param::num("x")],
        2,
        vec![
            Instruction::regs3(Opcode::MulN, 1, 0, 0),
            Instruction::with_const(Opcode::AddK, 1, 1, 1.0),
            Instruction::ret(1),
        ],
    );
    let registry = BackendRegistry::with_defaults();
    for backend in registry.available() {
        let artifact = jit::compile(backend, &func).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let artifact = &artifact;
                s.spawn(move || {
                    for i in 0..1000 {
                        let x = (t * 1000 + i) as f64;
                        assert_eq!(artifact.invoke(&[x]).unwrap(), x * x + 1.0);
                    }
                });
            }
        });
    }
}
