//! Eligibility is exactly the allow-list: every allowed opcode passes, every
//! other opcode is refused, and nothing eligible is rejected by a backend.

use numjit::bytecode::{Function, Instruction, Literal, Opcode, Operand, OperandKind, Param, ParamType};
use numjit::jit::analysis::{self, ALLOWED, Ineligibility};
use numjit::jit::{self, BackendRegistry, JitError};

/// A well-formed instance of `op` over registers r0..r2.
fn sample(op: Opcode) -> Instruction {
    let [a, b, c] = op.shape().map(|kind| match kind {
        OperandKind::Reg => Operand::Reg(1),
        OperandKind::Imm => Operand::Imm(Literal::Num(2.0)),
        OperandKind::Offset => Operand::Offset(0),
        OperandKind::Index => Operand::Index(0),
        OperandKind::None => Operand::None,
    });
    Instruction::new(op, a, b, c)
}

fn wrap(op: Opcode) -> Function {
    let mut code = vec![sample(op)];
    if op != Opcode::Ret {
        code.push(Instruction::ret(1));
    }
    Function::new(op.mnemonic(), vec![Param::num("x")], 3, code)
}

#[test]
fn every_opcode_is_classified_by_the_allow_list() {
    for op in Opcode::ALL {
        let func = wrap(op);
        match analysis::analyze(&func) {
            Ok(_) => assert!(ALLOWED.contains(&op), "`{op}` accepted but not allowed"),
            Err(Ineligibility::DisallowedOpcode { index, opcode }) => {
                assert!(!ALLOWED.contains(&op), "`{op}` refused but allowed");
                assert_eq!((index, opcode), (0, op));
            }
            Err(other) => panic!("`{op}`: unexpected {other:?}"),
        }
    }
}

#[test]
fn eligible_functions_compile_on_every_backend() {
    let registry = BackendRegistry::with_defaults();
    for op in ALLOWED {
        let func = wrap(op);
        for backend in registry.available() {
            let artifact = jit::compile(backend, &func)
                .unwrap_or_else(|e| panic!("{} refused `{op}`: {e}", backend.name()));
            assert_eq!(artifact.arity(), 1);
            assert_eq!(artifact.function(), op.mnemonic());
        }
    }
}

#[test]
fn ineligible_functions_are_refused_before_any_backend_runs() {
    let registry = BackendRegistry::with_defaults();
    for op in Opcode::ALL.into_iter().filter(|op| !ALLOWED.contains(op)) {
        let func = wrap(op);
        for backend in registry.available() {
            match jit::compile(backend, &func) {
                Err(JitError::Ineligible { function, reason }) => {
                    assert_eq!(function, op.mnemonic());
                    assert_eq!(reason.code(), "ELG_001");
                }
                other => panic!("{}: `{op}` gave {other:?}", backend.name()),
            }
        }
    }
}

#[test]
fn non_numeric_inputs_are_refused() {
    let text_param = Function::new(
        "greet",
        vec![Param::num("n"), Param::new("name", ParamType::Text)],
        2,
        vec![Instruction::ret(0)],
    );
    assert!(matches!(
        analysis::analyze(&text_param),
        Err(Ineligibility::NonNumericParam { position: 1, .. })
    ));

    for literal in [Literal::Bool(true), Literal::Nil, Literal::Text("s".into())] {
        let func = Function::new(
            "k",
            vec![],
            1,
            vec![Instruction::load(0, literal.clone()), Instruction::ret(0)],
        );
        let err = analysis::analyze(&func).unwrap_err();
        assert_eq!(err.code(), "ELG_003", "{literal}");
    }
}

#[test]
fn return_placement_is_checked() {
    let missing = Function::new("m", vec![Param::num("x")], 2, vec![Instruction::regs2(Opcode::Neg, 1, 0)]);
    assert_eq!(analysis::analyze(&missing).unwrap_err(), Ineligibility::MissingReturn);

    let early = Function::new("e", vec![Param::num("x")], 1, vec![Instruction::ret(0), Instruction::ret(0)]);
    assert_eq!(analysis::analyze(&early).unwrap_err(), Ineligibility::EarlyReturn { index: 0 });

    let empty = Function::new("empty", vec![], 1, vec![]);
    assert_eq!(analysis::analyze(&empty).unwrap_err(), Ineligibility::MissingReturn);
}
