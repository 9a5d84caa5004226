//! Structured results for `numjit check` and `numjit run`.
//!
//! Codes are stable: `ELG_*` for eligibility, `JIT_*` for compilation and
//! invocation, `ASM_001` for unreadable bytecode, `IO_001` for unreadable
//! files, `RUN_001` for interpreter failures, `RUN_002` for a function the
//! file does not define.

use std::path::Path;

use serde::Serialize;

use crate::bytecode::asm::AsmError;
use crate::bytecode::{Function, Program};
use crate::interpreter::InterpError;
use crate::jit::JitError;
use crate::jit::analysis::{self, Ineligibility};

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub strategy: String,
    pub description: String,
}

/// A single diagnostic message.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<usize>,
    pub message: String,
    pub suggestions: Vec<Suggestion>,
}

impl Diagnostic {
    fn new(code: &str, severity: Severity, message: String) -> Self {
        Diagnostic {
            code: code.to_string(),
            severity,
            location: None,
            function: None,
            instruction: None,
            message,
            suggestions: Vec::new(),
        }
    }

    pub fn ineligible(function: &str, reason: &Ineligibility) -> Self {
        let mut d = Diagnostic::new(reason.code(), Severity::Warning, reason.to_string());
        d.function = Some(function.to_string());
        d.instruction = reason.instruction();
        if let Some(description) = reason.suggestion() {
            d.suggestions.push(Suggestion {
                strategy: "interpret".to_string(),
                description,
            });
        }
        d
    }

    pub fn jit(err: &JitError) -> Self {
        if let JitError::Ineligible { function, reason } = err {
            let mut d = Diagnostic::ineligible(function, reason);
            d.severity = Severity::Error;
            return d;
        }
        let mut d = Diagnostic::new(err.code(), Severity::Error, err.to_string());
        d.function = err.function().map(str::to_string);
        if let JitError::BackendUnavailable { .. } = err {
            d.suggestions.push(Suggestion {
                strategy: "backend".to_string(),
                description: "run `numjit backends` to see what this host supports".to_string(),
            });
        }
        d
    }

    pub fn asm(file: &Path, err: &AsmError) -> Self {
        let mut d = Diagnostic::new("ASM_001", Severity::Error, err.to_string());
        d.location = Some(Location {
            file: file.display().to_string(),
            line: err.line(),
        });
        d
    }

    pub fn io(file: &Path, err: &std::io::Error) -> Self {
        let mut d = Diagnostic::new("IO_001", Severity::Error, format!("failed to read file: {err}"));
        d.location = Some(Location {
            file: file.display().to_string(),
            line: 0,
        });
        d
    }

    pub fn interp(err: &InterpError) -> Self {
        let mut d = Diagnostic::new("RUN_001", Severity::Error, err.to_string());
        d.function = match err {
            InterpError::Arity { function, .. }
            | InterpError::Unsupported { function, .. }
            | InterpError::Malformed { function, .. }
            | InterpError::MissingReturn { function } => Some(function.clone()),
        };
        if let InterpError::Unsupported { index, .. } | InterpError::Malformed { index, .. } = err {
            d.instruction = Some(*index);
        }
        d
    }

    pub fn missing_function(file: &Path, name: Option<&str>) -> Self {
        let message = match name {
            Some(n) => format!("no function `{n}` in this file"),
            None => "file defines no functions".to_string(),
        };
        let mut d = Diagnostic::new("RUN_002", Severity::Error, message);
        d.location = Some(Location {
            file: file.display().to_string(),
            line: 0,
        });
        d.function = name.map(str::to_string);
        d
    }

    /// Fallback notice for `run --backend auto`.
    pub fn fallback(function: &str, reason: &Ineligibility) -> Self {
        let mut d = Diagnostic::ineligible(function, reason);
        d.severity = Severity::Info;
        d.message = format!("ran in the interpreter: {reason}");
        d
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Eligibility of one function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCheck {
    pub name: String,
    pub arity: usize,
    pub registers: u8,
    pub eligible: bool,
}

/// The result of `numjit check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: String,
    pub functions: Vec<FunctionCheck>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CheckResult {
    pub fn failure(diagnostic: Diagnostic) -> Self {
        CheckResult {
            status: "failure".to_string(),
            functions: Vec::new(),
            diagnostics: vec![diagnostic],
        }
    }

    /// Analyze every function of `program`. Ineligible functions are
    /// warnings: the interpreter can still run them.
    pub fn of_program(program: &Program) -> Self {
        let mut functions = Vec::new();
        let mut diagnostics = Vec::new();
        for func in program.functions() {
            let verdict = analysis::analyze(func);
            if let Err(reason) = &verdict {
                diagnostics.push(Diagnostic::ineligible(func.name(), reason));
            }
            functions.push(FunctionCheck::new(func, verdict.is_ok()));
        }
        CheckResult {
            status: "success".to_string(),
            functions,
            diagnostics,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == "failure"
    }
}

impl FunctionCheck {
    fn new(func: &Function, eligible: bool) -> Self {
        FunctionCheck {
            name: func.name().to_string(),
            arity: func.arity(),
            registers: func.register_count(),
            eligible,
        }
    }
}

/// The result of `numjit run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: String,
    pub function: String,
    /// `interpreter` or the backend's name.
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunResult {
    pub fn success(function: &str, engine: String, result: f64, diagnostics: Vec<Diagnostic>) -> Self {
        RunResult {
            status: "success".to_string(),
            function: function.to_string(),
            engine,
            result: Some(result),
            diagnostics,
        }
    }

    pub fn failure(function: &str, engine: String, diagnostic: Diagnostic) -> Self {
        RunResult {
            status: "failure".to_string(),
            function: function.to_string(),
            engine,
            result: None,
            diagnostics: vec![diagnostic],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::asm::parse_program;
    use crate::jit::BackendKind;

    const SRC: &str = r#"
fn ok(x: num) regs=2 {
    addk r1, r0, 1
    ret r1
}
fn branchy(x: num) regs=2 {
    jmpf r0, +1
    ret r0
}
"#;

    #[test]
    fn check_reports_each_function() {
        let result = CheckResult::of_program(&parse_program(SRC).unwrap());
        assert_eq!(result.status, "success");
        assert_eq!(result.functions.len(), 2);
        assert!(result.functions[0].eligible);
        assert!(!result.functions[1].eligible);

        let d = &result.diagnostics[0];
        assert_eq!(d.code, "ELG_001");
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.function.as_deref(), Some("branchy"));
        assert_eq!(d.instruction, Some(0));
        assert_eq!(d.suggestions.len(), 1);
    }

    #[test]
    fn json_shape() {
        let result = CheckResult::of_program(&parse_program(SRC).unwrap());
        let json: serde_json::Value = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["functions"][1]["name"], "branchy");
        assert_eq!(json["diagnostics"][0]["severity"], "warning");
        assert_eq!(json["diagnostics"][0]["message"], "contains a `jmpf` instruction (at 0)");
        assert!(json["diagnostics"][0].get("location").is_none());
    }

    #[test]
    fn jit_errors_carry_codes() {
        let err = JitError::BackendUnavailable {
            backend: BackendKind::Llvm,
            reason: "built without the `llvm` feature".into(),
        };
        let d = Diagnostic::jit(&err);
        assert_eq!(d.code, "JIT_001");
        assert!(d.is_error());
        assert!(d.function.is_none());

        let err = JitError::ArityMismatch {
            function: "f".into(),
            expected: 3,
            given: 2,
        };
        let d = Diagnostic::jit(&err);
        assert_eq!(d.code, "JIT_004");
        assert_eq!(d.function.as_deref(), Some("f"));
    }

    #[test]
    fn asm_errors_have_a_location() {
        let err = parse_program("fn f() {\n  bogus r0\n}\n").unwrap_err();
        let d = Diagnostic::asm(Path::new("x.nbc"), &err);
        assert_eq!(d.code, "ASM_001");
        let loc = d.location.unwrap();
        assert_eq!((loc.file.as_str(), loc.line), ("x.nbc", 2));
    }
}
