//! Native compilation of numeric bytecode functions.
//!
//! [`compile`] runs the eligibility check, then hands the approved function to
//! one [`Backend`]. Every backend produces a [`CompiledArtifact`] with the same
//! external shape, `extern "C" fn(f64, ...) -> f64`, so callers never care
//! which one they got.

pub mod analysis;
#[cfg(feature = "cranelift")]
pub mod cranelift;
pub mod direct;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod options;
pub mod registry;
pub mod regmap;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use numjit_rt::{MAX_ARGS, MemoryError, call_numeric};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::bytecode::Function;
use analysis::{EligibleFunction, Ineligibility};

pub use options::{CraneliftOpt, JitOptions, LlvmOpt};
pub use registry::BackendRegistry;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum JitError {
    #[error("`{function}` cannot be compiled: {reason}")]
    Ineligible {
        function: String,
        reason: Ineligibility,
    },
    #[error("{backend} backend failed on `{function}`: {message}")]
    Compile {
        backend: BackendKind,
        function: String,
        message: String,
    },
    #[error("no executable memory for `{function}`: {source}")]
    Memory {
        function: String,
        #[source]
        source: MemoryError,
    },
    #[error("{backend} backend is unavailable: {reason}")]
    BackendUnavailable { backend: BackendKind, reason: String },
    #[error("`{function}` takes {expected} argument(s), {given} given")]
    ArityMismatch {
        function: String,
        expected: usize,
        given: usize,
    },
    #[error("`{function}` has {params} parameters; native code takes at most {max}")]
    TooManyParams {
        function: String,
        params: usize,
        max: usize,
    },
    #[error("`{function}` uses {needed} registers; the {backend} backend has {available}")]
    RegisterPressure {
        backend: BackendKind,
        function: String,
        needed: usize,
        available: usize,
    },
}

impl JitError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            JitError::Ineligible { reason, .. } => reason.code(),
            JitError::BackendUnavailable { .. } => "JIT_001",
            JitError::Compile { .. }
            | JitError::TooManyParams { .. }
            | JitError::RegisterPressure { .. } => "JIT_002",
            JitError::Memory { .. } => "JIT_003",
            JitError::ArityMismatch { .. } => "JIT_004",
        }
    }

    pub fn function(&self) -> Option<&str> {
        match self {
            JitError::Ineligible { function, .. }
            | JitError::Compile { function, .. }
            | JitError::Memory { function, .. }
            | JitError::ArityMismatch { function, .. }
            | JitError::TooManyParams { function, .. }
            | JitError::RegisterPressure { function, .. } => Some(function),
            JitError::BackendUnavailable { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Direct,
    Cranelift,
    Llvm,
}

impl BackendKind {
    /// Preference order when the caller does not pick one.
    pub const ALL: [BackendKind; 3] = [BackendKind::Direct, BackendKind::Cranelift, BackendKind::Llvm];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Direct => "direct",
            BackendKind::Cranelift => "cranelift",
            BackendKind::Llvm => "llvm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown backend `{s}` (expected direct, cranelift or llvm)"))
    }
}

/// A code generator for eligible functions.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human-readable name, e.g. `direct (aarch64)`.
    fn name(&self) -> String;

    /// `Err` names why this backend cannot run on this host.
    fn availability(&self) -> Result<(), String>;

    fn is_available(&self) -> bool {
        self.availability().is_ok()
    }

    /// Generate native code for a function [`compile`] has already checked
    /// for availability and arity. Call [`compile`] instead: emitters assume
    /// both checks passed and do not repeat them.
    #[doc(hidden)]
    fn emit(&self, func: EligibleFunction<'_>) -> Result<CompiledArtifact, JitError>;
}

/// Check, then compile `func` with `backend`.
pub fn compile(backend: &dyn Backend, func: &Function) -> Result<CompiledArtifact, JitError> {
    backend
        .availability()
        .map_err(|reason| JitError::BackendUnavailable {
            backend: backend.kind(),
            reason,
        })?;
    let eligible = analysis::analyze(func).map_err(|reason| JitError::Ineligible {
        function: func.name().to_string(),
        reason,
    })?;
    if eligible.arity() > MAX_ARGS {
        return Err(JitError::TooManyParams {
            function: func.name().to_string(),
            params: eligible.arity(),
            max: MAX_ARGS,
        });
    }

    let start = Instant::now();
    let artifact = backend.emit(eligible)?;
    debug!(
        backend = %backend.name(),
        function = func.name(),
        code_size = artifact.code_size(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "compiled"
    );
    Ok(artifact)
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Owner of the memory an artifact's code lives in.
pub(crate) type CodeOwner = Box<dyn Send + Sync>;

/// A compiled function, callable until dropped.
pub struct CompiledArtifact {
    entry: *const u8,
    arity: usize,
    function: String,
    backend: BackendKind,
    code_size: Option<usize>,
    _code: CodeOwner,
}

// SAFETY: the entry pointer targets code owned by `_code`, which is immutable
// once finalized and outlives the pointer. The code only reads its arguments,
// so concurrent calls share nothing mutable.
unsafe impl Send for CompiledArtifact {}
unsafe impl Sync for CompiledArtifact {}

impl CompiledArtifact {
    /// # Safety
    ///
    /// `entry` must point at finalized executable code kept alive by `code`,
    /// implementing `extern "C" fn(f64 × arity) -> f64`.
    pub(crate) unsafe fn from_raw_parts(
        backend: BackendKind,
        function: &str,
        arity: usize,
        entry: *const u8,
        code_size: Option<usize>,
        code: CodeOwner,
    ) -> Self {
        CompiledArtifact {
            entry,
            arity,
            function: function.to_string(),
            backend,
            code_size,
            _code: code,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Bytes of machine code, when the backend reports it.
    pub fn code_size(&self) -> Option<usize> {
        self.code_size
    }

    /// Call the compiled function. A wrong argument count is refused before
    /// any native code runs.
    pub fn invoke(&self, args: &[f64]) -> Result<f64, JitError> {
        if args.len() != self.arity {
            return Err(JitError::ArityMismatch {
                function: self.function.clone(),
                expected: self.arity,
                given: args.len(),
            });
        }
        Ok(self.invoke_raw(args))
    }

    /// Call without the recoverable arity check.
    ///
    /// # Panics
    ///
    /// If `args.len()` differs from the arity.
    pub fn invoke_raw(&self, args: &[f64]) -> f64 {
        // SAFETY: `entry` is valid for the artifact's lifetime (see
        // `from_raw_parts`) and `call_numeric` asserts the argument count.
        unsafe { call_numeric(self.entry, self.arity, args) }
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("function", &self.function)
            .field("backend", &self.backend)
            .field("arity", &self.arity)
            .field("entry", &self.entry)
            .field("code_size", &self.code_size)
            .finish()
    }
}
