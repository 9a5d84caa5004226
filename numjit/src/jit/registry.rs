//! The set of backends compiled into this build, queried at runtime.

use serde::Serialize;

use super::direct::{Aarch64, DirectBackend, X86_64};
use super::options::JitOptions;
use super::{Backend, BackendKind, JitError};

/// One row of `numjit backends`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        BackendRegistry {
            backends: Vec::new(),
        }
    }

    /// Every backend this build carries, at default optimization levels.
    pub fn with_defaults() -> Self {
        Self::with_options(&JitOptions::default())
    }

    #[cfg_attr(not(any(feature = "cranelift", feature = "llvm")), allow(unused_variables))]
    pub fn with_options(options: &JitOptions) -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(DirectBackend::<Aarch64>::new()));
        registry.register(Box::new(DirectBackend::<X86_64>::new()));
        #[cfg(feature = "cranelift")]
        registry.register(Box::new(super::cranelift::CraneliftBackend::new(
            options.cranelift_opt,
        )));
        #[cfg(feature = "llvm")]
        registry.register(Box::new(super::llvm::LlvmBackend::new(options.llvm_opt)));
        registry
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends.iter().map(|b| b.as_ref())
    }

    /// Backends usable on this host, in preference order.
    pub fn available(&self) -> Vec<&dyn Backend> {
        BackendKind::ALL
            .into_iter()
            .flat_map(|kind| self.of_kind(kind))
            .filter(|b| b.is_available())
            .collect()
    }

    /// The usable backend of `kind`, or why there is none.
    pub fn get(&self, kind: BackendKind) -> Result<&dyn Backend, JitError> {
        let mut reasons = Vec::new();
        for backend in self.of_kind(kind) {
            match backend.availability() {
                Ok(()) => return Ok(backend),
                Err(reason) => reasons.push(reason),
            }
        }
        let reason = if reasons.is_empty() {
            not_built(kind)
        } else {
            reasons.join("; ")
        };
        Err(JitError::BackendUnavailable {
            backend: kind,
            reason,
        })
    }

    /// Direct, then Cranelift, then LLVM.
    pub fn preferred(&self) -> Option<&dyn Backend> {
        self.available().into_iter().next()
    }

    /// Status of every backend kind, including ones not compiled in.
    pub fn report(&self) -> Vec<BackendStatus> {
        let mut rows = Vec::new();
        for kind in BackendKind::ALL {
            let mut any = false;
            for backend in self.of_kind(kind) {
                any = true;
                let availability = backend.availability();
                rows.push(BackendStatus {
                    kind,
                    name: backend.name(),
                    available: availability.is_ok(),
                    reason: availability.err(),
                });
            }
            if !any {
                rows.push(BackendStatus {
                    kind,
                    name: kind.to_string(),
                    available: false,
                    reason: Some(not_built(kind)),
                });
            }
        }
        rows
    }

    fn of_kind(&self, kind: BackendKind) -> impl Iterator<Item = &dyn Backend> {
        self.all().filter(move |b| b.kind() == kind)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn not_built(kind: BackendKind) -> String {
    match kind {
        BackendKind::Direct => "no direct encoder is registered".to_string(),
        other => format!("built without the `{other}` feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::direct::Arch;

    #[test]
    fn direct_availability_follows_the_host() {
        let registry = BackendRegistry::with_defaults();
        let direct = registry.get(BackendKind::Direct);
        match Arch::host() {
            Some(_) => assert!(direct.is_ok()),
            None => assert!(matches!(direct, Err(JitError::BackendUnavailable { .. }))),
        }
    }

    #[test]
    fn preferred_is_first_available() {
        let registry = BackendRegistry::with_defaults();
        let available = registry.available();
        match registry.preferred() {
            Some(p) => assert_eq!(p.kind(), available[0].kind()),
            None => assert!(available.is_empty()),
        }
        let kinds: Vec<_> = available.iter().map(|b| b.kind()).collect();
        let mut sorted = kinds.clone();
        sorted.sort_by_key(|k| BackendKind::ALL.iter().position(|x| x == k));
        assert_eq!(kinds, sorted);
    }

    #[test]
    fn report_covers_every_kind() {
        let rows = BackendRegistry::with_defaults().report();
        for kind in BackendKind::ALL {
            assert!(rows.iter().any(|r| r.kind == kind), "{kind}");
        }
        // Both encoders are listed even though at most one can run.
        assert_eq!(rows.iter().filter(|r| r.kind == BackendKind::Direct).count(), 2);
    }

    #[cfg(not(feature = "llvm"))]
    #[test]
    fn missing_feature_is_named() {
        let err = BackendRegistry::with_defaults().get(BackendKind::Llvm).err().unwrap();
        assert_eq!(err.to_string(), "llvm backend is unavailable: built without the `llvm` feature");
    }

    #[test]
    fn empty_registry_has_nothing() {
        let registry = BackendRegistry::empty();
        assert!(registry.preferred().is_none());
        assert!(registry.get(BackendKind::Cranelift).is_err());
    }
}
