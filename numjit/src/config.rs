//! Settings, layered: defaults < `numjit.toml` < environment < CLI flags.
//!
//! `numjit.toml` is found by walking up from the working directory:
//!
//! ```toml
//! [jit]
//! backend = "cranelift"      # auto | interp | direct | cranelift | llvm
//! cranelift_opt = "speed"    # none | speed | speed_and_size
//! llvm_opt = "aggressive"    # none | less | default | aggressive
//!
//! [bench]
//! iterations = 1000000
//! warmup = 1000
//! ```
//!
//! The environment can override `NUMJIT_BACKEND` and
//! `NUMJIT_BENCH_ITERATIONS`. CLI flags are applied by the binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::bench::BenchSettings;
use crate::jit::{BackendKind, JitOptions};

pub const FILE_NAME: &str = "numjit.toml";
pub const ENV_BACKEND: &str = "NUMJIT_BACKEND";
pub const ENV_BENCH_ITERATIONS: &str = "NUMJIT_BENCH_ITERATIONS";

/// Which engine `numjit run` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// The preferred available backend, falling back to the interpreter for
    /// ineligible functions.
    #[default]
    Auto,
    Interpreter,
    Jit(BackendKind),
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChoice::Auto => f.write_str("auto"),
            BackendChoice::Interpreter => f.write_str("interp"),
            BackendChoice::Jit(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for BackendChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackendChoice::Auto),
            "interp" | "interpreter" => Ok(BackendChoice::Interpreter),
            other => other.parse().map(BackendChoice::Jit).map_err(|_| {
                format!("unknown backend `{other}` (expected auto, interp, direct, cranelift or llvm)")
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("${var}: {message}")]
    Env { var: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub backend: BackendChoice,
    pub jit: JitOptions,
    pub bench: BenchSettings,
    /// The `numjit.toml` that was applied, if any.
    pub file: Option<PathBuf>,
}

impl Config {
    /// Defaults, then the nearest `numjit.toml` above `dir`, then the process
    /// environment.
    pub fn load(dir: &Path) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = find_config(dir) {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            config.apply_file(&content, &path)?;
        }
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply the contents of a `numjit.toml`. Unknown sections and keys are
    /// ignored.
    pub fn apply_file(&mut self, content: &str, path: &Path) -> Result<(), ConfigError> {
        let mut section = String::new();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let err = |message: String| ConfigError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                message,
            };
            let (key, value) =
                parse_key_value(trimmed).ok_or_else(|| err(format!("expected `key = value`, found `{trimmed}`")))?;
            match (section.as_str(), key) {
                ("jit", "backend") => self.backend = value.parse().map_err(err)?,
                ("jit", "cranelift_opt") => self.jit.cranelift_opt = value.parse().map_err(err)?,
                ("jit", "llvm_opt") => self.jit.llvm_opt = value.parse().map_err(err)?,
                ("bench", "iterations") => {
                    self.bench.iterations = parse_count(&value).map_err(err)?;
                }
                ("bench", "warmup") => self.bench.warmup = parse_count(&value).map_err(err)?,
                _ => {}
            }
        }
        self.file = Some(path.to_path_buf());
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_BACKEND).filter(|v| !v.is_empty()) {
            self.backend = v.parse().map_err(|message| ConfigError::Env {
                var: ENV_BACKEND,
                message,
            })?;
        }
        if let Some(v) = lookup(ENV_BENCH_ITERATIONS).filter(|v| !v.is_empty()) {
            self.bench.iterations = parse_count(&v).map_err(|message| ConfigError::Env {
                var: ENV_BENCH_ITERATIONS,
                message,
            })?;
        }
        Ok(())
    }
}

/// Search for `numjit.toml` starting from `dir` and walking up.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let mut current = dir.to_path_buf();
    loop {
        let candidate = current.join(FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Parse `key = value`, stripping quotes and trailing comments from the value.
fn parse_key_value(line: &str) -> Option<(&str, String)> {
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let value = if let Some(rest) = raw.strip_prefix('"') {
        rest.split_once('"')?.0.to_string()
    } else {
        raw.split('#').next().unwrap_or("").trim().to_string()
    };
    Some((key, value))
}

fn parse_count(value: &str) -> Result<u64, String> {
    value
        .replace('_', "")
        .parse()
        .map_err(|_| format!("expected a non-negative integer, found `{value}`"))
}
