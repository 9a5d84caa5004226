//! Side-by-side timing of the interpreter and every available backend.

use std::fmt::Write as _;
use std::hint::black_box;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::bytecode::Function;
use crate::interpreter::{self, InterpError};
use crate::jit::{self, BackendKind, BackendRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchSettings {
    pub iterations: u64,
    pub warmup: u64,
}

impl Default for BenchSettings {
    fn default() -> Self {
        BenchSettings {
            iterations: 1_000_000,
            warmup: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchRow {
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    /// Whether the result matches the interpreter's.
    pub agrees: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_us: Option<f64>,
    pub iterations: u64,
    pub total_ms: f64,
    pub per_call_ns: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub function: String,
    pub args: Vec<f64>,
    pub rows: Vec<BenchRow>,
}

impl BenchReport {
    /// True when every backend that ran agrees with the interpreter.
    pub fn consistent(&self) -> bool {
        self.rows.iter().all(|r| r.error.is_some() || r.agrees)
    }
}

/// Equal up to rounding. NaN agrees with NaN.
pub fn agrees(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    if a == b {
        return true;
    }
    if a.is_infinite() || b.is_infinite() {
        return false;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-12
}

fn timed(iterations: u64, mut call: impl FnMut() -> f64) -> Duration {
    let start = Instant::now();
    for _ in 0..iterations {
        black_box(call());
    }
    start.elapsed()
}

fn row(engine: String, backend: Option<BackendKind>, iterations: u64) -> BenchRow {
    BenchRow {
        engine,
        backend,
        result: None,
        agrees: false,
        compile_us: None,
        iterations,
        total_ms: 0.0,
        per_call_ns: 0.0,
        error: None,
    }
}

fn fill_timing(row: &mut BenchRow, elapsed: Duration) {
    row.total_ms = elapsed.as_secs_f64() * 1e3;
    row.per_call_ns = if row.iterations == 0 {
        0.0
    } else {
        elapsed.as_nanos() as f64 / row.iterations as f64
    };
}

/// Benchmark `func` on `args`. Fails only if the interpreter itself cannot
/// run the function; a backend that cannot compile it gets an error row.
pub fn run(
    registry: &BackendRegistry,
    func: &Function,
    args: &[f64],
    settings: BenchSettings,
) -> Result<BenchReport, InterpError> {
    let reference = interpreter::run(func, args)?;
    let mut rows = Vec::new();

    let mut interp = row("interpreter".to_string(), None, settings.iterations);
    for _ in 0..settings.warmup {
        black_box(interpreter::run(func, black_box(args))?);
    }
    let elapsed = timed(settings.iterations, || {
        interpreter::run(func, black_box(args)).unwrap_or(f64::NAN)
    });
    interp.result = Some(reference);
    interp.agrees = true;
    fill_timing(&mut interp, elapsed);
    rows.push(interp);

    for backend in registry.available() {
        let mut r = row(backend.name(), Some(backend.kind()), settings.iterations);
        let start = Instant::now();
        let artifact = match jit::compile(backend, func) {
            Ok(a) => a,
            Err(e) => {
                warn!(backend = %backend.name(), error = %e, "benchmark compile failed");
                r.iterations = 0;
                r.error = Some(e.to_string());
                rows.push(r);
                continue;
            }
        };
        r.compile_us = Some(start.elapsed().as_secs_f64() * 1e6);

        let result = match artifact.invoke(args) {
            Ok(v) => v,
            Err(e) => {
                r.iterations = 0;
                r.error = Some(e.to_string());
                rows.push(r);
                continue;
            }
        };
        for _ in 0..settings.warmup {
            black_box(artifact.invoke_raw(black_box(args)));
        }
        let elapsed = timed(settings.iterations, || artifact.invoke_raw(black_box(args)));
        r.result = Some(result);
        r.agrees = agrees(result, reference);
        fill_timing(&mut r, elapsed);
        debug!(engine = %r.engine, per_call_ns = r.per_call_ns, "benchmarked");
        rows.push(r);
    }

    Ok(BenchReport {
        function: func.name().to_string(),
        args: args.to_vec(),
        rows,
    })
}

/// Plain-text table.
pub fn render(report: &BenchReport) -> String {
    let mut out = String::new();
    let args: Vec<String> = report.args.iter().map(f64::to_string).collect();
    let _ = writeln!(out, "{}({})", report.function, args.join(", "));
    let width = report
        .rows
        .iter()
        .map(|r| r.engine.len())
        .max()
        .unwrap_or(0)
        .max("engine".len());
    let _ = writeln!(
        out,
        "  {:<width$}  {:>14}  {:>12}  {:>12}  {:>10}",
        "engine", "result", "compile", "total", "per call"
    );
    for r in &report.rows {
        if let Some(err) = &r.error {
            let _ = writeln!(out, "  {:<width$}  error: {err}", r.engine);
            continue;
        }
        let result = r.result.map(|v| v.to_string()).unwrap_or_default();
        let mark = if r.agrees { "" } else { " (MISMATCH)" };
        let compile = r
            .compile_us
            .map(|us| format!("{us:.1}us"))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:<width$}  {:>14}  {:>12}  {:>10.3}ms  {:>8.2}ns{mark}",
            r.engine, result, compile, r.total_ms, r.per_call_ns
        );
    }
    out
}
