use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use numjit::bench::{self, BenchSettings};
use numjit::bytecode::asm::parse_program;
use numjit::bytecode::{Function, Program};
use numjit::config::{BackendChoice, Config};
use numjit::diagnostics::{CheckResult, Diagnostic, RunResult, Severity};
use numjit::interpreter;
use numjit::jit::direct::{Arch, MachineCode, assemble_for};
use numjit::jit::{self, BackendRegistry, JitError, analysis};

#[derive(Parser)]
#[command(name = "numjit")]
#[command(about = "Run numeric bytecode functions natively")]
#[command(version)]
struct Cli {
    /// Log compilation details (overrides NUMJIT_LOG with numjit=debug)
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one function and print its result
    Run {
        /// The .nbc file to load
        file: PathBuf,

        /// Function to run (defaults to the first in the file)
        #[arg(long)]
        func: Option<String>,

        /// auto, interp, direct, cranelift or llvm
        #[arg(long)]
        backend: Option<BackendChoice>,

        /// Output the result as JSON
        #[arg(long)]
        json: bool,

        /// Numeric arguments
        #[arg(allow_negative_numbers = true)]
        args: Vec<f64>,
    },

    /// Report which functions can be compiled natively
    Check {
        /// The .nbc file to check
        file: PathBuf,

        /// Output diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Time the interpreter against every available backend
    Bench {
        file: PathBuf,

        #[arg(long)]
        func: Option<String>,

        /// Calls per engine
        #[arg(long)]
        iterations: Option<u64>,

        #[arg(long)]
        json: bool,

        #[arg(allow_negative_numbers = true)]
        args: Vec<f64>,
    },

    /// List backends and whether they run on this host
    Backends {
        #[arg(long)]
        json: bool,
    },

    /// Hex dump of the direct encoder's output for a function
    Asm {
        file: PathBuf,

        #[arg(long)]
        func: Option<String>,

        /// aarch64 or x86_64 (defaults to the host)
        #[arg(long)]
        arch: Option<Arch>,
    },
}

fn main() {
    let cli = Cli::parse();
    numjit::init_logging(cli.trace);

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = match Config::load(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(file) = &config.file {
        info!(config = %file.display(), "loaded configuration");
    }

    let ok = match cli.command {
        Commands::Run {
            file,
            func,
            backend,
            json,
            args,
        } => run(&config, &file, func.as_deref(), backend.unwrap_or(config.backend), json, &args),
        Commands::Check { file, json } => {
            let result = match load(&file) {
                Ok(program) => CheckResult::of_program(&program),
                Err(d) => CheckResult::failure(d),
            };
            if json {
                print_json(&result);
            } else {
                print_check(&result);
            }
            !result.is_failure()
        }
        Commands::Bench {
            file,
            func,
            iterations,
            json,
            args,
        } => {
            let settings = BenchSettings {
                iterations: iterations.unwrap_or(config.bench.iterations),
                ..config.bench
            };
            bench_file(&config, &file, func.as_deref(), settings, json, &args)
        }
        Commands::Backends { json } => {
            let rows = BackendRegistry::with_options(&config.jit).report();
            if json {
                print_json(&rows);
            } else {
                let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
                for row in &rows {
                    match &row.reason {
                        None => println!("  {:<width$}  available", row.name),
                        Some(reason) => println!("  {:<width$}  unavailable: {reason}", row.name),
                    }
                }
            }
            true
        }
        Commands::Asm { file, func, arch } => asm(&file, func.as_deref(), arch),
    };

    if !ok {
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load(path: &Path) -> Result<Program, Diagnostic> {
    let source = std::fs::read_to_string(path).map_err(|e| Diagnostic::io(path, &e))?;
    parse_program(&source).map_err(|e| Diagnostic::asm(path, &e))
}

fn select<'p>(program: &'p Program, path: &Path, name: Option<&str>) -> Result<&'p Function, Diagnostic> {
    program
        .select(name)
        .ok_or_else(|| Diagnostic::missing_function(path, name))
}

fn run(config: &Config, path: &Path, name: Option<&str>, choice: BackendChoice, json: bool, args: &[f64]) -> bool {
    let program = match load(path) {
        Ok(p) => p,
        Err(d) => return report_run(RunResult::failure(name.unwrap_or(""), choice.to_string(), d), json),
    };
    let func = match select(&program, path, name) {
        Ok(f) => f,
        Err(d) => return report_run(RunResult::failure(name.unwrap_or(""), choice.to_string(), d), json),
    };
    let registry = BackendRegistry::with_options(&config.jit);

    let result = match choice {
        BackendChoice::Interpreter => interpret(func, args, Vec::new()),
        BackendChoice::Jit(kind) => match registry.get(kind) {
            Ok(backend) => native(backend, func, args),
            Err(e) => RunResult::failure(func.name(), kind.to_string(), Diagnostic::jit(&e)),
        },
        BackendChoice::Auto => match (registry.preferred(), analysis::analyze(func)) {
            (Some(backend), Ok(_)) => native(backend, func, args),
            (None, _) => {
                warn!(function = func.name(), "no native backend on this host; interpreting");
                interpret(func, args, Vec::new())
            }
            (Some(_), Err(reason)) => {
                warn!(function = func.name(), %reason, "falling back to the interpreter");
                interpret(func, args, vec![Diagnostic::fallback(func.name(), &reason)])
            }
        },
    };
    report_run(result, json)
}

fn interpret(func: &Function, args: &[f64], notes: Vec<Diagnostic>) -> RunResult {
    match interpreter::run(func, args) {
        Ok(v) => RunResult::success(func.name(), "interpreter".to_string(), v, notes),
        Err(e) => RunResult::failure(func.name(), "interpreter".to_string(), Diagnostic::interp(&e)),
    }
}

fn native(backend: &dyn jit::Backend, func: &Function, args: &[f64]) -> RunResult {
    let outcome = jit::compile(backend, func).and_then(|artifact| artifact.invoke(args));
    match outcome {
        Ok(v) => RunResult::success(func.name(), backend.name(), v, Vec::new()),
        Err(e) => RunResult::failure(func.name(), backend.name(), Diagnostic::jit(&e)),
    }
}

fn report_run(result: RunResult, json: bool) -> bool {
    let ok = result.status == "success";
    if json {
        print_json(&result);
        return ok;
    }
    if let Some(value) = result.result {
        println!("{value}");
    }
    print_diagnostics(&result.diagnostics);
    ok
}

fn bench_file(
    config: &Config,
    path: &Path,
    name: Option<&str>,
    settings: BenchSettings,
    json: bool,
    args: &[f64],
) -> bool {
    let program = match load(path) {
        Ok(p) => p,
        Err(d) => {
            print_diagnostics(&[d]);
            return false;
        }
    };
    let func = match select(&program, path, name) {
        Ok(f) => f,
        Err(d) => {
            print_diagnostics(&[d]);
            return false;
        }
    };
    let registry = BackendRegistry::with_options(&config.jit);
    let report = match bench::run(&registry, func, args, settings) {
        Ok(r) => r,
        Err(e) => {
            print_diagnostics(&[Diagnostic::interp(&e)]);
            return false;
        }
    };
    if json {
        print_json(&report);
    } else {
        print!("{}", bench::render(&report));
    }
    if !report.consistent() {
        eprintln!("error: a backend disagrees with the interpreter");
        return false;
    }
    true
}

fn asm(path: &Path, name: Option<&str>, arch: Option<Arch>) -> bool {
    let dumped = load(path)
        .and_then(|program| {
            let func = select(&program, path, name)?;
            dump(func, arch).map_err(|e| Diagnostic::jit(&e))
        });
    match dumped {
        Ok(text) => {
            print!("{text}");
            true
        }
        Err(d) => {
            print_diagnostics(&[d]);
            false
        }
    }
}

fn dump(func: &Function, arch: Option<Arch>) -> Result<String, JitError> {
    let Some(arch) = arch.or_else(Arch::host) else {
        return Err(JitError::BackendUnavailable {
            backend: jit::BackendKind::Direct,
            reason: "this host has no direct encoder; pass --arch".to_string(),
        });
    };
    let eligible = analysis::analyze(func).map_err(|reason| JitError::Ineligible {
        function: func.name().to_string(),
        reason,
    })?;
    let code = assemble_for(arch, eligible).map_err(|e| JitError::RegisterPressure {
        backend: jit::BackendKind::Direct,
        function: func.name().to_string(),
        needed: e.needed,
        available: e.available,
    })?;
    Ok(hex_dump(func.name(), arch, &code))
}

fn hex_dump(name: &str, arch: Arch, code: &MachineCode) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "; {name} for {arch}: {} code bytes, {} constant(s)",
        code.code_len, code.constants
    );
    hex_lines(&mut out, 0, code.code());
    if code.constants > 0 {
        let _ = writeln!(out, "; constant pool");
        hex_lines(&mut out, code.pool_offset, code.pool());
    }
    out
}

fn hex_lines(out: &mut String, base: usize, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let _ = writeln!(out, "{:04x}: {}", base + i * 16, hex.join(" "));
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("error: cannot serialize output: {e}"),
    }
}

fn print_check(result: &CheckResult) {
    for f in &result.functions {
        let mark = if f.eligible { "✓" } else { "✗" };
        let verdict = if f.eligible { "native" } else { "interpreter only" };
        println!("{mark} {}/{}: {verdict}", f.name, f.arity);
    }
    print_diagnostics(&result.diagnostics);
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diag in diagnostics {
        eprintln!("{}: {} [{}]", site(diag), diag.message, diag.code);
        for suggestion in &diag.suggestions {
            eprintln!("  → {}: {}", suggestion.strategy, suggestion.description);
        }
    }
    let errors = diagnostics.iter().filter(|d| d.is_error()).count();
    if errors > 0 {
        eprintln!("\n{errors} error(s) found");
    }
}

fn site(diag: &Diagnostic) -> String {
    let mut site = match &diag.location {
        Some(loc) => format!("{}:{}", loc.file, loc.line),
        None => String::new(),
    };
    if let Some(function) = &diag.function {
        if !site.is_empty() {
            site.push(' ');
        }
        site.push_str(function);
        if let Some(index) = diag.instruction {
            let _ = write!(site, "@{index}");
        }
    }
    let level = match diag.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "note",
    };
    if site.is_empty() {
        level.to_string()
    } else {
        format!("{site}: {level}")
    }
}
