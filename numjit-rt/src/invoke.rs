//! Call thunks for compiled numeric functions.
//!
//! Every backend produces code with the platform C signature
//! `extern "C" fn(f64, ...) -> f64`, so arguments travel in the floating-point
//! argument registers (`d0-d7` on AAPCS64, `xmm0-xmm7` on System V) and the
//! result comes back in the first of them.

/// Largest arity the thunks can marshal: the FP argument registers shared by
/// both supported calling conventions.
pub const MAX_ARGS: usize = 8;

type Fn0 = extern "C" fn() -> f64;
type Fn1 = extern "C" fn(f64) -> f64;
type Fn2 = extern "C" fn(f64, f64) -> f64;
type Fn3 = extern "C" fn(f64, f64, f64) -> f64;
type Fn4 = extern "C" fn(f64, f64, f64, f64) -> f64;
type Fn5 = extern "C" fn(f64, f64, f64, f64, f64) -> f64;
type Fn6 = extern "C" fn(f64, f64, f64, f64, f64, f64) -> f64;
type Fn7 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64) -> f64;
type Fn8 = extern "C" fn(f64, f64, f64, f64, f64, f64, f64, f64) -> f64;

/// Call native code taking exactly `arity` doubles and returning a double.
///
/// # Panics
///
/// If `args.len() != arity` or `arity > MAX_ARGS`. Callers are expected to
/// have rejected both long before reaching here; getting this far with a
/// mismatch means the compiler and its caller disagree about the signature,
/// and running the code anyway would read garbage registers.
///
/// # Safety
///
/// `entry` must point at finalized, executable code implementing
/// `extern "C" fn(f64 × arity) -> f64`, and that code must stay mapped for
/// the duration of the call.
pub unsafe fn call_numeric(entry: *const u8, arity: usize, args: &[f64]) -> f64 {
    assert!(
        arity <= MAX_ARGS,
        "native numeric call with arity {arity} exceeds the {MAX_ARGS} argument registers"
    );
    assert_eq!(
        args.len(),
        arity,
        "native numeric call with {} arguments for a function of arity {arity}",
        args.len()
    );
    assert!(!entry.is_null(), "native numeric call through a null entry point");

    // SAFETY (all arms): the caller guarantees `entry` implements the
    // signature matching `args.len()`, which the asserts above pinned.
    unsafe {
        match *args {
            [] => std::mem::transmute::<*const u8, Fn0>(entry)(),
            [a] => std::mem::transmute::<*const u8, Fn1>(entry)(a),
            [a, b] => std::mem::transmute::<*const u8, Fn2>(entry)(a, b),
            [a, b, c] => std::mem::transmute::<*const u8, Fn3>(entry)(a, b, c),
            [a, b, c, d] => std::mem::transmute::<*const u8, Fn4>(entry)(a, b, c, d),
            [a, b, c, d, e] => std::mem::transmute::<*const u8, Fn5>(entry)(a, b, c, d, e),
            [a, b, c, d, e, f] => std::mem::transmute::<*const u8, Fn6>(entry)(a, b, c, d, e, f),
            [a, b, c, d, e, f, g] => {
                std::mem::transmute::<*const u8, Fn7>(entry)(a, b, c, d, e, f, g)
            }
            [a, b, c, d, e, f, g, h] => {
                std::mem::transmute::<*const u8, Fn8>(entry)(a, b, c, d, e, f, g, h)
            }
            _ => unreachable!("arity bounded by MAX_ARGS above"),
        }
    }
}
