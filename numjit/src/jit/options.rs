//! Optimization levels for the IR backends. Parsed from config and flags
//! whether or not the backend itself is compiled in.

use std::fmt;
use std::str::FromStr;

/// Cranelift `opt_level` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CraneliftOpt {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl CraneliftOpt {
    pub fn as_str(self) -> &'static str {
        match self {
            CraneliftOpt::None => "none",
            CraneliftOpt::Speed => "speed",
            CraneliftOpt::SpeedAndSize => "speed_and_size",
        }
    }
}

impl fmt::Display for CraneliftOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CraneliftOpt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CraneliftOpt::None),
            "speed" => Ok(CraneliftOpt::Speed),
            "speed_and_size" => Ok(CraneliftOpt::SpeedAndSize),
            other => Err(format!(
                "unknown cranelift opt level `{other}` (expected none, speed or speed_and_size)"
            )),
        }
    }
}

/// LLVM code generation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlvmOpt {
    None,
    Less,
    Default,
    #[default]
    Aggressive,
}

impl LlvmOpt {
    pub fn as_str(self) -> &'static str {
        match self {
            LlvmOpt::None => "none",
            LlvmOpt::Less => "less",
            LlvmOpt::Default => "default",
            LlvmOpt::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for LlvmOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlvmOpt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "0" => Ok(LlvmOpt::None),
            "less" | "1" => Ok(LlvmOpt::Less),
            "default" | "2" => Ok(LlvmOpt::Default),
            "aggressive" | "3" => Ok(LlvmOpt::Aggressive),
            other => Err(format!(
                "unknown llvm opt level `{other}` (expected none, less, default or aggressive)"
            )),
        }
    }
}

/// Backend settings shared by the registry, config and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitOptions {
    pub cranelift_opt: CraneliftOpt,
    pub llvm_opt: LlvmOpt,
}
