// This module holds the code generation options that steer the backend passes. The floating
// point unit decides how float operations are selected (scalar SSE, the x87 stack unit, or
// none at all, in which case float operations are rejected). The address-mode optimizer's
// two passes can be switched off independently; doing so must never change the meaning of
// the generated code, only its quality. Further switches control increment/decrement
// selection, immediate operand folding and which list-scheduling heuristic is used.
// Options can be overridden from MCBE_* environment variables and map onto the flags of
// the mcbe driver binary.

use std::fmt;
use std::str::FromStr;

/// Floating point unit of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FpUnit {
    /// Scalar SSE2 arithmetic with hardware int/float conversions.
    #[default]
    Sse2,
    /// x87 stack unit; conversions go through memory.
    X87,
    /// Integer-only target, float operations are rejected.
    None,
}

impl FromStr for FpUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sse2" => Ok(FpUnit::Sse2),
            "x87" => Ok(FpUnit::X87),
            "none" => Ok(FpUnit::None),
            other => Err(format!("Unknown floating point unit '{}'", other)),
        }
    }
}

/// Priority heuristic of the list scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SchedulerKind {
    #[default]
    Trivial,
    RegPressure,
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(SchedulerKind::Trivial),
            "reg-pressure" | "regpress" => Ok(SchedulerKind::RegPressure),
            other => Err(format!("Unknown scheduler '{}'", other)),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Trivial => f.write_str("trivial"),
            SchedulerKind::RegPressure => f.write_str("reg-pressure"),
        }
    }
}

/// Options for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOptions {
    pub fp_unit: FpUnit,
    /// Fold Add/Sub chains into LEA address computations.
    pub fold_lea: bool,
    /// Fold loads and stores into source/destination address modes.
    pub fold_am: bool,
    /// Select inc/dec for additions of +1/-1.
    pub inc_dec: bool,
    /// Fold constants into immediate operands.
    pub immediates: bool,
    pub scheduler: SchedulerKind,
    /// Annotate emitted instructions with node ids.
    pub verbose_asm: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            fp_unit: FpUnit::Sse2,
            fold_lea: true,
            fold_am: true,
            inc_dec: true,
            immediates: true,
            scheduler: SchedulerKind::Trivial,
            verbose_asm: false,
        }
    }
}

impl CodegenOptions {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `MCBE_NO_LEA`, `MCBE_NO_AM`, `MCBE_SCHED` and `MCBE_FPU` from `lookup`.
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup("MCBE_NO_LEA").is_some_and(|v| v != "0") {
            self.fold_lea = false;
        }
        if lookup("MCBE_NO_AM").is_some_and(|v| v != "0") {
            self.fold_am = false;
        }
        if let Some(value) = lookup("MCBE_SCHED") {
            match value.parse() {
                Ok(kind) => self.scheduler = kind,
                Err(e) => log::warn!("ignoring MCBE_SCHED: {}", e),
            }
        }
        if let Some(value) = lookup("MCBE_FPU") {
            match value.parse() {
                Ok(unit) => self.fp_unit = unit,
                Err(e) => log::warn!("ignoring MCBE_FPU: {}", e),
            }
        }
        self
    }

    /// Same options with both address-mode passes disabled.
    pub fn without_folding(mut self) -> Self {
        self.fold_lea = false;
        self.fold_am = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let opts = CodegenOptions::default().with_env_overrides(|key| match key {
            "MCBE_NO_AM" => Some("1".to_string()),
            "MCBE_SCHED" => Some("reg-pressure".to_string()),
            "MCBE_FPU" => Some("bogus".to_string()),
            _ => None,
        });
        assert!(!opts.fold_am);
        assert!(opts.fold_lea);
        assert_eq!(opts.scheduler, SchedulerKind::RegPressure);
        assert_eq!(opts.fp_unit, FpUnit::Sse2);
    }

    #[test]
    fn test_without_folding() {
        let opts = CodegenOptions::default().without_folding();
        assert!(!opts.fold_am && !opts.fold_lea);
        assert!(opts.immediates);
    }
}
