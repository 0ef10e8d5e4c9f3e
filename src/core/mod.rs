// This module gathers the infrastructure shared by every pass of the backend: the
// compilation session (arena allocation, interned strings, the constant-entity caches and
// compilation statistics), the error type, the code generation options and the pipeline
// driver that runs selection, address-mode folding, scheduling and emission for each
// function graph.

//! Core infrastructure.
//!
//! - [`session`] - arena, constant entities and statistics shared across functions
//! - [`error`] - [`CompileError`] and the [`CompileResult`] alias
//! - [`config`] - [`CodegenOptions`] with environment overrides
//! - [`compiler`] - [`CodegenPipeline`], the per-function driver

pub mod compiler;
pub mod config;
pub mod error;
pub mod session;

pub use compiler::{CodegenPipeline, CompiledFunction};
pub use config::{CodegenOptions, FpUnit, SchedulerKind};
pub use error::{CompileError, CompileResult};
pub use session::{CompilationSession, ConstEntity, KnownConst, SessionStats};
