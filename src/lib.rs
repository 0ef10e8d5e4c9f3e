//! mcbe - machine-code backend for SSA program graphs.
//!
//! Lowers a target-independent SSA graph to x86-64: instruction selection, LEA and
//! address-mode folding, per-block list scheduling and AT&T assembly emission.
//!
//! # Primary Usage
//!
//! ```ignore
//! use mcbe::core::{CodegenOptions, CodegenPipeline, CompilationSession};
//! use mcbe::ir::{GraphBuilder, Mode};
//! use bumpalo::Bump;
//!
//! let mut b = GraphBuilder::new("inc", &[Mode::I64]);
//! let one = b.konst(Mode::I64, 1);
//! let sum = b.add(b.arg(0), one);
//! let mem = b.initial_mem();
//! b.ret(mem, &[sum]);
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let pipeline = CodegenPipeline::new(&session, CodegenOptions::default());
//! let compiled = pipeline.compile(b.finish())?;
//! println!("{}", compiled.asm);
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - graph arena, builder and analyses
//! - [`core`] - session, errors, options and the pipeline driver
//! - [`sched`] - list scheduler, schedule and query layer
//! - [`x64`] - selection, address modes, emitter and simulator
//! - [`test_ir`] - textual IR used by tests and the driver binary

pub mod core;
pub mod ir;
pub mod sched;
pub mod test_ir;
pub mod x64;

pub use core::{
    CodegenOptions, CodegenPipeline, CompilationSession, CompileError, CompileResult,
    CompiledFunction, FpUnit, SchedulerKind, SessionStats,
};
pub use ir::{Graph, GraphBuilder, Mode};
pub use sched::Schedule;
