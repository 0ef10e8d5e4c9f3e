// This module defines the pipeline driver of the backend. CodegenPipeline owns the options
// of one compilation and borrows the session that collects constants and statistics across
// functions. For every function graph it runs instruction selection, verifies the selected
// graph, optionally folds LEAs and address modes, sweeps nodes the folds left unreachable,
// list-schedules every block with the x86-64 timing model and the configured heuristic,
// verifies the schedule and finally prints the function. The graph and schedule are handed
// back with the assembly so callers (tests, the driver binary, a register allocator) can
// inspect or re-emit them. Module compilation concatenates the functions and appends the
// read-only data of every constant entity created along the way.

//! Pipeline driver.
//!
//! Typical flow:
//! ```text
//! for each function graph {
//!     select_graph(graph)          // target-independent -> x86-64 nodes
//!     verify_selected(graph)
//!     fold_leas / fold_address_modes   (optional)
//!     remove_unreachable
//!     list_schedule(graph)         // per block
//!     verify_schedule
//!     AsmEmitter::emit_function
//! }
//! emit_constants(session.constants())
//! ```

use crate::ir::Graph;
use crate::sched::{
    list_schedule, verify_schedule, RegPressureHeuristic, SchedHeuristic, Schedule,
    TrivialHeuristic,
};
use crate::x64::emitter::emit_constants;
use crate::x64::{
    fold_address_modes, fold_leas, select_graph, verify_selected, AsmEmitter, RegisterMap,
    X64Timing,
};

use super::config::{CodegenOptions, SchedulerKind};
use super::error::CompileResult;
use super::session::CompilationSession;

/// Result of compiling one function.
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: String,
    /// Selected, folded target graph.
    pub graph: Graph,
    pub schedule: Schedule,
    /// AT&T assembly text of the function.
    pub asm: String,
}

impl CompiledFunction {
    /// Re-emits the function with registers assigned by an allocator.
    pub fn emit_with_registers(&self, regs: &RegisterMap, verbose: bool) -> CompileResult<String> {
        AsmEmitter::new(&self.graph, &self.schedule)
            .with_registers(regs)
            .verbose(verbose)
            .emit_function()
    }
}

/// Drives graphs through selection, folding, scheduling and emission.
pub struct CodegenPipeline<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    options: CodegenOptions,
}

impl<'s, 'arena> CodegenPipeline<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, options: CodegenOptions) -> Self {
        Self { session, options }
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    pub fn session(&self) -> &'s CompilationSession<'arena> {
        self.session
    }

    fn heuristic(&self) -> Box<dyn SchedHeuristic> {
        match self.options.scheduler {
            SchedulerKind::Trivial => Box::new(TrivialHeuristic),
            SchedulerKind::RegPressure => Box::new(RegPressureHeuristic),
        }
    }

    /// Selects and optimizes `graph` in place, stopping before scheduling.
    pub fn lower(&self, graph: &mut Graph) -> CompileResult<()> {
        self.session.set_current_function(graph.name());
        select_graph(graph, self.session, &self.options)?;
        verify_selected(graph)?;
        if self.options.fold_lea {
            fold_leas(graph, self.session);
        }
        if self.options.fold_am {
            fold_address_modes(graph, self.session);
        }
        let removed = graph.remove_unreachable();
        log::debug!("{}: {} dead nodes swept after folding", graph.name(), removed);
        Ok(())
    }

    /// Lowers `graph` and schedules every block.
    pub fn schedule(&self, graph: &mut Graph) -> CompileResult<Schedule> {
        self.lower(graph)?;
        let mut heuristic = self.heuristic();
        let schedule = list_schedule(graph, &X64Timing, heuristic.as_mut())?;
        for block in graph.blocks() {
            self.session.record_block_scheduled(schedule.len(block));
        }
        verify_schedule(graph, &schedule)?;
        Ok(schedule)
    }

    /// Runs the whole pipeline on one function.
    pub fn compile(&self, mut graph: Graph) -> CompileResult<CompiledFunction> {
        let name = graph.name().to_string();
        log::debug!("compiling {} with {:?}", name, self.options);
        let schedule = self.schedule(&mut graph)?;
        let asm = AsmEmitter::new(&graph, &schedule)
            .verbose(self.options.verbose_asm)
            .emit_function()?;
        self.session.record_function_compiled(&name, asm.lines().count());
        log::info!("compiled {}", name);
        Ok(CompiledFunction {
            name,
            graph,
            schedule,
            asm,
        })
    }

    /// Compiles every function and appends the constants they created.
    pub fn compile_module(&self, graphs: Vec<Graph>) -> CompileResult<String> {
        let mut out = String::new();
        for graph in graphs {
            out.push_str(&self.compile(graph)?.asm);
        }
        out.push_str(&emit_constants(&self.session.constants()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, Mode};
    use bumpalo::Bump;

    fn add_one() -> Graph {
        let mut b = GraphBuilder::new("add_one", &[Mode::I64]);
        let one = b.konst(Mode::I64, 1);
        let x = b.arg(0);
        let sum = b.add(x, one);
        let mem = b.initial_mem();
        b.ret(mem, &[sum]);
        b.finish()
    }

    #[test]
    fn test_compile_records_stats() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let pipeline = CodegenPipeline::new(&session, CodegenOptions::default());
        let compiled = pipeline.compile(add_one()).unwrap();

        assert!(compiled.asm.contains("add_one:"));
        assert!(compiled.asm.contains("\tincq %v"));
        assert!(compiled.asm.contains("\tret"));
        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 1);
        assert!(stats.blocks_scheduled >= 1);
        assert_eq!(stats.largest_function_name, "add_one");
    }

    #[test]
    fn test_module_appends_float_constants() {
        let mut b = GraphBuilder::new("half", &[Mode::F64]);
        let half = b.fconst(Mode::F64, 0.5);
        let x = b.arg(0);
        let product = b.mul(x, half);
        let mem = b.initial_mem();
        b.ret(mem, &[product]);

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let pipeline = CodegenPipeline::new(&session, CodegenOptions::default());
        let asm = pipeline.compile_module(vec![b.finish()]).unwrap();
        assert!(asm.contains("\t.section\t.rodata"));
        assert!(asm.contains(&format!("{:#x}", 0.5f64.to_bits())));
    }
}
