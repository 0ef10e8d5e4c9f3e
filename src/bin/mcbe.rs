//! mcbe driver: compiles textual IR to x86-64 assembly.
//!
//! Reads a module from a file (or stdin), runs the backend pipeline on every
//! function and prints AT&T assembly. Options default to the `MCBE_*`
//! environment overrides and are refined by the flags below.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use bumpalo::Bump;
use clap::Parser;

use mcbe::test_ir::parse_module;
use mcbe::x64::emitter::emit_constants;
use mcbe::x64::Simulator;
use mcbe::{CodegenOptions, CodegenPipeline, CompilationSession, FpUnit, SchedulerKind};

#[derive(Debug, Parser)]
#[command(name = "mcbe", version, about = "x86-64 backend for SSA graphs")]
struct Cli {
    /// Input module; reads stdin when omitted.
    input: Option<PathBuf>,

    /// Floating point unit to select for.
    #[arg(long, value_enum)]
    fpu: Option<FpUnit>,

    /// List-scheduling heuristic.
    #[arg(long, value_enum)]
    scheduler: Option<SchedulerKind>,

    /// Do not fold Add/Sub chains into LEAs.
    #[arg(long)]
    no_lea: bool,

    /// Do not fold loads and stores into address modes.
    #[arg(long)]
    no_am: bool,

    /// Annotate instructions with their node ids.
    #[arg(long, short)]
    verbose: bool,

    /// Print the per-block schedule instead of assembly.
    #[arg(long)]
    schedule_only: bool,

    /// Print session statistics to stderr after compiling.
    #[arg(long)]
    stats: bool,

    /// Simulate every function with these integer arguments and print the results.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    run: Option<Vec<i64>>,
}

impl Cli {
    fn options(&self) -> CodegenOptions {
        let mut options = CodegenOptions::from_env();
        if let Some(fpu) = self.fpu {
            options.fp_unit = fpu;
        }
        if let Some(scheduler) = self.scheduler {
            options.scheduler = scheduler;
        }
        if self.no_lea {
            options.fold_lea = false;
        }
        if self.no_am {
            options.fold_am = false;
        }
        options.verbose_asm = self.verbose;
        options
    }

    fn read_input(&self) -> io::Result<String> {
        match &self.input {
            Some(path) => fs::read_to_string(path),
            None => {
                let mut buffer = String::new();
                io::stdin().read_to_string(&mut buffer)?;
                Ok(buffer)
            }
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let text = cli.read_input()?;
    let graphs = parse_module(&text)?;
    log::info!("parsed {} function(s)", graphs.len());

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let pipeline = CodegenPipeline::new(&session, cli.options());

    let mut compiled = Vec::with_capacity(graphs.len());
    for graph in graphs {
        compiled.push(pipeline.compile(graph)?);
    }
    let constants = session.constants();

    if cli.schedule_only {
        for func in &compiled {
            println!("{}:", func.name);
            for block in func.graph.blocks() {
                println!("  {}:", func.graph.block(block).name());
                for node in func.schedule.iter(block) {
                    println!("    {} {}", node, func.graph.op(node));
                }
            }
        }
    } else if let Some(args) = &cli.run {
        for func in &compiled {
            let mut sim = Simulator::new(&func.graph, &func.schedule);
            sim.load_constants(&constants);
            let results = sim.run_ints(args)?;
            println!("{}: {:?} ({} steps)", func.name, results, sim.steps());
        }
    } else {
        for func in &compiled {
            print!("{}", func.asm);
        }
        print!("{}", emit_constants(&constants));
    }

    if cli.stats {
        eprintln!("{}", session.stats());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
