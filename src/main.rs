use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use opi::{CompileOptions, Module, Outcome, RunOptions, Vm, compile};

/// Compile a resolved IR module (JSON) to bytecode and run it.
#[derive(Parser, Debug)]
#[command(name = "opi", version, about)]
struct Cli {
    /// Path to the module, as JSON.
    file: PathBuf,

    /// Print the disassembled program instead of running it.
    #[arg(long)]
    dump: bool,

    /// Log compilation and collection events.
    #[arg(short, long)]
    verbose: bool,

    /// Never inline known functions.
    #[arg(long)]
    no_inline: bool,

    /// Omit call-site traces on propagated errors.
    #[arg(long)]
    no_traces: bool,

    /// Simulate ownership of every register after compiling each unit.
    #[arg(long)]
    verify: bool,

    #[arg(long, default_value_t = RunOptions::default().max_frames)]
    max_frames: usize,
}

fn main() {
    let cli = Cli::parse();

    let default = if cli.verbose { "opi=debug" } else { "opi=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    let source = match std::fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", cli.file.display(), e);
            std::process::exit(1);
        }
    };

    let module: Module = match serde_json::from_str(&source) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Malformed module: {}", e);
            std::process::exit(1);
        }
    };

    let opts = CompileOptions {
        inline: !cli.no_inline,
        traces: !cli.no_traces,
        verify_lifetimes: cli.verify || CompileOptions::default().verify_lifetimes,
        ..CompileOptions::default()
    };
    let program = match compile(&module, &opts) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            std::process::exit(1);
        }
    };

    if cli.dump {
        print!("{}", program.disassemble());
        return;
    }

    let mut vm = Vm::with_options(&program, RunOptions { max_frames: cli.max_frames });
    let mut outcome = vm.run();
    let result = loop {
        match outcome {
            Outcome::Returned(v) => break v,
            Outcome::Yielded(v, suspension) => {
                println!("yield {}", vm.render(v));
                vm.release(v);
                outcome = vm.resume(suspension);
            }
        }
    };

    let failed = vm.heap().is_undefined(result);
    let text = vm.render(result);
    vm.release(result);
    if failed {
        eprintln!("{}", text);
        std::process::exit(1);
    }
    println!("{}", text);
}
