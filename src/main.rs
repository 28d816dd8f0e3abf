// File: src/main.rs
//
// CLI entry point: `run` compiles and executes a .fun script file,
// `repl` opens an interactive session, `dump` prints the disassembled
// bytecode without running it (spec §3's command surface).

mod array;
mod bytecode;
mod compiler;
mod debugger;
mod errors;
mod map;
mod repl;
mod strings;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;

#[derive(ClapParser)]
#[command(
    name = "fun",
    about = "Fun: a small indentation-sensitive scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run a .fun script file
    Run {
        /// Path to the .fun file
        file: PathBuf,

        /// Print a runtime execution trace to stderr
        #[arg(long)]
        trace: bool,
    },

    /// Launch the interactive REPL
    Repl,

    /// Compile a .fun file and print its disassembled bytecode
    Dump {
        /// Path to the .fun file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, trace } => {
            let path = file.to_string_lossy().to_string();
            let chunk = match compiler::compile_file(&path) {
                Ok(bc) => bc,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };

            let mut vm = vm::Vm::new();
            vm.set_trace(trace);
            match vm.run(Rc::new(chunk)) {
                Ok(()) => {
                    vm.print_output();
                    std::process::exit(vm.exit_code());
                }
                Err(e) => {
                    vm.print_output();
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                std::process::exit(1);
            }
        },

        Commands::Dump { file } => {
            let path = file.to_string_lossy().to_string();
            match compiler::compile_file(&path) {
                Ok(bc) => print!("{}", bc.dump()),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
