// File: src/repl.rs
//
// Interactive REPL for the Fun language. Keeps the teacher's shape: a
// rustyline editor with history, a colon-command surface, and an
// indentation-aware multi-line continuation heuristic (here: continue
// reading while the trailing line ends with a colon-less block header or
// while we're inside an open bracket/paren/string). Persists global
// variable bindings and VM state across lines via `ReplSession`/`Vm`, and
// exposes the VM's debugger through `:break`/`:step`/`:next`/`:finish`/
// `:continue`/`:trace` (spec §4.6).

use crate::compiler::ReplSession;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::rc::Rc;

pub struct Repl {
    session: ReplSession,
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { session: ReplSession::new(), vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║             Fun REPL - Interactive Shell            ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Indent with two spaces to open a block", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "fun> ".bright_green().to_string()
            } else {
                "...> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if self.is_input_complete(&buffer, &line) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// A snippet stays open once its first line opens a block (`if`,
    /// `while`, `for`, `fun`, `class`, `else`) until a blank line is
    /// entered to signal the dedent back to top level; any other single
    /// line completes immediately.
    fn is_input_complete(&self, buffer: &str, last_line: &str) -> bool {
        let line_count = buffer.lines().count();
        if line_count <= 1 {
            let head = last_line.trim_start();
            let opens_block = ["if", "while", "for", "fun", "class", "else"]
                .iter()
                .any(|kw| head == *kw || head.starts_with(&format!("{} ", kw)) || head.starts_with(&format!("{}(", kw)));
            return !opens_block;
        }
        last_line.trim().is_empty()
    }

    fn handle_command(&mut self, cmd: &str) -> bool {
        let mut parts = cmd.splitn(2, ' ');
        let head = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match head {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.session = ReplSession::new();
                self.vm = Vm::new();
                println!("{}", "Environment reset".bright_green());
                true
            }
            ":break" => {
                if let Some((file, line)) = rest.rsplit_once(':') {
                    if let Ok(ln) = line.parse::<i64>() {
                        let id = self.vm.debugger.add_breakpoint(file.to_string(), ln);
                        println!("{} breakpoint {} at {}:{}", "Set".bright_green(), id, file, ln);
                        return true;
                    }
                }
                println!("{} usage: :break <file>:<line>", "Error:".bright_red());
                true
            }
            ":step" => {
                self.vm.debugger.request_step(0);
                println!("{}", "Stepping".bright_blue());
                true
            }
            ":next" => {
                self.vm.debugger.request_next(0, 0);
                println!("{}", "Stepping over".bright_blue());
                true
            }
            ":finish" => {
                self.vm.debugger.request_finish(0, 0);
                println!("{}", "Finishing current frame".bright_blue());
                true
            }
            ":continue" => {
                self.vm.debugger.request_continue();
                println!("{}", "Continuing".bright_blue());
                true
            }
            ":trace" => {
                match rest {
                    "on" => self.vm.set_trace(true),
                    "off" => self.vm.set_trace(false),
                    _ => println!("{} usage: :trace on|off", "Error:".bright_red()),
                }
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    head.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h     ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q     ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c    ".dimmed());
        println!("  {}{}  Reset environment", ":reset".bright_yellow(), " or :r   ".dimmed());
        println!("  {}  Set a breakpoint at file:line", ":break <file>:<line>".bright_yellow());
        println!("  {}  Step one instruction", ":step".bright_yellow());
        println!("  {}  Step over the current call", ":next".bright_yellow());
        println!("  {}  Run until the current frame returns", ":finish".bright_yellow());
        println!("  {}  Resume normal execution", ":continue".bright_yellow());
        println!("  {}  Toggle execution tracing", ":trace on|off".bright_yellow());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  A line ending in a block header (if/while/for/fun/class)");
        println!("  or an indented continuation keeps reading until a");
        println!("  blank, unindented line closes the snippet.");
        println!();
        println!("{}", "Example:".bright_cyan().bold());
        println!();
        println!("  {}", "fun> fun greet(name)".dimmed());
        println!("  {}", "...>   print(\"Hello, \" + name)".dimmed());
        println!("  {}", "...> ".dimmed());
        println!("  {}", "fun> greet(\"World\")".dimmed());
        println!();
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }

        let bc = match self.session.compile_line(input) {
            Ok(bc) => bc,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };

        match self.vm.run(Rc::new(bc)) {
            Ok(()) => {
                for v in self.vm.drain_output() {
                    println!("{} {}", "=>".bright_blue(), v.to_display_string());
                }
            }
            Err(e) => {
                self.vm.print_output();
                println!("{}", e);
            }
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("Failed to create REPL")
    }
}
