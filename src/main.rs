use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use clausal::{Error, FsLoader, Interpreter, Program, check_program};

/// Host stack for the interpreter thread; non-tail recursion up to
/// `MAX_EVAL_DEPTH` must fit in debug builds too
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "clausal", version, about = "Run and type-check clausal programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        file: PathBuf,
        /// Type-check first and refuse to run a program with diagnostics
        #[arg(long)]
        check: bool,
    },
    /// Type-check a program without running it (exit 1 on any diagnostic)
    Check { file: PathBuf },
    /// Interactive session
    #[cfg(feature = "repl")]
    Repl,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Only initialize if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let worker = std::thread::Builder::new()
        .name("clausal".into())
        .stack_size(STACK_SIZE)
        .spawn(move || match cli.command {
            Commands::Run { file, check } => cmd_run(&file, check),
            Commands::Check { file } => cmd_check(&file),
            #[cfg(feature = "repl")]
            Commands::Repl => repl::run(),
        });

    let handle = match worker {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: cannot start interpreter thread: {e}");
            return ExitCode::FAILURE;
        }
    };
    match handle.join() {
        Ok(code) => code,
        Err(panic_info) => {
            eprintln!("The interpreter encountered an unexpected error and must exit.");
            if let Some(msg) = panic_info.downcast_ref::<&str>() {
                eprintln!("Error: {msg}");
            } else if let Some(msg) = panic_info.downcast_ref::<String>() {
                eprintln!("Error: {msg}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Read a program; `use` paths resolve relative to its directory
fn load(file: &Path) -> Result<Program, Error> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| Error::EvalError(format!("cannot read {}: {e}", file.display())))?;
    let root = file.parent().unwrap_or_else(|| Path::new("."));
    Program::load(&source, &FsLoader::new(root))
}

fn cmd_run(file: &Path, check: bool) -> ExitCode {
    let program = match load(file) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if check {
        let report = check_program(&program);
        if !report.is_clean() {
            eprint!("{report}");
            return ExitCode::FAILURE;
        }
    }

    let mut interpreter = Interpreter::new(program);
    match interpreter.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_check(file: &Path) -> ExitCode {
    let program = match load(file) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let report = check_program(&program);
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        print!("{report}");
        eprintln!("{} diagnostic(s)", report.diagnostics.len());
        ExitCode::FAILURE
    }
}

#[cfg(feature = "repl")]
mod repl {
    use std::process::ExitCode;

    use rustyline::DefaultEditor;
    use rustyline::error::ReadlineError;

    use clausal::builtinops::get_builtin_ops;
    use clausal::{FsLoader, Interpreter, Program, Value, check_program};

    pub(super) fn run() -> ExitCode {
        println!("clausal interactive session");
        println!("Enter expressions like: (+ 1 2)");
        println!("Type :help for more commands, or Ctrl+D to exit.");
        println!();

        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Error: could not initialize the line editor: {e}");
                return ExitCode::FAILURE;
            }
        };
        let mut interpreter = Interpreter::new(Program::default());
        let loader = FsLoader::new(".");
        let mut pending = String::new();

        loop {
            let prompt = if pending.is_empty() { "clausal> " } else { "   ...> " };
            match rl.readline(prompt) {
                Ok(line) => {
                    if pending.is_empty() {
                        let command = line.trim();
                        if command.is_empty() {
                            continue;
                        }
                        let _ = rl.add_history_entry(command);
                        match command {
                            ":help" => {
                                print_help();
                                continue;
                            }
                            ":env" => {
                                print_environment(&interpreter);
                                continue;
                            }
                            ":check" => {
                                print!("{}", check_program(interpreter.program()));
                                continue;
                            }
                            ":quit" | ":exit" => {
                                println!("Goodbye!");
                                break;
                            }
                            _ => {}
                        }
                    } else {
                        let _ = rl.add_history_entry(line.trim());
                    }

                    pending.push_str(&line);
                    pending.push('\n');
                    if is_incomplete(&pending) {
                        continue;
                    }

                    let source = std::mem::take(&mut pending);
                    match interpreter.eval_source(&source, &loader) {
                        // Definitions and '() are not echoed
                        Ok(Value::Nil) => {}
                        Ok(value) => println!("{}", value.repr()),
                        Err(e) => println!("Error: {e}"),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl+C abandons a partial entry
                    pending.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(err) => {
                    println!("Error: {err:?}");
                    break;
                }
            }
        }
        ExitCode::SUCCESS
    }

    /// More open than close parens outside strings and comments
    fn is_incomplete(source: &str) -> bool {
        let mut depth = 0i64;
        let mut in_string = false;
        let mut escaped = false;
        let mut in_comment = false;
        for c in source.chars() {
            match c {
                '\n' if in_comment => in_comment = false,
                _ if in_comment => {}
                _ if escaped => escaped = false,
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                _ if in_string => {}
                ';' => in_comment = true,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
        }
        depth > 0 || in_string
    }

    fn print_help() {
        println!("Commands:");
        println!("  :help      - Show this help message");
        println!("  :env       - Show user functions and global bindings");
        println!("  :check     - Type-check everything entered so far");
        println!("  :quit      - Exit the session");
        println!("  :exit      - Exit the session");
        println!("  Ctrl+D     - Exit the session");
        println!();
        println!("Each entry is loaded as its own module: re-entering a function");
        println!("replaces it, so give all clauses of a function in one entry.");
        println!("An entry with unbalanced parentheses continues on the next line.");
        println!();
        println!("Examples:");
        println!("  (def fact (0) 1) (def fact (n:int) :int (* n (fact (- n 1))))");
        println!("  (fact 10)");
        println!("  (def nat (n) (list n (+ n 1)))");
        println!("  (head (tail (gen nat 0)))");
        println!();
    }

    fn print_environment(interpreter: &Interpreter) {
        let builtins: Vec<&str> = get_builtin_ops().iter().map(|op| op.id).collect();
        println!("Built-in functions ({}):", builtins.len());
        // Print in columns for readability
        for row in builtins.chunks(4) {
            for name in row {
                print!("  {name:<15}");
            }
            println!();
        }
        println!();

        let program = interpreter.program();
        let mut functions: Vec<_> = program.functions.values().collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        if !functions.is_empty() {
            println!("User functions ({}):", functions.len());
            for def in functions {
                println!("  {} ({} clauses) : {}", def.name, def.clauses.len(), def.signature());
            }
            println!();
        }

        let names = interpreter.globals().names();
        if !names.is_empty() {
            println!("Global bindings ({}):", names.len());
            for name in names {
                if let Some(value) = interpreter.globals().get(&name) {
                    println!("  {name} = {}", value.repr());
                }
            }
        }
    }

}
