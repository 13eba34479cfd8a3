//! Opal CLI: run files, evaluate snippets, or start the REPL.

use std::env;
use std::path::Path;
use std::process;

use opal::error::OpalError;
use opal::repl::Repl;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Exit codes follow the BSD sysexits convention.
const EX_USAGE: i32 = 64;
const EX_COMPILE: i32 = 65;
const EX_RUNTIME: i32 = 70;
const EX_IO: i32 = 74;

/// CLI command to execute.
enum Command {
    /// Start the REPL
    Repl,
    /// Run a script file
    Run { file: String },
    /// Evaluate a string
    Eval { code: String },
}

/// CLI options parsed from arguments.
struct Options {
    command: Command,
    disassemble: bool,
}

fn print_usage() {
    eprintln!("Opal {} - a small scripting language", VERSION);
    eprintln!();
    eprintln!("Usage: opal [options] [script.opal]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e <code>        Evaluate code directly");
    eprintln!("  --disassemble    Print the compiled bytecode before running");
    eprintln!("  --help, -h       Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  opal                      Start the interactive REPL");
    eprintln!("  opal script.opal          Run a script file");
    eprintln!("  opal -e 'print 1 + 1;'    Evaluate code directly");
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut options = Options {
        command: Command::Repl,
        disassemble: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "--disassemble" => {
                options.disassemble = true;
            }
            "-e" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("-e requires an argument");
                    print_usage();
                    process::exit(EX_USAGE);
                }
                options.command = Command::Eval {
                    code: args[i].clone(),
                };
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                print_usage();
                process::exit(EX_USAGE);
            }
            file => {
                if !matches!(options.command, Command::Repl) {
                    print_usage();
                    process::exit(EX_USAGE);
                }
                options.command = Command::Run {
                    file: file.to_string(),
                };
            }
        }
        i += 1;
    }

    options
}

fn main() {
    let options = parse_args();

    let result = match options.command {
        Command::Repl => {
            Repl::new().run();
            return;
        }
        Command::Run { file } => opal::interpret_file(Path::new(&file), options.disassemble),
        Command::Eval { code } => opal::run_with_options(&code, options.disassemble),
    };

    if let Err(error) = result {
        eprintln!("{}", error);
        let code = match error {
            OpalError::Compile(_) => EX_COMPILE,
            OpalError::Runtime(_) => EX_RUNTIME,
            OpalError::Io(_) => EX_IO,
        };
        process::exit(code);
    }
}
