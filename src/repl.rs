//! The interactive prompt.

use std::io::{self, Write};
use std::path::PathBuf;

use colored::Colorize;

use crate::bytecode::vm::VM;

const HISTORY_FILE: &str = ".opal_history";

/// A line-oriented REPL. One VM lives for the whole session, so
/// globals persist from line to line; the execution stacks are reset
/// on every `interpret`.
pub struct Repl {
    vm: VM,
    history: Vec<String>,
    history_file: PathBuf,
}

impl Repl {
    pub fn new() -> Self {
        let history_file = Self::history_path();
        let mut repl = Self {
            vm: VM::new(),
            history: Vec::new(),
            history_file,
        };
        repl.load_history();
        repl
    }

    fn history_path() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(HISTORY_FILE)
        } else {
            PathBuf::from(HISTORY_FILE)
        }
    }

    fn load_history(&mut self) {
        if let Ok(content) = std::fs::read_to_string(&self.history_file) {
            for line in content.lines() {
                if !line.trim().is_empty() {
                    self.history.push(line.to_string());
                }
            }
        }
    }

    fn save_history(&self) {
        let content = self.history.join("\n");
        let _ = std::fs::write(&self.history_file, content);
    }

    /// Read lines until EOF, interpreting each one as a script.
    pub fn run(&mut self) {
        println!("Opal {}", env!("CARGO_PKG_VERSION"));
        println!("Type 'exit' to leave.\n");

        let stdin = io::stdin();
        loop {
            print!("> ");
            let _ = io::stdout().flush();

            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line == "exit" || line == "quit" {
                break;
            }

            self.history.push(line.to_string());
            if let Err(error) = self.vm.interpret(line) {
                eprintln!("{}", error.to_string().red());
            }
        }

        self.save_history();
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
