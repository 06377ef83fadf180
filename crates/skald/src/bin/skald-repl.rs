//! A minimal interactive shell for trying out Skald.
//!
//! Each line is compiled and run on one shared VM, so globals and functions
//! persist across inputs. A line that parses as a single expression is
//! wrapped in `print(...)` so its value shows up, mimicking what every
//! language shell does.

use std::io::{self, BufRead, Write};

use skald::{Vm, VmConfig, compile};

fn main() {
    println!("skald repl — type 'exit' to quit");
    let mut vm = Vm::new(VmConfig::default());
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        // Expression lines get printed; lines that already look like
        // statements (or print themselves) run as-is.
        let statement_like = ["let ", "const ", "fn ", "if ", "while ", "for ", "match ", "print"]
            .iter()
            .any(|keyword| line.starts_with(keyword));
        let wrapped = if statement_like {
            None
        } else {
            compile(&format!("print({line})"), "repl").ok()
        };
        let program = match wrapped {
            Some(program) => program,
            None => match compile(line, "repl") {
                Ok(program) => program,
                Err(diagnostics) => {
                    for diagnostic in diagnostics {
                        eprintln!("{diagnostic}");
                    }
                    continue;
                }
            },
        };

        if let Err(err) = vm.run(&program) {
            eprintln!("{err}");
        }
    }
}
