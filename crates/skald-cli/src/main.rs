use std::{env, fs, io, process::ExitCode};

use skald::{Vm, VmConfig, compile};

/// Exit code for source that failed to compile (sysexits EX_DATAERR).
const EXIT_COMPILE_ERROR: u8 = 65;
/// Exit code for a runtime error (sysexits EX_SOFTWARE).
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    let mut trace = false;
    let mut path: Option<String> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--trace" => trace = true,
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            _ if arg.starts_with('-') => {
                eprintln!("error: unknown flag '{arg}'");
                print_usage();
                return ExitCode::FAILURE;
            }
            _ => {
                if path.replace(arg).is_some() {
                    eprintln!("error: expected exactly one source file");
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    let Some(path) = path else {
        print_usage();
        return ExitCode::FAILURE;
    };

    let source = match read_file(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read '{path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    let program = match compile(&source, &path) {
        Ok(program) => program,
        Err(diagnostics) => {
            for diagnostic in &diagnostics {
                eprintln!("{path}:{diagnostic}");
            }
            eprintln!(
                "error: {} compile error{}",
                diagnostics.len(),
                if diagnostics.len() == 1 { "" } else { "s" }
            );
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    let result = if trace {
        Vm::traced(VmConfig::default()).run(&program)
    } else {
        Vm::new(VmConfig::default()).run(&program)
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn read_file(path: &str) -> io::Result<String> {
    fs::read_to_string(path)
}

fn print_usage() {
    eprintln!("usage: skald [--trace] <file>");
}
