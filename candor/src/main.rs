use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use candor::ast::{print_ast, Ast};
use candor::diagnostics::{CheckResult, Diagnostic};
use candor::{parser, Candor, DEFAULT_PAGE_SIZE};

#[derive(Parser)]
#[command(name = "candor")]
#[command(about = "The Candor language compiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a Candor source file
    Run {
        /// The file to run
        file: PathBuf,

        /// Heap page size in bytes
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },

    /// Check a Candor source file for errors
    Check {
        /// The file to check
        file: PathBuf,

        /// Output diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the bracketed AST of a source file
    Ast {
        /// The file to print
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, page_size } => run(&file, page_size),
        Commands::Check { file, json } => check(&file, json),
        Commands::Ast { file } => print_tree(&file),
    }
}

fn read(file: &PathBuf) -> Result<String, ExitCode> {
    std::fs::read_to_string(file).map_err(|e| {
        eprintln!("error: cannot read {}: {}", file.display(), e);
        ExitCode::FAILURE
    })
}

fn run(file: &PathBuf, page_size: u32) -> ExitCode {
    let source = match read(file) {
        Ok(source) => source,
        Err(code) => return code,
    };

    let mut vm = Candor::new(page_size);
    let script = match vm.compile_named(&source, &file.display().to_string()) {
        Ok(script) => script,
        Err(diagnostics) => {
            print_diagnostics(&diagnostics);
            return ExitCode::FAILURE;
        }
    };

    #[cfg(target_arch = "x86_64")]
    {
        let result = vm.run(&script);
        println!("{}", result);
        ExitCode::SUCCESS
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = script;
        eprintln!("error: execution requires x86-64");
        ExitCode::FAILURE
    }
}

fn check(file: &PathBuf, json: bool) -> ExitCode {
    let source = match read(file) {
        Ok(source) => source,
        Err(code) => return code,
    };

    let mut vm = Candor::new(DEFAULT_PAGE_SIZE);
    let diagnostics = match vm.compile_named(&source, &file.display().to_string()) {
        Ok(_) => Vec::new(),
        Err(diagnostics) => diagnostics,
    };

    let result = CheckResult {
        status: if diagnostics.is_empty() {
            "success".to_string()
        } else {
            "failure".to_string()
        },
        diagnostics,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result).unwrap());
    } else if result.diagnostics.is_empty() {
        println!("{}: ok", file.display());
    } else {
        print_diagnostics(&result.diagnostics);
    }

    if result.diagnostics.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_tree(file: &PathBuf) -> ExitCode {
    let source = match read(file) {
        Ok(source) => source,
        Err(code) => return code,
    };

    let mut ast = Ast::new();
    match parser::parse(&source, &mut ast) {
        Ok(entry) => {
            println!("{}", print_ast(&ast, &source, entry));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: parse error: {}", file.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        eprintln!(
            "{}:{}:{}: {} [{}]",
            d.location.file, d.location.line, d.location.col, d.message, d.code
        );
    }
}
