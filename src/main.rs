//! The `capstan` command-line driver: compile a textual IR file, show the
//! generated code, and run its `main`.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use capstone::arch::x86::ArchMode;
use capstone::arch::BuildsCapstone;
use capstone::Capstone;
use clap::Parser;

use capstan_codegen::{write, CallConv};
use capstan_jit::JITBuilder;

/// Compile and JIT-execute a Capstan IR file.
#[derive(Parser)]
#[command(name = "capstan", version, about)]
struct Args {
    /// The IR file to compile.
    file: PathBuf,

    /// Skip the optimization pipeline.
    #[arg(long)]
    no_opt: bool,

    /// Print the IR after parsing and again after optimization.
    #[arg(long)]
    print_ir: bool,

    /// Suppress the machine-code listing.
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let mut module = capstan_reader::parse_module(&text)?;
    if args.print_ir {
        println!("----- after parsing -----");
        print!("{}", write::module_to_string(&module));
    }

    if !args.no_opt {
        capstan_codegen::optimize(&mut module)?;
        if args.print_ir {
            println!("----- after optimization -----");
            print!("{}", write::module_to_string(&module));
        }
    }

    let compilation = capstan_codegen::lower(&mut module, CallConv::host_default())?;
    if !args.quiet {
        for byte in &compilation.code {
            print!("{byte:02X} ");
        }
        println!();
        disassemble(&compilation.code)?;
    }

    let main_ix = module
        .find_function("main")
        .ok_or_else(|| anyhow!("no `main` function in {}", args.file.display()))?;
    let returns_float = module.functions[main_ix].return_type.is_float();

    let jit = JITBuilder::new().finish(compilation)?;
    let entry = jit
        .lookup("main")
        .ok_or_else(|| anyhow!("`main` was not emitted"))?;

    if returns_float {
        let jit_main: extern "C" fn(i64, i64) -> f64 = unsafe { std::mem::transmute(entry) };
        println!("{}", jit_main(0, 0));
    } else {
        let jit_main: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(entry) };
        println!("{}", jit_main(0, 0));
    }
    Ok(())
}

fn disassemble(code: &[u8]) -> Result<()> {
    let cs = Capstone::new()
        .x86()
        .mode(ArchMode::Mode64)
        .build()
        .map_err(|e| anyhow!("capstone: {e}"))?;
    let insns = cs
        .disasm_all(code, 0)
        .map_err(|e| anyhow!("capstone: {e}"))?;
    for insn in insns.iter() {
        println!(
            "{:#06x}    {} {}",
            insn.address(),
            insn.mnemonic().unwrap_or(""),
            insn.op_str().unwrap_or("")
        );
    }
    Ok(())
}
