//! Command-line driver: compile a test-IR file to a relocatable object,
//! dump analyzer state, or map and run a function in process.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use target_lexicon::{Architecture, Triple};

use tarmac_codegen::adaptor::IrAdaptor;
use tarmac_codegen::analyzer::Analyzer;
use tarmac_jit::ElfMapper;
use tarmac_reader::{compile_a64, compile_x64, module::Module, Arch};

#[derive(Parser)]
#[command(name = "tarmac", about = "Single-pass back-end driver", version)]
struct Args {
    /// Input IR file.
    input: PathBuf,

    /// Path for the output object file.
    #[arg(short = 'o', long = "obj-out")]
    output: Option<PathBuf>,

    /// Target triple override (only the architecture is honored).
    #[arg(long = "target")]
    target: Option<String>,

    /// Print the parsed IR.
    #[arg(long)]
    print_ir: bool,

    /// Print the block reverse post-order per function.
    #[arg(long)]
    print_rpo: bool,

    /// Print the final block layout per function.
    #[arg(long)]
    print_layout: bool,

    /// Print the loop tree per function.
    #[arg(long)]
    print_loops: bool,

    /// Print the liveness intervals per function.
    #[arg(long)]
    print_liveness: bool,

    /// Map the module into memory and call this function; its return
    /// value becomes the exit status.
    #[arg(long)]
    run: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mut module =
        tarmac_reader::parse_module(&text).map_err(|e| anyhow!("parse error: {e}"))?;

    if args.print_ir {
        print!("{}", module.print());
    }

    let dump_analysis =
        args.print_rpo || args.print_layout || args.print_loops || args.print_liveness;
    if dump_analysis {
        print_analysis(&mut module, &args);
    }

    let arch = match &args.target {
        Some(triple) => {
            let triple = Triple::from_str(triple)
                .map_err(|e| anyhow!("invalid target triple: {e}"))?;
            match triple.architecture {
                Architecture::X86_64 => Arch::X64,
                Architecture::Aarch64(_) => Arch::A64,
                other => bail!("unsupported architecture {other}"),
            }
        }
        None => tarmac_reader::host_arch()
            .ok_or_else(|| anyhow!("host architecture is not supported; pass --target"))?,
    };

    if let Some(entry) = &args.run {
        return run_in_process(&mut module, entry);
    }

    let object = tarmac_reader::compile_to_object(&mut module, arch)
        .context("compilation failed")?;
    let out_path = args
        .output
        .unwrap_or_else(|| args.input.with_extension("o"));
    std::fs::write(&out_path, object)
        .with_context(|| format!("writing {}", out_path.display()))?;
    log::info!("wrote {}", out_path.display());
    Ok(())
}

fn print_analysis(module: &mut Module, args: &Args) {
    let funcs: Vec<_> = module.funcs().collect();
    for func in funcs {
        if module.func_extern(func) {
            continue;
        }
        println!("function {}:", module.func_link_name(func));
        module.switch_func(func);
        let mut analyzer = Analyzer::new();
        analyzer.switch_func(module);

        if args.print_rpo || args.print_layout {
            // after analysis the stored layout *is* the RPO refined by
            // loop placement
            println!("  layout:");
            for (i, block) in analyzer.block_layout.iter().enumerate() {
                println!("    {i}: ^{}", module.blocks[block.0 as usize].name);
            }
        }
        if args.print_loops {
            println!("  loops:");
            for (i, l) in analyzer.loops.iter().enumerate() {
                println!(
                    "    {i}: level {}, parent {}, {}->{}",
                    l.level, l.parent, l.begin, l.end
                );
            }
        }
        if args.print_liveness {
            println!("  liveness:");
            for (i, info) in analyzer.liveness.iter().enumerate() {
                if info.ref_count == 0 {
                    continue;
                }
                println!(
                    "    {i}: {} refs, {}->{}, lf: {}",
                    info.ref_count, info.first, info.last, info.last_full
                );
            }
        }
    }
}

fn run_in_process(module: &mut Module, entry: &str) -> Result<()> {
    let compiled = match tarmac_reader::host_arch() {
        Some(Arch::X64) => compile_x64(module),
        Some(Arch::A64) => compile_a64(module),
        None => bail!("in-process execution requires an x86-64 or AArch64 host"),
    }
    .context("compilation failed")?;

    let entry_sym = compiled
        .sym_by_name(entry)
        .ok_or_else(|| anyhow!("no function named '{entry}'"))?;

    let mut mapper = ElfMapper::new();
    mapper
        .map(&compiled.assembler, &mut |name| {
            let cname = std::ffi::CString::new(name).ok()?;
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
            if addr.is_null() {
                None
            } else {
                Some(addr.cast_const())
            }
        })
        .context("mapping failed")?;

    let addr = mapper
        .get_sym_addr(entry_sym)
        .ok_or_else(|| anyhow!("entry '{entry}' has no address"))?;
    let func: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
    let ret = func();
    std::process::exit(ret as i32);
}
