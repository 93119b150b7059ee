use armstrong_core::core::{Config, Core, State};
use armstrong_core::instruction::Instruction;
use armstrong_core::memory::CODE_BASE;
use armstrong_core::symbols::SymbolTable;
use armstrong_core::trace::TraceSink;
use clap::Parser;
use log::warn;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Symbol file with one `name address` pair per line.
    #[arg(long, short)]
    symbols: Option<PathBuf>,
    /// Load address of the image.
    #[arg(long, value_parser = parse_address, default_value_t = CODE_BASE)]
    base: u32,
    /// Maximum number of cycles to execute.
    #[arg(long, default_value_t = 1_000_000)]
    cycle_limit: u64,
    /// Root directory guest file I/O is confined to.
    #[arg(long)]
    fs_root: Option<PathBuf>,
    /// Seed for the guest-visible PRNG.
    #[arg(long)]
    seed: Option<u64>,
    /// Environment entries surfaced to the guest, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    environment: Vec<String>,
    /// Print each executed instruction to stderr.
    #[arg(long, short)]
    trace: bool,
    /// Flat binary image to execute.
    image: PathBuf,
    /// Arguments surfaced to the guest through GET_ARGUMENTS.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

/// Prints every executed instruction to stderr, disassembled, with the nearest symbol.
struct Disassembler {
    symbols: SymbolTable,
}

impl TraceSink for Disassembler {
    fn record_instruction(&mut self, sequence: u64, pc: u32, word: u32) {
        match Instruction::decode(word) {
            Ok(instruction) => {
                eprintln!("{sequence:>8}  {:<28} {instruction}", self.symbols.format(pc))
            }
            Err(_) => eprintln!("{sequence:>8}  {:<28} .word {word:#010x}", self.symbols.format(pc)),
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut image = Vec::new();
    if let Err(error) = File::open(&args.image).and_then(|mut f| f.read_to_end(&mut image)) {
        eprintln!("error: cannot read {}: {error}", args.image.display());
        return ExitCode::FAILURE;
    }

    let symbols = match &args.symbols {
        Some(path) => match load_symbols(path) {
            Ok(symbols) => symbols,
            Err(error) => {
                eprintln!("error: cannot read {}: {error}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => SymbolTable::new(),
    };

    let mut arguments = vec![args.image.display().to_string()];
    arguments.extend(args.guest_args.iter().cloned());

    let mut core = Core::new(Config {
        cycle_limit: args.cycle_limit,
        fs_root: args.fs_root.clone(),
        prng_seed: args.seed,
        arguments,
        environment: args.environment.clone(),
        ..Config::default()
    });
    if args.trace {
        core.set_trace_sink(Box::new(Disassembler {
            symbols: symbols.clone(),
        }));
    }
    if let Err(error) = core.load_program(args.base, &image, symbols) {
        eprintln!("error: failed to load program: {error}");
        return ExitCode::FAILURE;
    }

    match core.run() {
        State::Halted => {
            let code = core.exit_code().unwrap_or(0);
            ExitCode::from(code as u8)
        }
        State::Breakpoint => {
            // No debugger is attached here; report where the guest stopped.
            let pc = core.registers().pc().wrapping_sub(4);
            eprintln!("breakpoint at {}", core.symbols().format(pc));
            ExitCode::FAILURE
        }
        state => {
            match core.last_error() {
                Some(error) => eprintln!(
                    "error: {error} (pc {}, {} cycles)",
                    core.symbols().format(core.registers().pc()),
                    core.cycles()
                ),
                None => eprintln!("error: stopped in state {state:?}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|error| error.to_string())
}

/// Parses a symbol file: one `name address` pair per line, `#` comments and blank lines
/// ignored. Malformed lines are skipped with a warning.
fn load_symbols(path: &Path) -> std::io::Result<SymbolTable> {
    let text = std::fs::read_to_string(path)?;
    let mut table = SymbolTable::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let entry = match (parts.next(), parts.next()) {
            (Some(name), Some(address)) => parse_address(address).ok().map(|a| (name, a)),
            _ => None,
        };
        match entry {
            Some((name, address)) => table.insert(name, address),
            None => warn!("{}:{}: skipping malformed symbol line", path.display(), number + 1),
        }
    }
    Ok(table)
}
