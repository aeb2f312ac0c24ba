//! ELF-to-LE converter for 32-bit DOS extenders.
//!
//! Converts a 32-bit x86 ELF executable (linked with `--emit-relocs`)
//! into an LE linear executable module loadable by DOS/32 Advanced.
//!
//! Usage:
//!   muon --output <file> <input.elf>   Convert an ELF executable
//!   muon --objdump <input.le>          Dump an LE/LX module as text

mod convert;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

/// Convert 32-bit x86 ELF executables to LE modules.
#[derive(Parser)]
#[command(name = "muon", version, about)]
struct Cli {
    /// Write the converted LE module to this file.
    #[arg(long, value_name = "FILE", conflicts_with = "objdump")]
    output: Option<PathBuf>,

    /// Dump an LE/LX module as text instead of converting.
    #[arg(long)]
    objdump: bool,

    /// Input file: an ELF executable, or an LE module with --objdump.
    input: PathBuf,
}

/// Converts an ELF executable and writes the LE module.
fn cmd_convert(input: &Path, output: &Path) -> Result<()> {
    let data =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let program = convert::convert(&data).with_context(|| input.display().to_string())?;
    let bytes = muon_le::encode(&program).map_err(|e| anyhow::anyhow!("{e}"))?;
    fs::write(output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

/// Dumps an LE module to stdout.
fn cmd_objdump(input: &Path) -> Result<()> {
    let data =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let module = muon_le::decode(&data)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| input.display().to_string())?;
    let mut w = io::BufWriter::new(io::stdout().lock());
    muon_le::dump::dump(&mut w, &module)?;
    w.flush()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if cli.objdump {
        cmd_objdump(&cli.input)
    } else {
        let output = cli
            .output
            .as_deref()
            .context("flag --output is required")?;
        cmd_convert(&cli.input, output)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
