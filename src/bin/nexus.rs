//! Nexus - compiles, runs and disassembles NexusLang programs
//!
//! `run` and `disasm` accept either source files or `.nxb` artifacts; the
//! kind is detected from the magic number.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nexuslang::{format, CompiledProgram, ConsoleBridge, ExitStatus, NexusError, Vm, VmConfig};
use serde_json::json;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nexus")]
#[command(about = "Compile and run NexusLang programs")]
struct Cli {
    /// Report results and diagnostics as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a source file into a .nxb artifact
    Compile {
        source: PathBuf,
        /// Output path, defaults to the source path with a .nxb extension
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a source file or a .nxb artifact
    Run { file: PathBuf },
    /// Print the instructions of a source file or a .nxb artifact
    Disasm { file: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus=info,nexuslang=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match execute(&cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<NexusError>() {
                Some(nexus_err) if cli.json => {
                    println!("{}", json!({ "error": nexus_err.diagnostic() }));
                }
                _ => error!("{:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Compile { source, output } => {
            let output = output
                .clone()
                .unwrap_or_else(|| source.with_extension("nxb"));
            compile(source, &output, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { file } => run(file, cli.json),
        Command::Disasm { file } => {
            let program = load(file)?;
            if cli.json {
                let listing: Vec<String> = program
                    .instructions
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                let listing = json!({
                    "instructions": listing,
                    "entry_point": program.entry_point,
                });
                println!("{}", listing);
            } else {
                print!("{}", program.disassemble());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn compile(source: &Path, output: &Path, json: bool) -> Result<()> {
    let text = fs::read_to_string(source)
        .with_context(|| format!("failed to read {}", source.display()))?;
    let artifact = nexuslang::build(&text)?;
    fs::write(output, &artifact)
        .with_context(|| format!("failed to write {}", output.display()))?;

    info!(
        "Compiled {} into {} ({} bytes)",
        source.display(),
        output.display(),
        artifact.len()
    );
    if json {
        println!("{}", json!({ "output": output.display().to_string(), "bytes": artifact.len() }));
    }
    Ok(())
}

fn run(file: &Path, json: bool) -> Result<ExitCode> {
    let program = load(file)?;
    let config = VmConfig {
        echo_output: !json,
        ..VmConfig::from_env().context("invalid VM configuration")?
    };
    debug!(?config, "starting VM");

    let mut bridge = ConsoleBridge::stdio();
    let mut vm = Vm::with_config(program, &mut bridge, config);
    let status = vm.execute();

    match &status {
        ExitStatus::Success => info!("Program finished"),
        ExitStatus::Fault(fault) => error!("Program faulted: {}", fault),
    }
    if json {
        let fault = match &status {
            ExitStatus::Success => None,
            ExitStatus::Fault(fault) => Some(fault.to_string()),
        };
        println!(
            "{}",
            json!({
                "status": if status.is_success() { "success" } else { "fault" },
                "fault": fault,
                "output": vm.output(),
            })
        );
    }

    Ok(if status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Read an artifact, or compile the file when it is not one
fn load(file: &Path) -> Result<CompiledProgram> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    if format::is_artifact(&bytes) {
        debug!("Loading artifact {}", file.display());
        let program = format::deserialize(&bytes).map_err(NexusError::from)?;
        return Ok(program);
    }

    let source = String::from_utf8(bytes)
        .with_context(|| format!("{} is neither an artifact nor UTF-8 source", file.display()))?;
    Ok(nexuslang::compile_source(&source)?)
}
