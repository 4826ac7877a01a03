//! classflow command-line interface
//!
//! Wires the class-path loader and classfile decoder into the
//! whole-program driver and writes the resulting graph document.

use anyhow::{Context, Result};
use clap::Parser;
use classflow_classfile::{ClassFileDecoder, ClassPath};
use classflow_core::{xml, ProgramAnalysis};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "classflow",
    version,
    about = "Extract control-flow and value-provenance graphs from JVM bytecode"
)]
struct Cli {
    /// Extend the class search path. Entries are directories or jar
    /// archives, colon-separated; the flag may be repeated.
    #[arg(short = 'p', long = "classpath", value_name = "ENTRIES")]
    classpath: Vec<String>,

    /// Where to write the graph document.
    #[arg(short, long, value_name = "PATH", default_value = "./out.xml")]
    output: PathBuf,

    /// Entry classes to analyse, dotted or slashed form.
    #[arg(value_name = "CLASS", required = true)]
    classes: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    let mut class_path = ClassPath::new();
    for group in &cli.classpath {
        for entry in group.split(':').filter(|e| !e.is_empty()) {
            class_path
                .add_entry(entry)
                .with_context(|| format!("bad class path entry {entry}"))?;
        }
    }

    let decoder = ClassFileDecoder::new();
    let mut analysis = ProgramAnalysis::new(&class_path, &decoder);
    for class in &cli.classes {
        analysis.add_entry(class);
    }
    analysis.run().context("analysis aborted")?;

    let document = analysis.into_document();
    let file = File::create(&cli.output)
        .with_context(|| format!("failed to write to {}", cli.output.display()))?;
    let mut writer = BufWriter::new(file);
    xml::write_document(&document, &mut writer)
        .with_context(|| format!("failed to write to {}", cli.output.display()))?;
    Ok(())
}
