use anyhow::Context as _;
use clap::Parser;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use svcwatchdog::wd::protect::protect_json;

/// Cryptographic protection tool for JSON configuration files.
///
/// Reads a configuration containing a `protectedSections` array, computes
/// HMAC-SHA256 hashes for each listed section, and writes the protected
/// configuration to the target file.
#[derive(Debug, Parser)]
#[command(name = "jsonprotector", version)]
struct Args {
    /// Input JSON file to be protected
    source_file: PathBuf,
    /// Output JSON file with computed hashes
    target_file: PathBuf,
    /// Secret password used for HMAC-SHA256 hash computation
    password: String,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let raw = fs::read_to_string(&args.source_file)
        .with_context(|| format!("cannot read source file '{}'", args.source_file.display()))?;
    let mut config: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse JSON from '{}'", args.source_file.display()))?;
    println!(
        "Successfully loaded JSON configuration from '{}'",
        args.source_file.display()
    );

    protect_json(&mut config, &args.password).context("failed to protect JSON configuration")?;
    println!("Successfully computed protection hashes");

    if let Some(parent) = args.target_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create target directory '{}'", parent.display()))?;
        }
    }

    let pretty = serde_json::to_string_pretty(&config).context("failed to serialize output")?;
    fs::write(&args.target_file, pretty + "\n")
        .with_context(|| format!("cannot write target file '{}'", args.target_file.display()))?;
    println!(
        "Successfully wrote protected JSON configuration to '{}'",
        args.target_file.display()
    );
    Ok(())
}
