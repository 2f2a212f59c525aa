//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;

/// Attributes every library crate root must carry.
const REQUIRED_CRATE_ATTRS: &[&str] = &[
    "#![forbid(unsafe_code)]",
    "#![deny(missing_docs)]",
    "#![deny(rust_2018_idioms)]",
];

#[derive(Parser)]
#[command(name = "xtask", about = "Huddle workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Run the property-based suites with more cases
    Proptest {
        /// Cases per property
        #[arg(long, default_value_t = 2_048)]
        cases: u32,
    },
    /// Generate coverage report
    Coverage,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Proptest { cases } => run_proptest(cases),
        Commands::Coverage => run_coverage(),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"], &[])?;
    run_cmd("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"], &[])?;
    run_cmd("cargo", &["test", "--workspace"], &[])?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"], &[])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    let mut problems = Vec::new();
    for entry in std::fs::read_dir("crates").context("Failed to read crates/")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("huddle-") {
            problems.push(format!("Crate '{name}' does not follow huddle-* naming"));
            continue;
        }
        check_crate_root(&entry.path(), &name, &mut problems)?;
    }

    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        anyhow::bail!("{} convention violation(s)", problems.len());
    }
    println!("All conventions validated!");
    Ok(())
}

fn check_crate_root(dir: &Path, name: &str, problems: &mut Vec<String>) -> Result<()> {
    let lib = dir.join("src/lib.rs");
    if !lib.exists() {
        return Ok(());
    }
    let source = std::fs::read_to_string(&lib)
        .with_context(|| format!("Failed to read {}", lib.display()))?;
    for attr in REQUIRED_CRATE_ATTRS {
        if !source.contains(attr) {
            problems.push(format!("Crate '{name}' is missing {attr}"));
        }
    }

    let manifest = std::fs::read_to_string(dir.join("Cargo.toml"))
        .with_context(|| format!("Failed to read {name}/Cargo.toml"))?;
    if !manifest.contains("version.workspace = true") {
        problems.push(format!("Crate '{name}' does not inherit the workspace version"));
    }
    Ok(())
}

fn run_proptest(cases: u32) -> Result<()> {
    let cases = cases.to_string();
    for package in ["huddle-batch", "huddle-notes"] {
        run_cmd(
            "cargo",
            &["test", "-p", package, "--test", "*properties*"],
            &[("PROPTEST_CASES", &cases)],
        )?;
    }
    Ok(())
}

fn run_coverage() -> Result<()> {
    run_cmd("cargo", &["llvm-cov", "--workspace", "--html"], &[])?;
    println!("\nCoverage report: target/llvm-cov/html/index.html");
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str], envs: &[(&str, &str)]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .envs(envs.iter().copied())
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
