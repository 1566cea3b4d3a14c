//! Strata - layered environment-image builder.
//!
//! Produces four related environment snapshots for the extdb bindings
//! project:
//! - runtime: minimal OS + language runtime, shared libraries only
//! - dev-base: toolchain, build account, resolver policy
//! - testing: manifest-only dependency install, no development group
//! - development: interactive tooling, promoted artifacts, full groups
#![allow(dead_code)]

mod cache;
mod clean;
mod commands;
mod config;
mod context;
mod files;
mod manifest;
mod pkg;
mod process;
mod promote;
mod resolve;
mod snapshot;
mod stage;
mod users;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::Params;
use stage::StageId;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered environment-image builder")]
#[command(
    after_help = "QUICK START:\n  strata preflight    Check all external inputs\n  strata build        Build all four stages\n  strata show status  See what is built\n  strata clean        Remove build outputs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build environment stages (default: all four)
    Build {
        #[command(subcommand)]
        target: Option<BuildTarget>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Clean build products (default: outputs)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },

    /// Run preflight checks (verify external inputs before build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum BuildTarget {
    /// Minimal runtime image (terminal artifact)
    Runtime,
    /// Shared development base
    DevBase,
    /// Lean testing image (no development-group dependencies)
    Testing,
    /// Full interactive development image (requires testing)
    Development,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Show the stage graph
    Graph,
    /// Show build status (what is built, what it contains)
    Status,
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Stage snapshots and staging trees
    Outputs,
    /// Host-side fetch cache
    Cache,
    /// Everything strata produced
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();

    let base_dir = match std::env::var("STRATA_ROOT") {
        Ok(root) => PathBuf::from(root),
        Err(_) => std::env::current_dir()?,
    };
    let params = Params::load(&base_dir);

    match cli.command {
        Commands::Build { target } => {
            let stage = target.map(|t| match t {
                BuildTarget::Runtime => StageId::Runtime,
                BuildTarget::DevBase => StageId::DevBase,
                BuildTarget::Testing => StageId::Testing,
                BuildTarget::Development => StageId::Development,
            });
            commands::cmd_build(&base_dir, stage, &params)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Graph => commands::show::ShowTarget::Graph,
                ShowTarget::Status => commands::show::ShowTarget::Status,
            };
            commands::cmd_show(&base_dir, show_target, &params)?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None => commands::clean::CleanTarget::Outputs,
                Some(CleanTarget::Outputs) => commands::clean::CleanTarget::Outputs,
                Some(CleanTarget::Cache) => commands::clean::CleanTarget::Cache,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&base_dir, clean_target, &params)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&base_dir, &params, strict)?;
        }
    }

    Ok(())
}
