//! Show command - configuration, stage graph and build status.

use anyhow::Result;
use std::path::Path;

use crate::config::Params;
use crate::context::BuildContext;
use crate::pkg;
use crate::resolve::InstalledSet;
use crate::snapshot;
use crate::stage::{defs, Parent, StageId};

/// Show target for the show command.
pub enum ShowTarget {
    /// Current configuration
    Config,
    /// Stage graph with parent and promotion edges
    Graph,
    /// Per-stage build status
    Status,
}

/// Execute the show command.
pub fn cmd_show(base_dir: &Path, target: ShowTarget, params: &Params) -> Result<()> {
    let ctx = BuildContext::new(base_dir, params.clone());
    match target {
        ShowTarget::Config => {
            params.print();
            println!("  Base image dir: {}", ctx.base_image_dir().display());
            println!("  Archive dir: {}", ctx.archive_dir().display());
            println!("  Output dir: {}", ctx.output_dir().display());
        }
        ShowTarget::Graph => show_graph(&ctx),
        ShowTarget::Status => show_status(&ctx)?,
    }
    Ok(())
}

fn show_graph(ctx: &BuildContext) {
    println!("Stage graph:");
    for def in defs::stage_graph(&ctx.params) {
        let parent = match &def.parent {
            Parent::Image(name) => format!("image '{}'", name),
            Parent::Stage(id) => format!("stage '{}'", id),
        };
        print!("  {} <- {}", def.id, parent);
        let sources = def.promote_sources();
        if !sources.is_empty() {
            let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
            print!("  (promotes from {})", names.join(", "));
        }
        println!();
    }
}

fn show_status(ctx: &BuildContext) -> Result<()> {
    println!("Build status:");
    for id in StageId::all() {
        let snap = ctx.snapshot_dir(id);
        if !snapshot::is_complete(&snap) {
            println!("  {:<12} NOT BUILT", id.name());
            continue;
        }

        let packages = pkg::installed(&snap)?.len();
        let deps = InstalledSet::load(&snap.join(crate::context::DEP_CACHE))
            .map(|set| set.entries.len())
            .unwrap_or(0);
        let meta = snapshot::read_meta(&snap)?;
        let account = meta.build_user.as_deref().unwrap_or("-");
        println!(
            "  {:<12} BUILT  packages: {:<3} deps: {:<3} account: {}",
            id.name(),
            packages,
            deps,
            account
        );
    }
    Ok(())
}
