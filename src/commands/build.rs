//! Build command - builds environment stages.

use anyhow::Result;
use std::path::Path;
use std::time::Instant;

use crate::config::Params;
use crate::context::BuildContext;
use crate::stage::{graph, StageId};

/// Execute the build command. `target` is the stage to end at; None
/// builds the whole graph.
pub fn cmd_build(base_dir: &Path, target: Option<StageId>, params: &Params) -> Result<()> {
    match target {
        Some(stage) => println!("=== strata build: {} ===\n", stage),
        None => println!("=== strata build: all stages ===\n"),
    }
    let build_start = Instant::now();

    let ctx = BuildContext::new(base_dir, params.clone());
    graph::build(&ctx, target)?;

    let secs = build_start.elapsed().as_secs_f64();
    if secs >= 60.0 {
        println!("Build finished in {:.1}m.", secs / 60.0);
    } else {
        println!("Build finished in {:.1}s.", secs);
    }
    Ok(())
}
