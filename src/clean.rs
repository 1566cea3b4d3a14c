//! Build output cleaning.

use anyhow::Result;
use std::fs;

use crate::context::BuildContext;

/// Remove all stage snapshots, staging trees and recorded digests.
/// External inputs (base images, archive, registry, project) are untouched.
pub fn clean_outputs(ctx: &BuildContext) -> Result<()> {
    let output = ctx.output_dir();
    if output.exists() {
        println!("Removing {}...", output.display());
        fs::remove_dir_all(&output)?;
    } else {
        println!("No build outputs to clean.");
    }
    Ok(())
}

/// Remove the host-side cache of remote dependency fetches.
pub fn clean_fetch_cache(ctx: &BuildContext) -> Result<()> {
    let cache = ctx.fetch_cache_dir();
    if cache.exists() {
        println!("Removing {}...", cache.display());
        fs::remove_dir_all(&cache)?;
    } else {
        println!("No fetch cache to clean.");
    }
    Ok(())
}

/// Remove everything strata produced.
pub fn clean_all(ctx: &BuildContext) -> Result<()> {
    clean_outputs(ctx)?;
    clean_fetch_cache(ctx)?;
    println!("Clean complete (inputs preserved).");
    Ok(())
}
