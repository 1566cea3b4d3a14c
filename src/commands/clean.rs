//! Clean command - removes build products.

use anyhow::Result;
use std::path::Path;

use crate::clean;
use crate::config::Params;
use crate::context::BuildContext;

/// Clean target for the clean command.
pub enum CleanTarget {
    /// Stage snapshots, staging trees and recorded digests
    Outputs,
    /// Host-side cache of remote dependency fetches
    Cache,
    /// Everything strata produced
    All,
}

/// Execute the clean command.
pub fn cmd_clean(base_dir: &Path, target: CleanTarget, params: &Params) -> Result<()> {
    let ctx = BuildContext::new(base_dir, params.clone());
    match target {
        CleanTarget::Outputs => clean::clean_outputs(&ctx),
        CleanTarget::Cache => clean::clean_fetch_cache(&ctx),
        CleanTarget::All => clean::clean_all(&ctx),
    }
}
