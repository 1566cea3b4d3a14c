//! Cross-stage artifact promotion.
//!
//! Development reuses testing's resolved dependency set and populated
//! working tree by direct copy instead of recomputing them. The copy only
//! happens from a completed snapshot, and only when the manifest the
//! source set was resolved from is still the manifest the current build is
//! about to use. Promotion-time staleness is checked by digest, not
//! assumed away.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::context::{BuildContext, DEP_CACHE, WORKDIR};
use crate::files::copy_tree;
use crate::manifest::Manifest;
use crate::resolve::InstalledSet;
use crate::snapshot;
use crate::stage::StageId;

/// Copy the dependency cache and working tree from a completed source
/// snapshot into a staging tree.
pub fn promote(ctx: &BuildContext, staging_root: &Path, source: StageId) -> Result<()> {
    let src_root = ctx.snapshot_dir(source);
    if !snapshot::is_complete(&src_root) {
        bail!(
            "promotion source '{}' has no completed snapshot at {} (build it first)",
            source.name(),
            src_root.display()
        );
    }

    let src_cache = src_root.join(DEP_CACHE);
    let set = InstalledSet::load(&src_cache).with_context(|| {
        format!(
            "promotion source '{}' carries no resolved dependency set",
            source.name()
        )
    })?;

    let (_, current_digest) = Manifest::load(&ctx.manifest_path())?;
    if set.manifest_digest != current_digest {
        bail!(
            "manifest drift: '{}' was resolved from manifest {} but {} now digests to {} (rebuild '{}' first)",
            source.name(),
            &set.manifest_digest[..12.min(set.manifest_digest.len())],
            ctx.manifest_path().display(),
            &current_digest[..12.min(current_digest.len())],
            source.name()
        );
    }

    let copied_deps = copy_tree(&src_cache, &staging_root.join(DEP_CACHE))
        .context("promoting dependency cache")?;
    let copied_tree = copy_tree(&src_root.join(WORKDIR), &staging_root.join(WORKDIR))
        .context("promoting working tree")?;
    println!(
        "  promoted {} dependency file(s) and {} source file(s) from '{}'",
        copied_deps,
        copied_tree,
        source.name()
    );

    // The copy must be byte-identical to its source; anything else means a
    // stage diverged after resolution.
    crate::resolve::verify(&staging_root.join(DEP_CACHE), &set)
        .context("verifying promoted dependency set")?;
    Ok(())
}
