//! Preflight command - verify external inputs before building.
//!
//! Every check maps to a fatal build error: a failing preflight predicts
//! exactly where a build would abort.

use anyhow::{bail, Result};
use std::path::Path;

use crate::config::Params;
use crate::context::BuildContext;
use crate::manifest::{Manifest, DEFAULT_GROUP, DEV_GROUP};
use crate::pkg::Archive;

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

/// Execute the preflight command. With `strict`, any failed check is an
/// error exit.
pub fn cmd_preflight(base_dir: &Path, params: &Params, strict: bool) -> Result<()> {
    let ctx = BuildContext::new(base_dir, params.clone());
    let mut checks = Vec::new();

    let base = ctx.base_image_dir();
    checks.push(Check {
        name: "base image",
        ok: base.exists(),
        detail: base.display().to_string(),
    });

    checks.push(match Archive::open(&ctx.archive_dir()) {
        Ok(archive) => Check {
            name: "package archive",
            ok: true,
            detail: format!(
                "{} ({} packages)",
                ctx.archive_dir().display(),
                archive.index.packages.len()
            ),
        },
        Err(e) => Check {
            name: "package archive",
            ok: false,
            detail: format!("{:#}", e),
        },
    });

    checks.push(match Manifest::load(&ctx.manifest_path()) {
        Ok((manifest, _)) => {
            let groups = manifest.groups();
            let separable = groups.contains(DEFAULT_GROUP) || manifest.dependencies.is_empty();
            Check {
                name: "dependency manifest",
                ok: separable,
                detail: format!(
                    "{} dependencies, groups: {}",
                    manifest.dependencies.len(),
                    if groups.is_empty() {
                        "(none)".to_string()
                    } else {
                        groups.into_iter().collect::<Vec<_>>().join(", ")
                    }
                ),
            }
        }
        Err(e) => Check {
            name: "dependency manifest",
            ok: false,
            detail: format!("{:#}", e),
        },
    });

    checks.push(Check {
        name: "dependency registry",
        ok: params.registry_dir.exists(),
        detail: params.registry_dir.display().to_string(),
    });

    // The collaborator's install command runs through sh.
    checks.push(match which::which("sh") {
        Ok(path) => Check {
            name: "host shell",
            ok: true,
            detail: path.display().to_string(),
        },
        Err(_) => Check {
            name: "host shell",
            ok: false,
            detail: "sh not found in PATH".to_string(),
        },
    });

    println!("Preflight checks:");
    let mut failed = 0;
    for check in &checks {
        let status = if check.ok { "PASS" } else { "FAIL" };
        println!("  [{}] {:<20} {}", status, check.name, check.detail);
        if !check.ok {
            failed += 1;
        }
    }
    println!();
    if failed == 0 {
        println!("All {} checks passed.", checks.len());
    } else {
        println!("{}/{} checks failed.", failed, checks.len());
        if strict {
            bail!("preflight failed ({} check(s))", failed);
        }
    }

    // The development group is worth calling out: without it the
    // development stage has no delta to resolve.
    if let Ok((manifest, _)) = Manifest::load(&ctx.manifest_path()) {
        if !manifest.dependencies.is_empty() && !manifest.groups().contains(DEV_GROUP) {
            println!(
                "  [WARN] manifest declares no '{}' group; development resolves nothing extra",
                DEV_GROUP
            );
        }
    }

    Ok(())
}
