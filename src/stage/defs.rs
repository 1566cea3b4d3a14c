//! The four stage definitions.
//!
//! Build parameters substitute values (base image name, account identity)
//! into these definitions; they never change the graph's shape.

use std::collections::BTreeMap;

use super::{as_build, root, Op, Parent, StageDef, StageId};
use crate::config::Params;
use crate::context::{DEP_CACHE, SCRIPTS_DIR, WORKDIR};
use crate::manifest::DEV_GROUP;
use crate::resolve::Policy;
use crate::users;

/// Shared libraries needed to execute the built library. Nothing else:
/// no compilers, no build tooling.
pub const RUNTIME_PACKAGES: &[&str] = &["libextdb1", "ca-certificates"];

/// Build toolchain, version control and privilege escalation for the
/// shared development base.
pub const TOOLCHAIN_PACKAGES: &[&str] = &["build-essential", "git", "sudo", "pkg-config"];

/// Interactive tooling for the development image: editor, shell
/// completion, process inspection, signing.
pub const INTERACTIVE_PACKAGES: &[&str] = &["vim", "bash-completion", "htop", "gnupg"];

fn packages(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The full stage graph, in build order.
pub fn stage_graph(params: &Params) -> Vec<StageDef> {
    vec![
        runtime(params),
        dev_base(params),
        testing(),
        development(params),
    ]
}

/// Look up one stage definition.
pub fn stage_def(params: &Params, id: StageId) -> StageDef {
    match id {
        StageId::Runtime => runtime(params),
        StageId::DevBase => dev_base(params),
        StageId::Testing => testing(),
        StageId::Development => development(params),
    }
}

fn runtime(params: &Params) -> StageDef {
    let mut build_args = BTreeMap::new();
    build_args.insert("RUNTIME_VERSION".into(), params.runtime_version.clone());
    build_args.insert("OS_VARIANT".into(), params.os_variant.clone());

    StageDef {
        id: StageId::Runtime,
        parent: Parent::Image(params.base_image()),
        build_args,
        steps: vec![
            root(Op::InstallPackages {
                names: packages(RUNTIME_PACKAGES),
                minimal: true,
            }),
            // Terminal artifact: keep it small, drop the index cache.
            root(Op::PurgePackageIndex),
            root(Op::Env {
                key: "LANG".into(),
                value: "C.UTF-8".into(),
            }),
        ],
    }
}

fn dev_base(params: &Params) -> StageDef {
    let mut build_args = BTreeMap::new();
    build_args.insert("BUILD_UID".into(), params.build_uid.to_string());
    build_args.insert("BUILD_USER".into(), params.build_user.clone());

    StageDef {
        id: StageId::DevBase,
        parent: Parent::Stage(StageId::Runtime),
        build_args,
        steps: vec![
            root(Op::InstallPackages {
                names: packages(TOOLCHAIN_PACKAGES),
                minimal: false,
            }),
            // Index cache stays: descendants install incrementally.
            root(Op::WriteResolverPolicy(Policy {
                retries: 3,
                workers: 8,
            })),
            root(Op::CreateBuildUser),
            root(Op::Dir(WORKDIR.into())),
            root(Op::Dir(DEP_CACHE.into())),
            root(Op::Dir(SCRIPTS_DIR.into())),
            root(Op::PathAppend(SCRIPTS_DIR.into())),
        ],
    }
}

fn testing() -> StageDef {
    StageDef {
        id: StageId::Testing,
        parent: Parent::Stage(StageId::DevBase),
        build_args: BTreeMap::new(),
        steps: vec![
            // Manifest first, source later: dependency resolution stays
            // cached across unrelated source edits.
            root(Op::CopyManifest),
            as_build(Op::ResolveDeps {
                exclude_groups: vec![DEV_GROUP.to_string()],
                incremental: false,
            }),
            root(Op::CopySourceTree),
            as_build(Op::RunInstallCommand),
        ],
    }
}

fn development(params: &Params) -> StageDef {
    let home = users::home_dir(&params.build_user);
    let history_dir = format!("{}/.history", home);
    let histfile = format!("/{}/shell_history", history_dir);

    StageDef {
        id: StageId::Development,
        parent: Parent::Stage(StageId::DevBase),
        build_args: BTreeMap::new(),
        steps: vec![
            root(Op::InstallPackages {
                names: packages(INTERACTIVE_PACKAGES),
                minimal: false,
            }),
            // Persistent command history lives on its own mount point.
            root(Op::Dir(history_dir)),
            root(Op::Env {
                key: "HISTFILE".into(),
                value: histfile,
            }),
            root(Op::Dir(format!("{}/.vim/pack/plugins/start", home))),
            root(Op::Dir(format!("{}/.vim/pack/plugins/opt", home))),
            root(Op::WriteFile {
                path: format!("{}/.vimrc", home),
                content: "set packpath+=~/.vim\nsyntax on\n".to_string(),
                mode: 0o644,
            }),
            root(Op::PromoteFrom(StageId::Testing)),
            as_build(Op::ResolveDeps {
                exclude_groups: vec![],
                incremental: true,
            }),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use std::path::PathBuf;

    fn params() -> Params {
        Params {
            runtime_version: "3.12".into(),
            os_variant: "bookworm".into(),
            build_uid: 1000,
            build_user: "dev".into(),
            project_dir: PathBuf::from("/p"),
            registry_dir: PathBuf::from("/r"),
        }
    }

    #[test]
    fn test_graph_shape_fixed_by_parameters() {
        let defs = stage_graph(&params());
        assert_eq!(defs.len(), 4);

        let mut other = params();
        other.os_variant = "trixie".into();
        other.build_user = "builder".into();
        let defs2 = stage_graph(&other);

        // Same shape, different substitution values.
        for (a, b) in defs.iter().zip(defs2.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.steps.len(), b.steps.len());
        }
        assert!(matches!(&defs2[0].parent, Parent::Image(name) if name == "trixie-3.12"));
    }

    #[test]
    fn test_runtime_is_minimal_and_terminal() {
        let def = stage_def(&params(), StageId::Runtime);
        assert!(matches!(def.parent, Parent::Image(_)));
        assert!(!def.touches_project());
        assert!(def.promote_sources().is_empty());

        // No compilers, no build account in the runtime stage.
        for step in &def.steps {
            assert!(!matches!(step.op, Op::CreateBuildUser));
            if let Op::InstallPackages { names, minimal } = &step.op {
                assert!(minimal);
                assert!(!names.iter().any(|n| n == "build-essential"));
            }
        }
    }

    #[test]
    fn test_testing_excludes_development_group() {
        let def = stage_def(&params(), StageId::Testing);
        let resolve = def
            .steps
            .iter()
            .find_map(|s| match &s.op {
                Op::ResolveDeps {
                    exclude_groups,
                    incremental,
                } => Some((exclude_groups.clone(), *incremental)),
                _ => None,
            })
            .expect("testing must resolve dependencies");
        assert_eq!(resolve.0, vec![DEV_GROUP.to_string()]);
        assert!(!resolve.1);
    }

    #[test]
    fn test_development_promotes_then_resolves_delta() {
        let def = stage_def(&params(), StageId::Development);
        let promote_pos = def
            .steps
            .iter()
            .position(|s| matches!(s.op, Op::PromoteFrom(StageId::Testing)))
            .expect("development must promote from testing");
        let resolve_pos = def
            .steps
            .iter()
            .position(|s| matches!(&s.op, Op::ResolveDeps { incremental: true, exclude_groups } if exclude_groups.is_empty()))
            .expect("development must clear exclusions and resolve incrementally");
        // Warm cache first, delta resolution after.
        assert!(promote_pos < resolve_pos);
    }

    #[test]
    fn test_manifest_copied_before_source_tree() {
        let def = stage_def(&params(), StageId::Testing);
        let manifest_pos = def
            .steps
            .iter()
            .position(|s| matches!(s.op, Op::CopyManifest))
            .unwrap();
        let resolve_pos = def
            .steps
            .iter()
            .position(|s| matches!(s.op, Op::ResolveDeps { .. }))
            .unwrap();
        let source_pos = def
            .steps
            .iter()
            .position(|s| matches!(s.op, Op::CopySourceTree))
            .unwrap();
        assert!(manifest_pos < resolve_pos);
        assert!(resolve_pos < source_pos);
    }
}
