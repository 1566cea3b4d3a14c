//! Declarative stage graph for the environment pipeline.
//!
//! Stages are data: an identifier, exactly one parent, declared build
//! arguments, and an ordered list of steps. The executor interprets the
//! steps; nothing here touches the filesystem. A later step may only add
//! to the tree, never retroactively rewrite an earlier step's effect, so a
//! stage's final state is a deterministic function of (parent state,
//! ordered steps).

pub mod defs;
pub mod executor;
pub mod graph;

use std::collections::BTreeMap;
use std::fmt;

use crate::cache;
use crate::resolve::Policy;

/// The four stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    /// Minimal runtime image: shared libraries only, no build tooling.
    Runtime,
    /// Shared development base: toolchain, build account, policy.
    DevBase,
    /// Lean image able to run the test suite.
    Testing,
    /// Full interactive development image.
    Development,
}

impl StageId {
    /// Directory/display name of the stage.
    pub fn name(&self) -> &'static str {
        match self {
            StageId::Runtime => "runtime",
            StageId::DevBase => "dev-base",
            StageId::Testing => "testing",
            StageId::Development => "development",
        }
    }

    /// All stages in build order.
    pub fn all() -> [StageId; 4] {
        [
            StageId::Runtime,
            StageId::DevBase,
            StageId::Testing,
            StageId::Development,
        ]
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage derives from.
#[derive(Debug, Clone)]
pub enum Parent {
    /// An external base-image tree, by name.
    Image(String),
    /// Another stage's completed snapshot.
    Stage(StageId),
}

/// Identity a step executes under. Privilege is an explicit parameter of
/// each step, never ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Root,
    Build,
}

/// One declarative step: an operation plus its execution identity.
#[derive(Debug, Clone)]
pub struct Step {
    pub op: Op,
    pub who: Identity,
}

/// Operations a stage can declare. Additive only.
#[derive(Debug, Clone)]
pub enum Op {
    /// Install OS packages from the archive. `minimal` skips recommends.
    InstallPackages { names: Vec<String>, minimal: bool },

    /// Drop the snapshot's copy of the package archive index.
    PurgePackageIndex,

    /// Provision the resolver retry/concurrency policy file.
    WriteResolverPolicy(Policy),

    /// Create the unprivileged build account with a sudo grant.
    CreateBuildUser,

    /// Create a directory (create_dir_all).
    Dir(String),

    /// Write a file with specific permissions.
    WriteFile {
        path: String,
        content: String,
        mode: u32,
    },

    /// Set an environment variable for the image.
    Env { key: String, value: String },

    /// Extend the executable search path with a snapshot-relative directory.
    PathAppend(String),

    /// Copy only the dependency manifest into the working directory.
    CopyManifest,

    /// Populate the working directory from the project source tree.
    CopySourceTree,

    /// Materialize the dependency set under a group-exclusion policy.
    ResolveDeps {
        exclude_groups: Vec<String>,
        incremental: bool,
    },

    /// Invoke the collaborator's declared build/install command.
    RunInstallCommand,

    /// Reuse another stage's dependency cache and working tree.
    PromoteFrom(StageId),
}

impl Op {
    /// Short label for progress and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Op::InstallPackages { .. } => "install-packages",
            Op::PurgePackageIndex => "purge-package-index",
            Op::WriteResolverPolicy(_) => "write-resolver-policy",
            Op::CreateBuildUser => "create-build-user",
            Op::Dir(_) => "dir",
            Op::WriteFile { .. } => "write-file",
            Op::Env { .. } => "env",
            Op::PathAppend(_) => "path-append",
            Op::CopyManifest => "copy-manifest",
            Op::CopySourceTree => "copy-source-tree",
            Op::ResolveDeps { .. } => "resolve-deps",
            Op::RunInstallCommand => "run-install-command",
            Op::PromoteFrom(_) => "promote-from",
        }
    }
}

/// A named stage definition.
#[derive(Debug, Clone)]
pub struct StageDef {
    pub id: StageId,
    pub parent: Parent,
    /// Build arguments this stage declares (substitution values).
    pub build_args: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

impl StageDef {
    /// Stages whose artifacts this stage promotes.
    pub fn promote_sources(&self) -> Vec<StageId> {
        self.steps
            .iter()
            .filter_map(|s| match s.op {
                Op::PromoteFrom(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Whether this stage consumes the project tree or its manifest.
    pub fn touches_project(&self) -> bool {
        self.steps.iter().any(|s| {
            matches!(
                s.op,
                Op::CopyManifest
                    | Op::CopySourceTree
                    | Op::ResolveDeps { .. }
                    | Op::RunInstallCommand
                    | Op::PromoteFrom(_)
            )
        })
    }

    /// Content fingerprint of the definition, for rebuild detection. Any
    /// change to the declared steps or arguments changes the fingerprint.
    pub fn fingerprint(&self) -> String {
        cache::hash_bytes(&[format!("{:?}", self).as_bytes()])
    }
}

/// A step executed with root privileges.
pub fn root(op: Op) -> Step {
    Step {
        op,
        who: Identity::Root,
    }
}

/// A step executed as the build account.
pub fn as_build(op: Op) -> Step {
    Step {
        op,
        who: Identity::Build,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_are_stable() {
        // Snapshot directories are named after these; renaming breaks
        // existing output trees.
        let names: Vec<&str> = StageId::all().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["runtime", "dev-base", "testing", "development"]);
    }

    #[test]
    fn test_fingerprint_tracks_definition_changes() {
        let mut def = StageDef {
            id: StageId::Runtime,
            parent: Parent::Image("bookworm-3.12".into()),
            build_args: BTreeMap::new(),
            steps: vec![root(Op::PurgePackageIndex)],
        };
        let before = def.fingerprint();
        def.steps.push(root(Op::Dir("opt".into())));
        assert_ne!(before, def.fingerprint());
    }

    #[test]
    fn test_promote_sources_extracted() {
        let def = StageDef {
            id: StageId::Development,
            parent: Parent::Stage(StageId::DevBase),
            build_args: BTreeMap::new(),
            steps: vec![root(Op::PromoteFrom(StageId::Testing))],
        };
        assert_eq!(def.promote_sources(), vec![StageId::Testing]);
        assert!(def.touches_project());
    }
}
