//! Step registry and execution engine.
//!
//! Build work is organized as named steps with declared prerequisites. The
//! table is static; [`StepRunner::new`] verifies it is acyclic up front, so
//! ordinary prerequisite resolution can never recurse forever. Handlers may
//! additionally request steps dynamically (acquiring an image may require
//! building one, rebuilding packages may require producing a source package
//! first); those requests are guarded by an in-progress marker and fail
//! with a cycle error instead of exhausting the stack.
//!
//! Within one run each step executes at most once.

mod env;
mod pkg;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::context::BuildContext;
use crate::error::{BuildError, Result};

/// Identifiers for every build step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    PkgCache,
    BuildImage,
    Image,
    Configure,
    Build,
    Tarball,
    SourcePackage,
    Package,
    Custom,
    Interactive,
}

impl StepId {
    pub const ALL: &'static [StepId] = &[
        StepId::PkgCache,
        StepId::BuildImage,
        StepId::Image,
        StepId::Configure,
        StepId::Build,
        StepId::Tarball,
        StepId::SourcePackage,
        StepId::Package,
        StepId::Custom,
        StepId::Interactive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::PkgCache => "pkg-cache",
            StepId::BuildImage => "build-image",
            StepId::Image => "image",
            StepId::Configure => "configure",
            StepId::Build => "build",
            StepId::Tarball => "tarball",
            StepId::SourcePackage => "source-package",
            StepId::Package => "package",
            StepId::Custom => "custom",
            StepId::Interactive => "interactive",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        StepId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| {
                BuildError::Config(format!(
                    "unknown step '{}'; available: {}",
                    s,
                    StepId::ALL
                        .iter()
                        .map(|id| id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// A step's handler body.
pub type Handler = fn(&mut StepRunner<'_>, &BuildContext) -> Result<()>;

/// One entry of the step table.
pub struct StepDef {
    pub id: StepId,
    /// Unconditional prerequisites, run to completion before the handler.
    pub prereqs: &'static [StepId],
    pub handler: Handler,
    pub describe: &'static str,
}

/// The step table. Conditional dependencies (image -> build-image,
/// package -> source-package) are requested dynamically by the handlers.
pub const STEPS: &[StepDef] = &[
    StepDef {
        id: StepId::PkgCache,
        prereqs: &[],
        handler: env::pkg_cache,
        describe: "Prime a package-manager cache directory reused across image builds",
    },
    StepDef {
        id: StepId::BuildImage,
        prereqs: &[StepId::PkgCache],
        handler: env::build_image,
        describe: "Generate and build the build-environment container image",
    },
    StepDef {
        id: StepId::Image,
        prereqs: &[],
        handler: env::image,
        describe: "Acquire a build-environment image: cached, pulled or freshly built",
    },
    StepDef {
        id: StepId::Configure,
        prereqs: &[StepId::Image],
        handler: pkg::configure,
        describe: "Configure the source tree inside the build environment",
    },
    StepDef {
        id: StepId::Build,
        prereqs: &[StepId::Configure],
        handler: pkg::build,
        describe: "Compile the source tree inside the build environment",
    },
    StepDef {
        id: StepId::Tarball,
        prereqs: &[StepId::Image],
        handler: pkg::tarball,
        describe: "Generate a source tarball from the git tree",
    },
    StepDef {
        id: StepId::SourcePackage,
        prereqs: &[StepId::Tarball],
        handler: pkg::source_package,
        describe: "Build the source package from the spec file and tarball",
    },
    StepDef {
        id: StepId::Package,
        prereqs: &[StepId::Image],
        handler: pkg::package,
        describe: "Rebuild binary packages from the source package",
    },
    StepDef {
        id: StepId::Custom,
        prereqs: &[StepId::Image],
        handler: pkg::custom,
        describe: "Run a custom command (given after --) in the build environment",
    },
    StepDef {
        id: StepId::Interactive,
        prereqs: &[StepId::Image],
        handler: pkg::interactive,
        describe: "Start an interactive shell in the build environment",
    },
];

/// Step ids with their descriptions, for the list-steps CLI mode.
pub fn step_docs() -> impl Iterator<Item = (&'static str, &'static str)> {
    STEPS.iter().map(|def| (def.id.as_str(), def.describe))
}

/// Executes steps against a table, memoizing completion per run.
pub struct StepRunner<'t> {
    table: &'t [StepDef],
    done: HashSet<StepId>,
    in_progress: Vec<StepId>,
    prepared: bool,
}

impl<'t> StepRunner<'t> {
    /// Build a runner over a step table, verifying the declared
    /// prerequisites are resolvable and acyclic.
    pub fn new(table: &'t [StepDef]) -> Result<Self> {
        verify_table(table)?;
        Ok(Self {
            table,
            done: HashSet::new(),
            in_progress: Vec::new(),
            prepared: false,
        })
    }

    /// Runner over the standard step table.
    pub fn standard() -> Result<StepRunner<'static>> {
        StepRunner::new(STEPS)
    }

    /// Request that a step (and its prerequisites) be executed.
    ///
    /// No-ops when prerequisite execution is suppressed and the step is not
    /// the top-level target, and when the step already ran in this run.
    pub fn request(&mut self, id: StepId, ctx: &BuildContext, top: bool) -> Result<()> {
        info!("want to execute build step: {id}");
        if ctx.no_prereqs && !top {
            info!("prerequisite execution disabled; skipping {id}");
            return Ok(());
        }
        if self.done.contains(&id) {
            debug!("step already done: {id}");
            return Ok(());
        }
        if self.in_progress.contains(&id) {
            return Err(BuildError::Cycle(id.to_string()));
        }
        if !self.prepared {
            prepare_env_once(ctx)?;
            self.prepared = true;
        }
        self.in_progress.push(id);
        let result = self.execute(id, ctx);
        self.in_progress.pop();
        result?;
        self.done.insert(id);
        info!("step done: {id}");
        Ok(())
    }

    fn execute(&mut self, id: StepId, ctx: &BuildContext) -> Result<()> {
        let def = lookup(self.table, id)?;
        let (prereqs, handler) = (def.prereqs, def.handler);
        for prereq in prereqs {
            self.request(*prereq, ctx, false)?;
        }
        handler(self, ctx)
    }
}

fn lookup<'t>(table: &'t [StepDef], id: StepId) -> Result<&'t StepDef> {
    table
        .iter()
        .find(|def| def.id == id)
        .ok_or_else(|| BuildError::Config(format!("step '{id}' is not in the step table")))
}

/// One-time per-run environment preparation, before the first step runs.
fn prepare_env_once(ctx: &BuildContext) -> Result<()> {
    if let Some(overlay) = &ctx.overlay {
        overlay.materialize()?;
    }
    Ok(())
}

/// Structural table check: unique ids, resolvable prerequisites, no cycles.
fn verify_table(table: &[StepDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for def in table {
        if !seen.insert(def.id) {
            return Err(BuildError::Config(format!(
                "step '{}' is declared twice",
                def.id
            )));
        }
    }
    let mut finished: HashSet<StepId> = HashSet::new();
    for def in table {
        let mut path = Vec::new();
        visit(table, def.id, &mut path, &mut finished)?;
    }
    Ok(())
}

fn visit(
    table: &[StepDef],
    id: StepId,
    path: &mut Vec<StepId>,
    finished: &mut HashSet<StepId>,
) -> Result<()> {
    if finished.contains(&id) {
        return Ok(());
    }
    if path.contains(&id) {
        return Err(BuildError::Cycle(id.to_string()));
    }
    path.push(id);
    for prereq in lookup(table, id)?.prereqs {
        visit(table, *prereq, path, finished)?;
    }
    path.pop();
    finished.insert(id);
    Ok(())
}
