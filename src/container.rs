//! Container-engine command construction.
//!
//! Everything here is pure: given a request and a resolved context, produce
//! the argument vector for the engine. Nothing in this module executes
//! commands, so every vector is stable and reproducible for logging and
//! dry-run display.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::context::BuildContext;
use crate::error::{BuildError, Result};

/// Name assigned to the build container so stray ones are easy to spot.
pub const CONTAINER_NAME: &str = "buildbox_build";

/// Container-engine family. Engine-specific flags key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Podman,
    Docker,
}

/// A resolved container engine: the family plus the program to invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    kind: EngineKind,
    program: String,
}

impl Engine {
    /// Resolve the engine once per context: an explicit override wins,
    /// otherwise the first of podman then docker found on PATH.
    pub fn detect(explicit: Option<&str>) -> Result<Engine> {
        if let Some(name) = explicit {
            return Engine::from_program(name);
        }
        for candidate in ["podman", "docker"] {
            if which::which(candidate).is_ok() {
                debug!("found container engine: {candidate}");
                return Engine::from_program(candidate);
            }
        }
        Err(BuildError::Config(
            "no container engine found on PATH (tried podman, docker)".into(),
        ))
    }

    /// Classify a program name or path by its engine family.
    pub fn from_program(program: &str) -> Result<Engine> {
        let kind = if program.contains("podman") {
            EngineKind::Podman
        } else if program.contains("docker") {
            EngineKind::Docker
        } else {
            return Err(BuildError::Config(format!(
                "unrecognized container engine '{program}'; expected podman or docker"
            )));
        };
        Ok(Engine {
            kind,
            program: program.to_string(),
        })
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Podman enforces a pids limit by default; lift it there only.
    pub fn supports_pids_limit(&self) -> bool {
        self.kind == EngineKind::Podman
    }

    /// `build --volume` exists on podman but not docker.
    pub fn supports_build_volumes(&self) -> bool {
        self.kind == EngineKind::Podman
    }

    /// Render a provenance key/value for `build`: annotations on podman,
    /// labels on docker (which has no annotation support).
    pub fn provenance_flag(&self, key: &str, value: &str) -> String {
        match self.kind {
            EngineKind::Podman => format!("--annotation={key}={value}"),
            EngineKind::Docker => format!("--label={key}={value}"),
        }
    }
}

/// How the source tree is exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overlay {
    /// Copy-up overlay whose writes are discarded at container teardown.
    Temporary,
    /// Copy-up overlay persisted in caller-supplied sibling directories.
    ///
    /// The work dir must not be nested inside the upper dir; they only need
    /// to share a filesystem, so both live side by side under one base.
    Persistent { upper: PathBuf, work: PathBuf },
}

impl Overlay {
    /// Resolve the CLI spelling: `-` is a temporary overlay, anything else
    /// is a base directory hosting `content/` and `work/` siblings.
    pub fn resolve(dir: &str) -> Overlay {
        if dir == "-" {
            return Overlay::Temporary;
        }
        let base = PathBuf::from(dir);
        Overlay::Persistent {
            upper: base.join("content"),
            work: base.join("work"),
        }
    }

    /// Create the persistent upper/work directories. The engine does not
    /// manage the work dir for us.
    pub fn materialize(&self) -> Result<()> {
        if let Overlay::Persistent { upper, work } = self {
            debug!("creating overlay dirs: {}, {}", upper.display(), work.display());
            std::fs::create_dir_all(upper).map_err(|e| BuildError::io(upper, e))?;
            std::fs::create_dir_all(work).map_err(|e| BuildError::io(work, e))?;
        }
        Ok(())
    }
}

/// A bind mount handed to the engine.
#[derive(Debug, Clone)]
pub struct Volume {
    pub host: PathBuf,
    pub dest: PathBuf,
    pub flags: String,
}

impl Volume {
    pub fn new(host: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            dest: dest.into(),
            flags: "Z".to_string(),
        }
    }

    pub fn to_arg(&self) -> String {
        format!(
            "--volume={}:{}:{}",
            self.host.display(),
            self.dest.display(),
            self.flags
        )
    }
}

/// A published port: either an explicit host:container pair or one port
/// published to the identical host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Port {
    Pair(u16, u16),
    Same(u16),
}

impl Port {
    fn to_arg(&self) -> String {
        match self {
            Port::Pair(host, ctr) => format!("--publish={host}:{ctr}"),
            Port::Same(p) => format!("--publish={p}:{p}"),
        }
    }
}

impl FromStr for Port {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || BuildError::Config(format!("invalid port request '{s}'; expected PORT or HOST:CONTAINER"));
        match s.split_once(':') {
            Some((host, ctr)) => {
                let host = host.parse::<u16>().map_err(|_| bad())?;
                let ctr = ctr.parse::<u16>().map_err(|_| bad())?;
                Ok(Port::Pair(host, ctr))
            }
            None => Ok(Port::Same(s.parse::<u16>().map_err(|_| bad())?)),
        }
    }
}

/// One "run this in the build environment" request.
#[derive(Debug, Default)]
pub struct RunRequest {
    /// Command argument vector; empty means the image's default command.
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub interactive: bool,
    pub ports: Vec<Port>,
}

impl RunRequest {
    /// A `bash -c <script>` request, the common case for chained commands.
    pub fn shell(script: impl Into<String>) -> Self {
        RunRequest {
            args: vec!["bash".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }
}

/// Build the full `engine run` argument vector for a request.
///
/// Argument order is fixed: container management flags, workdir, the source
/// mount, environment, ports, caller passthrough args, image name, command.
pub fn run_command(ctx: &BuildContext, req: &RunRequest) -> Result<Vec<String>> {
    let engine = ctx.engine()?;
    let mut cmd = vec![
        engine.program().to_string(),
        "run".into(),
        format!("--name={CONTAINER_NAME}"),
    ];
    if req.interactive {
        cmd.push("-it".into());
    }
    if !ctx.keep_container {
        cmd.push("--rm".into());
    }
    if engine.supports_pids_limit() {
        cmd.push("--pids-limit=-1".into());
    }
    if ctx.map_user() {
        cmd.push("--user=0".into());
    }
    if let Some(workdir) = &req.workdir {
        cmd.push(format!("--workdir={workdir}"));
    }

    // The source tree is always mounted at the home dir: a plain bind by
    // default, copy-up overlay when one is configured.
    let src = ctx.source_dir.display();
    let home = &ctx.homedir;
    match &ctx.overlay {
        None => cmd.push(format!("--volume={src}:{home}:Z")),
        Some(Overlay::Temporary) => cmd.push(format!("--volume={src}:{home}:O")),
        Some(Overlay::Persistent { upper, work }) => cmd.push(format!(
            "--volume={src}:{home}:O,upperdir={},workdir={}",
            upper.display(),
            work.display()
        )),
    }

    cmd.push(format!("-eHOMEDIR={home}"));
    if let Some(build_dir) = &ctx.build_dir {
        cmd.push(format!("-eBUILD_DIR={build_dir}"));
    }
    if let Some(template) = &ctx.ccache_dir {
        let ccdir = expand_placeholders(template, ctx);
        cmd.push(format!("-eCCACHE_DIR={ccdir}"));
        cmd.push(format!("-eCCACHE_BASEDIR={home}"));
    }
    for port in &req.ports {
        cmd.push(port.to_arg());
    }
    for extra in &ctx.extra_args {
        cmd.push(extra.clone());
    }
    cmd.push(ctx.image_name());
    cmd.extend(req.args.iter().cloned());
    Ok(cmd)
}

/// Substitute `{homedir}`, `{build_dir}` and `{distro}` placeholders.
fn expand_placeholders(template: &str, ctx: &BuildContext) -> String {
    template
        .replace("{homedir}", &ctx.homedir)
        .replace("{build_dir}", ctx.build_dir.as_deref().unwrap_or(""))
        .replace("{distro}", ctx.distro.as_str())
}

/// Reject a copy destination nested beneath any active volume destination.
///
/// Copying into a mounted path would land the files in the volume instead
/// of the image layer, so the image silently loses them at commit.
pub fn ensure_copy_dest_outside_volumes(dest: &Path, volumes: &[Volume]) -> Result<()> {
    for vol in volumes {
        if dest.starts_with(&vol.dest) {
            return Err(BuildError::Config(format!(
                "copy destination {} is inside volume {}",
                dest.display(),
                vol.dest.display()
            )));
        }
    }
    Ok(())
}
