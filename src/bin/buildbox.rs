use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use buildbox::container::{Overlay, Port};
use buildbox::context::{BuildContext, ImageSource};
use buildbox::distro::DistroKind;
use buildbox::error::BuildError;
use buildbox::steps::{self, StepId, StepRunner};

/// Build packages inside podman or docker containers.
#[derive(Parser)]
#[command(name = "buildbox", version, about)]
struct Cli {
    /// Target distribution
    #[arg(long, default_value = "centos9", value_parser = parse_distro)]
    distro: DistroKind,

    /// Build steps to execute, in order
    #[arg(short = 'e', long = "execute", value_parser = parse_step)]
    execute: Vec<StepId>,

    /// Host path of the source tree
    #[arg(long, default_value = ".")]
    source_dir: PathBuf,

    /// Host path of the package spec file (default: packaging/package.spec
    /// under the source dir)
    #[arg(long)]
    spec_file: Option<PathBuf>,

    /// In-container home/build root
    #[arg(long)]
    homedir: Option<String>,

    /// Build directory under the home dir, exported as BUILD_DIR
    #[arg(long)]
    build_dir: Option<String>,

    /// Repository part of the build-environment image name
    #[arg(long)]
    image_repo: Option<String>,

    /// Image tag, or +SUFFIX to append to the derived tag
    #[arg(long)]
    tag: Option<String>,

    /// Branch used for tag derivation instead of asking git
    #[arg(long)]
    current_branch: Option<String>,

    /// Base image overriding the distro default
    #[arg(long)]
    base_image: Option<String>,

    /// Permitted image acquisition strategies (cache, pull, build)
    #[arg(long, value_delimiter = ',', value_parser = parse_source)]
    image_sources: Vec<ImageSource>,

    /// Host directory for package-manager cache reuse across image builds
    #[arg(long)]
    pkg_cache_dir: Option<PathBuf>,

    /// In-container ccache directory; {homedir}, {build_dir} and {distro}
    /// are substituted
    #[arg(long)]
    ccache_dir: Option<String>,

    /// Mount the source tree copy-up: '-' for a throwaway overlay, or a
    /// host directory to persist changes under
    #[arg(long)]
    overlay_dir: Option<String>,

    /// Extra argument passed through to the engine run command
    #[arg(long = "extra")]
    extra: Vec<String>,

    /// Publish a port (PORT or HOST:CONTAINER)
    #[arg(long = "port", value_parser = parse_port)]
    ports: Vec<Port>,

    /// Container engine program, instead of probing for podman then docker
    #[arg(long)]
    container_engine: Option<String>,

    /// Do not remove the build container on exit
    #[arg(long)]
    keep_container: bool,

    /// Run only the requested steps, skipping their prerequisites
    #[arg(long)]
    no_prereqs: bool,

    /// Log the commands that would run without executing them
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// List the available steps and exit
    #[arg(long)]
    list_steps: bool,

    /// Command for the custom step
    #[arg(last = true)]
    rest: Vec<String>,
}

fn parse_distro(s: &str) -> Result<DistroKind, BuildError> {
    s.parse()
}

fn parse_step(s: &str) -> Result<StepId, BuildError> {
    s.parse()
}

fn parse_source(s: &str) -> Result<ImageSource, BuildError> {
    s.parse()
}

fn parse_port(s: &str) -> Result<Port, BuildError> {
    s.parse()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.list_steps {
        for (id, doc) in steps::step_docs() {
            println!("{id:<16} {doc}");
        }
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let source_dir = cli
        .source_dir
        .canonicalize()
        .with_context(|| format!("resolving source dir '{}'", cli.source_dir.display()))?;

    let mut ctx = BuildContext::new(cli.distro, source_dir);
    if let Some(spec_file) = cli.spec_file {
        ctx.spec_file = spec_file
            .canonicalize()
            .with_context(|| format!("resolving spec file '{}'", spec_file.display()))?;
    }
    if let Some(homedir) = cli.homedir {
        ctx.homedir = homedir;
    }
    ctx.build_dir = cli.build_dir;
    if let Some(repo) = cli.image_repo {
        ctx.image_repo = repo;
    }
    ctx.tag_override = cli.tag;
    ctx.branch_override = cli.current_branch;
    ctx.base_image_override = cli.base_image;
    if !cli.image_sources.is_empty() {
        ctx.image_sources = Some(cli.image_sources);
    }
    ctx.pkg_cache_path = cli.pkg_cache_dir;
    ctx.ccache_dir = cli.ccache_dir;
    ctx.overlay = cli.overlay_dir.as_deref().map(Overlay::resolve);
    ctx.extra_args = cli.extra;
    ctx.ports = cli.ports;
    ctx.engine_override = cli.container_engine;
    ctx.keep_container = cli.keep_container;
    ctx.no_prereqs = cli.no_prereqs;
    ctx.dry_run = cli.dry_run;
    ctx.remaining_args = cli.rest;

    let mut runner = StepRunner::standard()?;
    let requested = if cli.execute.is_empty() {
        vec![StepId::Package]
    } else {
        cli.execute
    };
    for step in requested {
        runner
            .request(step, &ctx, true)
            .with_context(|| format!("executing step '{step}'"))?;
    }
    Ok(())
}

fn report(err: &anyhow::Error) {
    if let Some(BuildError::CommandFailed {
        command,
        status,
        output,
    }) = err.downcast_ref::<BuildError>()
    {
        error!("command failed with status {status}: {command}");
        if !output.is_empty() {
            error!("{output}");
        }
        error!("the failure may originate in the source tree rather than in the build tooling");
    } else {
        error!("{err:#}");
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
