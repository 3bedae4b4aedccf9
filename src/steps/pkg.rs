//! Packaging steps, each a shell script run inside the build environment.
//!
//! Tarball, source package and binary packages land under a directory named
//! after the short spec digest, so artifacts built from different spec
//! revisions never collide.

use std::path::PathBuf;

use tracing::info;

use crate::container::{self, Overlay, RunRequest};
use crate::containerfile::{canonical_spec_path, PKG_SOURCES_DIR};
use crate::context::{BuildContext, PkgInfo};
use crate::digest;
use crate::discover;
use crate::error::{BuildError, Result};
use crate::runner::{command_from, skip_on_dry_run};
use crate::steps::{StepId, StepRunner};

fn run_in_container(ctx: &BuildContext, req: &RunRequest) -> Result<()> {
    let argv = container::run_command(ctx, req)?;
    skip_on_dry_run(ctx.runner().run_streamed(&mut command_from(&argv)))
}

pub(super) fn configure(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    run_in_container(ctx, &RunRequest::shell(configure_script(&ctx.homedir)))
}

/// Configure is a no-op when the tree is already configured.
fn configure_script(homedir: &str) -> String {
    format!("cd {homedir} && if [ -e config.status ]; then exit 0; fi && ./configure")
}

pub(super) fn build(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    run_in_container(ctx, &RunRequest::shell(build_script(&ctx.homedir)))
}

fn build_script(homedir: &str) -> String {
    format!("cd {homedir} && make -j")
}

pub(super) fn tarball(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let info = ctx.package_info()?;
    let short = digest::short(&ctx.spec_digest()?).to_string();
    run_in_container(
        ctx,
        &RunRequest::shell(tarball_script(&ctx.homedir, &short, &info)),
    )
}

fn tarball_script(homedir: &str, short: &str, info: &PkgInfo) -> String {
    let PkgInfo { name, version } = info;
    format!(
        "cd {homedir} && mkdir -p {short} && \
         git archive --prefix={name}-{version}/ --output={short}/{name}-{version}.tar.gz HEAD"
    )
}

pub(super) fn source_package(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let info = ctx.package_info()?;
    let short = digest::short(&ctx.spec_digest()?).to_string();
    run_in_container(
        ctx,
        &RunRequest::shell(source_package_script(&ctx.homedir, &short, &info)),
    )
}

/// Stage the packaging auxiliary files next to the tarball, then build the
/// source package with all rpmbuild directories pointed at the staging dir.
fn source_package_script(homedir: &str, short: &str, info: &PkgInfo) -> String {
    let stage = format!("{homedir}/{short}");
    let name = &info.name;
    [
        format!("rsync -r {PKG_SOURCES_DIR}/ {stage}/"),
        format!("cp {spec} {stage}/{name}.spec", spec = canonical_spec_path()),
        format!(
            "rpmbuild --define '_topdir {stage}' --define '_sourcedir {stage}' \
             --define '_srcrpmdir {stage}' -bs {stage}/{name}.spec"
        ),
    ]
    .join(" && ")
}

/// Rebuild binary packages from the source package, building the source
/// package first when none exists yet.
pub(super) fn package(runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let info = ctx.package_info()?;
    let short = digest::short(&ctx.spec_digest()?).to_string();
    let pattern = format!("{}-{}*.src.rpm", info.name, info.version);
    let srpm = match discover_stage(ctx, &short, &pattern)? {
        Some(path) => path,
        None => {
            info!("no source package found; building one");
            runner.request(StepId::SourcePackage, ctx, false)?;
            match discover_stage(ctx, &short, &pattern)? {
                Some(path) => path,
                None if ctx.dry_run => {
                    info!("(dry-run) no source package present; not rebuilding packages");
                    return Ok(());
                }
                None => return Err(BuildError::MissingArtifact { pattern }),
            }
        }
    };
    let file_name = srpm
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            BuildError::Config(format!("bad source package path: {}", srpm.display()))
        })?;
    info!("rebuilding packages from {file_name}");
    run_in_container(
        ctx,
        &RunRequest::shell(package_script(&ctx.homedir, &short, &file_name)),
    )
}

/// Locate a staged artifact on the host. Container writes made through a
/// persistent overlay land in its upper dir, shadowing the source tree in
/// the merged view, so the upper stage is searched first. (A temporary
/// overlay discards its writes at teardown; nothing of it can be found.)
fn discover_stage(ctx: &BuildContext, short: &str, pattern: &str) -> Result<Option<PathBuf>> {
    if let Some(Overlay::Persistent { upper, .. }) = &ctx.overlay {
        if let Some(path) = discover::find_unique(&upper.join(short), pattern)? {
            return Ok(Some(path));
        }
    }
    discover::find_unique(&ctx.source_dir.join(short), pattern)
}

fn package_script(homedir: &str, short: &str, srpm_name: &str) -> String {
    let topdir = format!("{homedir}/rpmbuild");
    format!(
        "mkdir -p {topdir} && \
         rpmbuild --define '_topdir {topdir}' --rebuild {homedir}/{short}/{srpm_name}"
    )
}

/// Run the arguments given after `--` as a shell command in the build
/// environment.
pub(super) fn custom(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    if ctx.remaining_args.is_empty() {
        return Err(BuildError::Config(
            "no custom command given; pass it after '--' on the command line".to_string(),
        ));
    }
    let script = ctx.remaining_args.join(" ");
    info!("custom command: {script}");
    let req = RunRequest {
        workdir: Some(ctx.homedir.clone()),
        ports: ctx.ports.clone(),
        ..RunRequest::shell(script)
    };
    run_in_container(ctx, &req)
}

pub(super) fn interactive(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let req = RunRequest {
        args: Vec::new(), // image default command, i.e. a login shell
        workdir: Some(ctx.homedir.clone()),
        interactive: true,
        ports: ctx.ports.clone(),
    };
    let argv = container::run_command(ctx, &req)?;
    // whatever exit status the user's shell ends with is not a failure
    match ctx.runner().run_streamed(&mut command_from(&argv)) {
        Err(BuildError::CommandFailed { .. }) => Ok(()),
        other => skip_on_dry_run(other),
    }
}
