//! Generated build-environment descriptor.
//!
//! The containerfile is ephemeral: rendered into a temp file for each
//! `build-image` run, never checked in. It declares the base image, creates
//! the build directories, copies in the packaging files, and resolves build
//! dependencies with one chained shell command so the whole bootstrap is a
//! single layer.

use std::fmt::Write;

use crate::context::BuildContext;
use crate::error::{BuildError, Result};

/// In-container directory holding the spec and packaging auxiliary files.
pub const PKG_SOURCES_DIR: &str = "/usr/local/src/pkg";

/// Canonical spec-file name inside the build environment. A caller-supplied
/// spec with another name is normalized to this at image-build time, so
/// every later step addresses one fixed location.
pub const SPEC_BASENAME: &str = "package.spec";

/// Annotation marking an image as a buildbox build environment.
pub const ANN_BUILD_IMAGE: &str = "dev.buildbox.build-image";

/// Annotation carrying the `sha256:<hex>` digest of the spec file the
/// environment was built from.
pub const ANN_SPEC_DIGEST: &str = "dev.buildbox.spec-digest";

/// Fixed in-container path of the spec file.
pub fn canonical_spec_path() -> String {
    format!("{PKG_SOURCES_DIR}/{SPEC_BASENAME}")
}

/// Render the containerfile for the context's distro and spec file.
pub fn render(ctx: &BuildContext) -> Result<String> {
    let profile = ctx.distro.profile();
    let spec_rel = ctx
        .spec_file
        .strip_prefix(&ctx.packaging_dir)
        .map_err(|_| {
            BuildError::Config(format!(
                "spec file {} must reside in the packaging directory {} \
                 so it can be copied into the build environment",
                ctx.spec_file.display(),
                ctx.packaging_dir.display()
            ))
        })?
        .display()
        .to_string();

    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", ctx.base_image());
    // Changing the spec changes this arg, which invalidates the engine's
    // layer cache from here down.
    let _ = writeln!(out, "ARG SPEC_DIGEST=unknown");
    let _ = writeln!(out, "RUN mkdir -p -m 0777 {} {}", ctx.homedir, PKG_SOURCES_DIR);
    let _ = writeln!(out, "COPY . {PKG_SOURCES_DIR}/");

    let mut commands: Vec<String> = Vec::new();
    if spec_rel != SPEC_BASENAME {
        commands.push(format!(
            "cp {PKG_SOURCES_DIR}/{spec_rel} {}",
            canonical_spec_path()
        ));
    }

    let repo_opts: Vec<String> = profile
        .enable_repos
        .iter()
        .map(|r| format!("--enablerepo={r}"))
        .collect();
    if !profile.repo_packages.is_empty() {
        commands.push(format!("dnf install -y {}", profile.repo_packages.join(" ")));
    }
    commands.push(chain_install(
        &repo_opts,
        &["git", "rsync", "gcc", "/usr/bin/rpmbuild", "'dnf-command(builddep)'"],
    ));
    commands.push(format!(
        "dnf builddep -y {}{}",
        join_opts(&repo_opts),
        canonical_spec_path()
    ));

    let _ = writeln!(out, "RUN {}", commands.join(" && "));
    Ok(out)
}

fn chain_install(repo_opts: &[String], packages: &[&str]) -> String {
    format!("dnf install -y {}{}", join_opts(repo_opts), packages.join(" "))
}

fn join_opts(opts: &[String]) -> String {
    if opts.is_empty() {
        String::new()
    } else {
        format!("{} ", opts.join(" "))
    }
}
