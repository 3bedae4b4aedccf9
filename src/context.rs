//! Resolved build configuration.
//!
//! A [`BuildContext`] is constructed once per process from user input.
//! Expensive facts — the detected container engine, the spec-file digest,
//! the current branch, the package name/version declared by the spec — are
//! computed lazily and memoized; execution is single-threaded, so plain
//! `OnceCell` fields suffice.

use std::cell::OnceCell;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::container::{self, Engine, Overlay, Port, RunRequest};
use crate::containerfile;
use crate::digest;
use crate::distro::DistroKind;
use crate::error::{BuildError, Result};
use crate::runner::{command_from, Runner};

/// Default in-container home/build directory.
pub const DEFAULT_HOMEDIR: &str = "/build";

/// Default image repository for derived tags.
pub const DEFAULT_IMAGE_REPO: &str = "buildbox";

/// Tag component used when the current branch cannot be determined.
const UNKNOWN_BRANCH: &str = "UNKNOWN";

/// Where a build-environment image may come from. Acquisition precedence is
/// fixed: cache, then pull, then build. The CLI only filters which
/// strategies are permitted; it never reorders them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Cache,
    Pull,
    Build,
}

impl ImageSource {
    pub const PRIORITY: [ImageSource; 3] =
        [ImageSource::Cache, ImageSource::Pull, ImageSource::Build];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageSource::Cache => "cache",
            ImageSource::Pull => "pull",
            ImageSource::Build => "build",
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSource {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cache" => Ok(ImageSource::Cache),
            "pull" => Ok(ImageSource::Pull),
            "build" => Ok(ImageSource::Build),
            other => Err(BuildError::Config(format!(
                "unknown image source '{other}'; expected cache, pull or build"
            ))),
        }
    }
}

/// Package identity declared by the spec file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgInfo {
    pub name: String,
    pub version: String,
}

/// Resolved configuration for one invocation.
pub struct BuildContext {
    pub distro: DistroKind,
    /// Host path of the source tree mounted into every container.
    pub source_dir: PathBuf,
    /// Host directory holding the spec file and packaging auxiliary files;
    /// also the image build context.
    pub packaging_dir: PathBuf,
    /// Host path of the package spec file.
    pub spec_file: PathBuf,
    /// In-container home/build root where the source tree is mounted.
    pub homedir: String,
    /// Build directory relative to the home dir, exported as BUILD_DIR.
    pub build_dir: Option<String>,
    pub image_repo: String,
    /// Explicit tag, or `+suffix` to append to the derived tag.
    pub tag_override: Option<String>,
    pub branch_override: Option<String>,
    pub base_image_override: Option<String>,
    /// Base directory for package-manager cache reuse across image builds.
    pub pkg_cache_path: Option<PathBuf>,
    /// In-container ccache dir template; `{homedir}`, `{build_dir}` and
    /// `{distro}` placeholders are substituted.
    pub ccache_dir: Option<String>,
    pub overlay: Option<Overlay>,
    pub extra_args: Vec<String>,
    pub ports: Vec<Port>,
    pub keep_container: bool,
    pub no_prereqs: bool,
    pub dry_run: bool,
    /// Permitted acquisition strategies; `None` permits all of them.
    pub image_sources: Option<Vec<ImageSource>>,
    pub engine_override: Option<String>,
    /// Arguments after `--`, forwarded to the custom step.
    pub remaining_args: Vec<String>,

    engine: OnceCell<Engine>,
    spec_digest: OnceCell<String>,
    branch: OnceCell<String>,
    pkg_info: OnceCell<PkgInfo>,
}

impl BuildContext {
    pub fn new(distro: DistroKind, source_dir: PathBuf) -> Self {
        let packaging_dir = source_dir.join("packaging");
        let spec_file = packaging_dir.join(containerfile::SPEC_BASENAME);
        Self {
            distro,
            source_dir,
            packaging_dir,
            spec_file,
            homedir: DEFAULT_HOMEDIR.to_string(),
            build_dir: None,
            image_repo: DEFAULT_IMAGE_REPO.to_string(),
            tag_override: None,
            branch_override: None,
            base_image_override: None,
            pkg_cache_path: None,
            ccache_dir: None,
            overlay: None,
            extra_args: Vec::new(),
            ports: Vec::new(),
            keep_container: false,
            no_prereqs: false,
            dry_run: false,
            image_sources: None,
            engine_override: None,
            remaining_args: Vec::new(),
            engine: OnceCell::new(),
            spec_digest: OnceCell::new(),
            branch: OnceCell::new(),
            pkg_info: OnceCell::new(),
        }
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.dry_run)
    }

    /// Detected container engine, resolved at most once per context.
    pub fn engine(&self) -> Result<Engine> {
        if let Some(e) = self.engine.get() {
            return Ok(e.clone());
        }
        let engine = Engine::detect(self.engine_override.as_deref())?;
        let _ = self.engine.set(engine.clone());
        Ok(engine)
    }

    /// Base image for the build environment: explicit override or the
    /// distro table default.
    pub fn base_image(&self) -> &str {
        self.base_image_override
            .as_deref()
            .unwrap_or(self.distro.profile().base_image)
    }

    /// Current branch for tag derivation. Falls back to the override, then
    /// `git rev-parse`, then a fixed placeholder; slashes become dashes so
    /// the result is a valid tag component.
    pub fn branch(&self) -> String {
        if let Some(b) = self.branch.get() {
            return b.clone();
        }
        let branch = match &self.branch_override {
            Some(b) => b.clone(),
            None => self.branch_from_git(),
        };
        let branch = branch.replace('/', "-");
        let _ = self.branch.set(branch.clone());
        branch
    }

    fn branch_from_git(&self) -> String {
        let mut cmd = std::process::Command::new("git");
        cmd.arg("-C")
            .arg(&self.source_dir)
            .args(["rev-parse", "--abbrev-ref", "HEAD"]);
        match self.runner().probe(&mut cmd) {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).trim().to_string()
            }
            _ => {
                debug!("could not determine current branch; using {UNKNOWN_BRANCH}");
                UNKNOWN_BRANCH.to_string()
            }
        }
    }

    /// Image tag: explicit override, or `<branch>.<distro>` with an
    /// optional `+suffix` appended as `.suffix`.
    pub fn tag(&self) -> String {
        match self.tag_override.as_deref() {
            Some(t) if !t.starts_with('+') => t.to_string(),
            Some(t) => format!("{}.{}.{}", self.branch(), self.distro, &t[1..]),
            None => format!("{}.{}", self.branch(), self.distro),
        }
    }

    pub fn image_name(&self) -> String {
        format!("{}:{}", self.image_repo, self.tag())
    }

    /// Digest of the spec file, computed at most once.
    pub fn spec_digest(&self) -> Result<String> {
        if let Some(d) = self.spec_digest.get() {
            return Ok(d.clone());
        }
        let d = digest::sha256_hex(&self.spec_file)?;
        let _ = self.spec_digest.set(d.clone());
        Ok(d)
    }

    /// Package-manager cache directory for this distro, if caching is on.
    pub fn pkg_cache_dir(&self) -> Option<PathBuf> {
        self.pkg_cache_path
            .as_ref()
            .map(|base| base.join(format!("_buildbox_{}", self.distro)))
    }

    /// Whether the permitted set includes an acquisition strategy.
    pub fn source_permitted(&self, source: ImageSource) -> bool {
        match &self.image_sources {
            None => true,
            Some(set) => set.contains(&source),
        }
    }

    pub fn permitted_sources_hint(&self) -> String {
        ImageSource::PRIORITY
            .iter()
            .filter(|s| self.source_permitted(**s))
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Map the container user to root when the invoking user is not.
    pub fn map_user(&self) -> bool {
        #[cfg(unix)]
        {
            !nix::unistd::geteuid().is_root()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Package name and version declared by the spec, probed via `rpm -q
    /// --specfile` inside the build environment and memoized.
    ///
    /// The probe is read-only and runs even under dry-run; if it cannot run
    /// there (no image yet), dry-run falls back to placeholder values so
    /// later commands can still be rendered.
    pub fn package_info(&self) -> Result<PkgInfo> {
        if let Some(info) = self.pkg_info.get() {
            return Ok(info.clone());
        }
        let req = RunRequest {
            args: vec![
                "rpm".into(),
                "-q".into(),
                "--queryformat".into(),
                "%{name}: %{version}\\n".into(),
                "--specfile".into(),
                containerfile::canonical_spec_path(),
            ],
            ..Default::default()
        };
        let argv = container::run_command(self, &req)?;
        let out = self.runner().probe(&mut command_from(&argv))?;
        if !out.status.success() {
            if self.dry_run {
                warn!("(dry-run) cannot probe package version; using placeholders");
                let info = PkgInfo {
                    name: "package".to_string(),
                    version: "0".to_string(),
                };
                let _ = self.pkg_info.set(info.clone());
                return Ok(info);
            }
            return Err(BuildError::CommandFailed {
                command: crate::runner::render(&command_from(&argv)),
                status: out.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&out.stderr).trim_end().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let info = parse_pkg_info(&text).ok_or_else(|| {
            BuildError::Config(format!(
                "could not parse package name/version from rpm output: {text:?}"
            ))
        })?;
        debug!("spec declares {} {}", info.name, info.version);
        let _ = self.pkg_info.set(info.clone());
        Ok(info)
    }
}

/// Parse the first `name: version` line of the rpm query output.
fn parse_pkg_info(text: &str) -> Option<PkgInfo> {
    let line = text.lines().find(|l| l.contains(':'))?;
    let (name, version) = line.split_once(':')?;
    let (name, version) = (name.trim(), version.trim());
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(PkgInfo {
        name: name.to_string(),
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> BuildContext {
        let mut ctx = BuildContext::new(DistroKind::Centos9, PathBuf::from("/src/pkg"));
        ctx.branch_override = Some("feature/foo".into());
        ctx
    }

    #[test]
    fn derived_tag_uses_branch_and_distro() {
        let ctx = ctx();
        assert_eq!(ctx.tag(), "feature-foo.centos9");
        assert_eq!(ctx.image_name(), "buildbox:feature-foo.centos9");
    }

    #[test]
    fn explicit_tag_wins_and_suffix_appends() {
        let mut a = ctx();
        a.tag_override = Some("v1".into());
        assert_eq!(a.tag(), "v1");

        let mut b = ctx();
        b.tag_override = Some("+ceph".into());
        assert_eq!(b.tag(), "feature-foo.centos9.ceph");
    }

    #[test]
    fn tag_is_stable_for_fixed_inputs() {
        let ctx = ctx();
        assert_eq!(ctx.tag(), ctx.tag());
    }

    #[test]
    fn base_image_defaults_to_distro_table() {
        let mut ctx = ctx();
        assert_eq!(ctx.base_image(), "quay.io/centos/centos:stream9");
        ctx.base_image_override = Some("registry.example/base:1".into());
        assert_eq!(ctx.base_image(), "registry.example/base:1");
    }

    #[test]
    fn pkg_cache_dir_is_namespaced_per_distro() {
        let mut ctx = ctx();
        assert_eq!(ctx.pkg_cache_dir(), None);
        ctx.pkg_cache_path = Some(PathBuf::from("/var/cache/buildbox"));
        assert_eq!(
            ctx.pkg_cache_dir(),
            Some(PathBuf::from("/var/cache/buildbox/_buildbox_centos9"))
        );
    }

    #[test]
    fn spec_digest_is_memoized() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"Name: pkg\n").unwrap();
        f.flush().unwrap();

        let mut ctx = ctx();
        ctx.spec_file = f.path().to_path_buf();
        let first = ctx.spec_digest().unwrap();

        // Changing the file after the first read must not change the
        // memoized digest within this context.
        f.write_all(b"Version: 2\n").unwrap();
        f.flush().unwrap();
        assert_eq!(ctx.spec_digest().unwrap(), first);
    }

    #[test]
    fn source_permission_filter() {
        let mut ctx = ctx();
        assert!(ctx.source_permitted(ImageSource::Build));
        ctx.image_sources = Some(vec![ImageSource::Cache]);
        assert!(ctx.source_permitted(ImageSource::Cache));
        assert!(!ctx.source_permitted(ImageSource::Pull));
        assert_eq!(ctx.permitted_sources_hint(), "cache");
    }

    #[test]
    fn pkg_info_parsing() {
        let info = parse_pkg_info("samba: 4.99\nother: 1\n").unwrap();
        assert_eq!(info.name, "samba");
        assert_eq!(info.version, "4.99");
        assert!(parse_pkg_info("garbage\n").is_none());
        assert!(parse_pkg_info("").is_none());
    }
}
