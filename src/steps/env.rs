//! Build-environment steps: package-cache priming, image building and
//! image acquisition.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::container::{ensure_copy_dest_outside_volumes, Volume};
use crate::containerfile::{self, ANN_BUILD_IMAGE, ANN_SPEC_DIGEST, PKG_SOURCES_DIR};
use crate::context::{BuildContext, ImageSource};
use crate::digest;
use crate::distro::PackageManager;
use crate::error::{BuildError, Result};
use crate::runner::{command_from, skip_on_dry_run};
use crate::steps::{StepId, StepRunner};

/// Prime the package-manager cache directories mounted into image builds.
pub(super) fn pkg_cache(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    // only dnf caching is wired up
    if ctx.distro.profile().package_manager != PackageManager::Dnf {
        return Ok(());
    }
    let Some(cache_dir) = ctx.pkg_cache_dir() else {
        debug!("package-manager caching disabled");
        return Ok(());
    };
    for sub in ["lib", "cache"] {
        let dir = cache_dir.join(sub);
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
    }
    let marker = cache_dir.join(".BUILDBOX_CACHE");
    std::fs::File::create(&marker).map_err(|e| BuildError::io(&marker, e))?;
    info!("package-manager cache primed at {}", cache_dir.display());
    Ok(())
}

/// Generate the containerfile and build the build-environment image.
pub(super) fn build_image(_runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let containerfile = containerfile::render(ctx)?;
    debug!("containerfile:\n{containerfile}");

    // must outlive the engine invocation below
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
    tmp.write_all(containerfile.as_bytes())
        .and_then(|_| tmp.flush())
        .map_err(|e| BuildError::io(tmp.path(), e))?;

    let argv = build_image_argv(ctx, tmp.path())?;
    info!("building image {}", ctx.image_name());
    skip_on_dry_run(ctx.runner().run_streamed(&mut command_from(&argv)))
}

/// The full `engine build` argument vector.
fn build_image_argv(ctx: &BuildContext, containerfile_path: &Path) -> Result<Vec<String>> {
    let engine = ctx.engine()?;
    let digest = ctx.spec_digest()?;
    let mut argv = vec![
        engine.program().to_string(),
        "build".into(),
        "--pull=always".into(),
        "-t".into(),
        ctx.image_name(),
        engine.provenance_flag(ANN_BUILD_IMAGE, "true"),
        engine.provenance_flag(ANN_SPEC_DIGEST, &digest::annotation_value(&digest)),
        // distinct digests bust the layer cache even when annotations don't
        format!("--build-arg=SPEC_DIGEST={digest}"),
    ];
    if let Some(cache_dir) = ctx.pkg_cache_dir() {
        if !engine.supports_build_volumes() {
            warn!(
                "{} does not support build --volume; not mounting the package cache",
                engine.program()
            );
        } else {
            let volumes = [
                Volume::new(cache_dir.join("lib"), "/var/lib/dnf"),
                Volume::new(cache_dir.join("cache"), "/var/cache/dnf"),
            ];
            ensure_copy_dest_outside_volumes(Path::new(PKG_SOURCES_DIR), &volumes)?;
            argv.extend(volumes.iter().map(Volume::to_arg));
        }
    }
    argv.push("-f".into());
    argv.push(containerfile_path.display().to_string());
    argv.push(ctx.packaging_dir.display().to_string());
    Ok(argv)
}

/// Acquire a build-environment image, trying the permitted strategies in
/// fixed cache, pull, build order.
pub(super) fn image(runner: &mut StepRunner<'_>, ctx: &BuildContext) -> Result<()> {
    let engine = ctx.engine()?;
    let image = ctx.image_name();
    for source in ImageSource::PRIORITY {
        if !ctx.source_permitted(source) {
            debug!("image source {source} not permitted");
            continue;
        }
        match source {
            ImageSource::Cache => {
                let mut inspect = command_from(&[
                    engine.program().to_string(),
                    "image".into(),
                    "inspect".into(),
                    image.clone(),
                ]);
                let out = ctx.runner().probe(&mut inspect)?;
                if out.status.success() {
                    info!("build image {image} present");
                    verify_cached_digest(ctx, &out.stdout)?;
                    return Ok(());
                }
                info!("build image {image} not present");
            }
            ImageSource::Pull => {
                let mut pull = command_from(&[
                    engine.program().to_string(),
                    "pull".into(),
                    image.clone(),
                ]);
                let out = ctx.runner().probe(&mut pull)?;
                if out.status.success() {
                    info!("pulled build image {image}");
                    return Ok(());
                }
                info!("could not pull build image {image}");
            }
            ImageSource::Build => {
                info!("build image {image} needs to be built");
                runner.request(StepId::BuildImage, ctx, false)?;
                return Ok(());
            }
        }
    }
    Err(BuildError::NoImageSource(ctx.permitted_sources_hint()))
}

/// Refuse to reuse a cached image whose recorded spec digest no longer
/// matches the current spec file. Images without a recorded digest (pulled
/// from elsewhere, built by older tooling) are reused untouched.
fn verify_cached_digest(ctx: &BuildContext, inspect_json: &[u8]) -> Result<()> {
    let annotations = parse_annotations(inspect_json)?;
    let Some(recorded) = annotations.get(ANN_SPEC_DIGEST) else {
        debug!("cached image carries no spec digest; reusing as-is");
        return Ok(());
    };
    let current = digest::annotation_value(&ctx.spec_digest()?);
    if *recorded == current {
        debug!("cached image matches spec digest {current}");
        Ok(())
    } else {
        Err(BuildError::DigestMismatch {
            recorded: recorded.clone(),
            current,
        })
    }
}

/// The slice of `image inspect` output we care about. Podman records
/// provenance under `Annotations`, docker under `Config.Labels`.
#[derive(Debug, Default, serde::Deserialize)]
struct InspectRecord {
    // both engines emit explicit nulls for absent maps
    #[serde(rename = "Annotations", default)]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

/// Collect provenance key/values from `image inspect` output.
fn parse_annotations(inspect_json: &[u8]) -> Result<BTreeMap<String, String>> {
    // inspect prints an array of records; take the first
    let mut records: Vec<InspectRecord> = serde_json::from_slice(inspect_json)?;
    let Some(record) = records.drain(..).next() else {
        return Ok(BTreeMap::new());
    };
    let mut map = record.config.and_then(|c| c.labels).unwrap_or_default();
    map.extend(record.annotations.unwrap_or_default());
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::DistroKind;
    use std::path::PathBuf;

    fn ctx(source_dir: PathBuf) -> BuildContext {
        let mut ctx = BuildContext::new(DistroKind::Centos9, source_dir);
        ctx.engine_override = Some("podman".to_string());
        ctx.branch_override = Some("main".to_string());
        ctx.dry_run = true;
        ctx
    }

    fn write_spec(ctx: &BuildContext) {
        std::fs::create_dir_all(&ctx.packaging_dir).unwrap();
        std::fs::write(&ctx.spec_file, "Name: demo\nVersion: 1.0\n").unwrap();
    }

    #[test]
    fn pkg_cache_creates_dirs_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path().join("src"));
        ctx.pkg_cache_path = Some(dir.path().to_path_buf());
        let mut runner = StepRunner::standard().unwrap();
        pkg_cache(&mut runner, &ctx).unwrap();
        let cache = dir.path().join("_buildbox_centos9");
        assert!(cache.join("lib").is_dir());
        assert!(cache.join("cache").is_dir());
        assert!(cache.join(".BUILDBOX_CACHE").is_file());
    }

    #[test]
    fn pkg_cache_is_a_no_op_without_a_cache_path() {
        let ctx = ctx(PathBuf::from("/nonexistent/src"));
        let mut runner = StepRunner::standard().unwrap();
        pkg_cache(&mut runner, &ctx).unwrap();
    }

    #[test]
    fn build_argv_has_tag_provenance_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_path_buf());
        write_spec(&ctx);
        let digest = ctx.spec_digest().unwrap();
        let argv = build_image_argv(&ctx, Path::new("/tmp/cf")).unwrap();
        assert_eq!(argv[0], "podman");
        assert_eq!(argv[1], "build");
        assert!(argv.contains(&"--pull=always".to_string()));
        assert!(argv.contains(&"buildbox:main.centos9".to_string()));
        assert!(argv.contains(&format!(
            "--annotation={ANN_SPEC_DIGEST}=sha256:{digest}"
        )));
        assert!(argv.contains(&format!("--annotation={ANN_BUILD_IMAGE}=true")));
        assert!(argv.contains(&format!("--build-arg=SPEC_DIGEST={digest}")));
        // containerfile and build context come last
        assert_eq!(argv[argv.len() - 3], "-f");
        assert_eq!(argv[argv.len() - 2], "/tmp/cf");
        assert_eq!(
            argv[argv.len() - 1],
            ctx.packaging_dir.display().to_string()
        );
    }

    #[test]
    fn build_argv_mounts_cache_volumes_on_podman() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path().join("src"));
        write_spec(&ctx);
        ctx.pkg_cache_path = Some(PathBuf::from("/var/tmp/cache"));
        let argv = build_image_argv(&ctx, Path::new("/tmp/cf")).unwrap();
        assert!(argv.contains(
            &"--volume=/var/tmp/cache/_buildbox_centos9/lib:/var/lib/dnf:Z".to_string()
        ));
        assert!(argv.contains(
            &"--volume=/var/tmp/cache/_buildbox_centos9/cache:/var/cache/dnf:Z".to_string()
        ));
    }

    #[test]
    fn build_argv_skips_cache_volumes_on_docker() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx(dir.path().join("src"));
        write_spec(&ctx);
        ctx.engine_override = Some("docker".to_string());
        ctx.pkg_cache_path = Some(PathBuf::from("/var/tmp/cache"));
        let argv = build_image_argv(&ctx, Path::new("/tmp/cf")).unwrap();
        assert!(!argv.iter().any(|a| a.contains("/var/lib/dnf")));
        assert!(argv.contains(&format!("--label={ANN_BUILD_IMAGE}=true")));
    }

    #[test]
    fn annotations_parsed_from_podman_inspect() {
        let json = format!(
            r#"[{{"Id": "abc", "Annotations": {{"{ANN_SPEC_DIGEST}": "sha256:feed"}}}}]"#
        );
        let map = parse_annotations(json.as_bytes()).unwrap();
        assert_eq!(map.get(ANN_SPEC_DIGEST).map(String::as_str), Some("sha256:feed"));
    }

    #[test]
    fn labels_parsed_from_docker_inspect() {
        let json = format!(
            r#"[{{"Id": "abc", "Config": {{"Labels": {{"{ANN_SPEC_DIGEST}": "sha256:beef"}}}}}}]"#
        );
        let map = parse_annotations(json.as_bytes()).unwrap();
        assert_eq!(map.get(ANN_SPEC_DIGEST).map(String::as_str), Some("sha256:beef"));
    }

    #[test]
    fn missing_annotations_parse_to_empty() {
        let map = parse_annotations(br#"[{"Id": "abc"}]"#).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn digest_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_path_buf());
        write_spec(&ctx);
        let json = format!(
            r#"[{{"Annotations": {{"{ANN_SPEC_DIGEST}": "sha256:0000"}}}}]"#
        );
        let err = verify_cached_digest(&ctx, json.as_bytes()).unwrap_err();
        assert!(matches!(err, BuildError::DigestMismatch { .. }));
    }

    /// Engine stand-in: a shell script whose path classifies as podman,
    /// logging the subcommand of every invocation.
    #[cfg(unix)]
    fn stub_engine(dir: &std::path::Path, log: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("podman");
        let script = format!("#!/bin/sh\necho \"$1\" >> {}\n{body}\n", log.display());
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    fn calls(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn cached_image_short_circuits_pull_and_build() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut ctx = ctx(dir.path().join("src"));
        write_spec(&ctx);
        // inspect answers with an unannotated image; everything else fails
        ctx.engine_override = Some(stub_engine(
            dir.path(),
            &log,
            r#"if [ "$1" = image ]; then echo '[{"Annotations": null}]'; exit 0; fi
exit 1"#,
        ));

        let mut runner = StepRunner::standard().unwrap();
        image(&mut runner, &ctx).unwrap();
        assert_eq!(calls(&log), ["image"]);
    }

    #[cfg(unix)]
    #[test]
    fn cache_miss_falls_back_to_pull() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut ctx = ctx(dir.path().join("src"));
        write_spec(&ctx);
        ctx.engine_override = Some(stub_engine(
            dir.path(),
            &log,
            r#"if [ "$1" = pull ]; then exit 0; fi
exit 1"#,
        ));

        let mut runner = StepRunner::standard().unwrap();
        image(&mut runner, &ctx).unwrap();
        assert_eq!(calls(&log), ["image", "pull"]);
    }

    #[cfg(unix)]
    #[test]
    fn exhausted_permitted_sources_fail_with_no_image_source() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut ctx = ctx(dir.path().join("src"));
        write_spec(&ctx);
        ctx.engine_override = Some(stub_engine(dir.path(), &log, "exit 1"));
        ctx.image_sources = Some(vec![ImageSource::Cache]);

        let mut runner = StepRunner::standard().unwrap();
        let err = image(&mut runner, &ctx).unwrap_err();
        assert!(matches!(err, BuildError::NoImageSource(ref hint) if hint == "cache"));
        // pull and build were never permitted, so never attempted
        assert_eq!(calls(&log), ["image"]);
    }

    #[test]
    fn matching_or_absent_digest_reuses_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_path_buf());
        write_spec(&ctx);
        let current = digest::annotation_value(&ctx.spec_digest().unwrap());
        let json = format!(r#"[{{"Annotations": {{"{ANN_SPEC_DIGEST}": "{current}"}}}}]"#);
        verify_cached_digest(&ctx, json.as_bytes()).unwrap();
        verify_cached_digest(&ctx, br#"[{"Id": "x"}]"#).unwrap();
    }
}
