//! Target distro lookup table.
//!
//! Everything distro-specific lives in one static table: the package-manager
//! kind, the default base image, and the extra repositories that must be
//! enabled before build dependencies can resolve.

use std::fmt;
use std::str::FromStr;

use crate::error::{BuildError, Result};

/// Supported target distros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistroKind {
    Centos9,
    Centos10,
    Fedora,
}

/// Package-manager family used inside the build environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
}

/// Per-distro build-environment facts.
#[derive(Debug)]
pub struct DistroProfile {
    pub kind: DistroKind,
    pub package_manager: PackageManager,
    /// Default base image when the caller does not supply one.
    pub base_image: &'static str,
    /// Packages that enable extra repositories, installed first.
    pub repo_packages: &'static [&'static str],
    /// Repositories passed as `--enablerepo` to every dnf invocation.
    pub enable_repos: &'static [&'static str],
}

pub const PROFILES: &[DistroProfile] = &[
    DistroProfile {
        kind: DistroKind::Centos9,
        package_manager: PackageManager::Dnf,
        base_image: "quay.io/centos/centos:stream9",
        repo_packages: &["epel-release", "centos-release-gluster", "centos-release-ceph-reef"],
        enable_repos: &["crb", "epel", "centos-gluster11", "centos-ceph-reef"],
    },
    DistroProfile {
        kind: DistroKind::Centos10,
        package_manager: PackageManager::Dnf,
        base_image: "quay.io/centos/centos:stream10",
        repo_packages: &["epel-release"],
        enable_repos: &["crb", "epel"],
    },
    DistroProfile {
        kind: DistroKind::Fedora,
        package_manager: PackageManager::Dnf,
        base_image: "registry.fedoraproject.org/fedora:40",
        repo_packages: &[],
        enable_repos: &[],
    },
];

impl DistroKind {
    pub const ALL: &'static [DistroKind] =
        &[DistroKind::Centos9, DistroKind::Centos10, DistroKind::Fedora];

    pub fn as_str(self) -> &'static str {
        match self {
            DistroKind::Centos9 => "centos9",
            DistroKind::Centos10 => "centos10",
            DistroKind::Fedora => "fedora",
        }
    }

    pub fn profile(self) -> &'static DistroProfile {
        PROFILES
            .iter()
            .find(|p| p.kind == self)
            .expect("every DistroKind has a profile entry")
    }
}

impl fmt::Display for DistroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistroKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "centos9" | "centos" | "c9" => Ok(DistroKind::Centos9),
            "centos10" | "c10" => Ok(DistroKind::Centos10),
            "fedora" | "fc" => Ok(DistroKind::Fedora),
            other => Err(BuildError::Config(format!(
                "unknown distro '{}'; expected one of: {}",
                other,
                DistroKind::ALL
                    .iter()
                    .map(|d| d.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}
