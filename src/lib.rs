//! Containerized package-build orchestration.
//!
//! buildbox drives rpm package builds inside podman or docker containers.
//! Work is organized as named, memoized steps with declared prerequisites:
//!
//! - **Environment steps** - Prime package-manager caches, generate a
//!   containerfile and build the build-environment image, or acquire one
//!   from the local cache or a registry
//! - **Packaging steps** - Configure and compile the tree, cut a source
//!   tarball, build source and binary packages
//! - **Escape hatches** - Run a custom command or an interactive shell in
//!   the same environment the builds use
//!
//! Build images record a digest of the package spec file as an image
//! annotation; a cached image whose digest no longer matches the spec on
//! disk is refused rather than silently reused.
//!
//! # Architecture
//!
//! ```text
//! buildbox (CLI)
//!     │
//!     ├── context    - Resolved per-invocation configuration, memoized
//!     │                engine/branch/digest/version probes
//!     ├── steps      - Step table, prerequisites, execution engine
//!     ├── container  - Engine detection and `run` command construction
//!     ├── containerfile - Build-environment image generation
//!     └── discover   - Artifact discovery with cardinality checks
//! ```
//!
//! All external commands go through [`runner::Runner`], which implements
//! dry-run by refusing to spawn anything except read-only probes.

pub mod container;
pub mod containerfile;
pub mod context;
pub mod digest;
pub mod discover;
pub mod distro;
pub mod error;
pub mod runner;
pub mod steps;

pub use context::{BuildContext, ImageSource};
pub use distro::DistroKind;
pub use error::{BuildError, Result};
pub use steps::{StepId, StepRunner};
