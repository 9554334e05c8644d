//! Installable units, organizations and version resolution.

#![deny(missing_docs)]

pub mod application;
pub mod cluster;
pub mod github;
pub mod organization;
pub mod render;
pub mod version;

pub use application::{Application, ExtraConfig, TemplateValues};
pub use cluster::{BuiltCluster, ClusterSpec, DefaultAppsPolicy, Provider, ReleaseRef};
pub use github::GitHubReleaseSource;
pub use organization::Organization;
pub use render::{AppCatalogRenderer, ManifestRenderer, RenderedUnit};
pub use version::{
    ReleaseError, ReleaseSource, ResolvedVersion, VersionOverrides, VersionResolver,
};
