//! clustertest - end-to-end test harness for workload clusters
//!
//! Drives a management cluster to create workload clusters, waits for them
//! to become reachable, hands out clients, and tears them down again.
//!
//! # Crates
//!
//! - [`common`] - polling engine, object store seam, errors, configuration
//!   and logging
//! - [`app`] - installable units, organizations, version resolution and
//!   manifest rendering
//! - [`cluster`] - conditions, credentials and the lifecycle orchestrator
//!
//! # Example
//!
//! ```no_run
//! use clustertest::app::{ClusterSpec, Provider};
//! use clustertest::Framework;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> clustertest::Result<()> {
//! let framework = Framework::from_env().await?;
//! let cancel = CancellationToken::new();
//! let record = framework
//!     .apply_cluster(ClusterSpec::new("t-acme", Provider::Aws), cancel.clone())
//!     .await?;
//! let wc = framework.wc(&record.name)?;
//! # let _ = wc;
//! framework.delete_cluster(&record, cancel).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub use clustertest_app as app;
pub use clustertest_cluster as cluster;
pub use clustertest_common as common;

pub use clustertest_cluster::Framework;
pub use clustertest_common::{Error, Result};
