//! # Bundle Pipeline
//!
//! Turns untrusted, user-submitted application source into a runnable,
//! network-policy-constrained static bundle and tracks it through a
//! versioned publish lifecycle.
//!
//! ## Security Guarantees
//!
//! - **No unreviewed egress**: bare imports resolve only through the pin
//!   map / allow-list against a configured CDN mirror
//! - **No unresolved imports ship**: bundle output is re-scanned and any
//!   surviving bare specifier aborts the build
//! - **Sandboxed project builds**: container mode runs capability-dropped
//!   with a read-only root filesystem and resource caps
//! - **Bounded execution**: one wall-clock deadline spans install+build;
//!   the whole process group is killed on expiry
//! - **Policy at the edge**: CSP and Permissions-Policy headers are derived
//!   from each build's manifest on every serve, defaulting to same-origin
//!   only and all permissions denied
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bundle_pipeline::{Orchestrator, PipelineConfig};
//! use bundle_pipeline::orchestrator::{BuildPayload, BuildRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::new(PipelineConfig::from_env());
//!     orchestrator.start_worker();
//!     let id = orchestrator.enqueue(BuildRequest {
//!         build_id: "b1".into(),
//!         payload: BuildPayload::Inline {
//!             source: "export default () => null;".into(),
//!             options: Default::default(),
//!         },
//!     }).await.unwrap();
//!     println!("accepted {id}");
//! }
//! ```

pub mod bundler;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod listing;
pub mod orchestrator;
pub mod policy;
pub mod publish;
pub mod resolver;
pub mod store;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use orchestrator::{BuildJob, BuildStatus, JobState, Orchestrator, StatusEvent};
pub use policy::{derive_headers, SecurityHeaders};
pub use publish::{publish, PublishOutcome, PublishRequest};
pub use resolver::{ImportPolicy, ImportResolver, ResolvedImport};
pub use store::{ArtifactSet, ArtifactStore};
