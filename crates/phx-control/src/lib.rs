//! Experiment Controller and Deployment Manager.
//!
//! Both components are thin orchestrators: they hold no state of their
//! own beyond the per-experiment serialization lock that keeps phase
//! transitions from interleaving. All durable state lives in `phx-store`;
//! all dispatch goes through `phx-queue`; all fan-out goes through
//! `phx-bus`.

pub mod deployments;
pub mod experiments;
pub mod loadsim;

pub use deployments::{CreateDeploymentRequest, DeploymentManager, DeploymentStatusReport, NodeTaskCounts, UpdateDeploymentRequest};
pub use experiments::ExperimentController;
pub use loadsim::{LoadSimJob, LoadSimManager, StartLoadSimRequest};
