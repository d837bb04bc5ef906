//! Cluster bring-up - provision a cluster and supervise it until it serves traffic
//!
//! A single supervised run takes a cluster from "no infrastructure" to
//! "verified serving traffic": cloud infrastructure, Kubernetes configuration,
//! the controller workload, DNS, and finally every tenant endpoint.
//!
//! # Architecture
//!
//! The run is layered:
//! - [`retry`] re-runs whole attempts a bounded number of times
//! - [`timeout`] races each attempt against its deadline
//! - [`workflow`] sequences the stages of one attempt
//! - [`task`] gives every piece of concurrent work a cancellable, owned handle
//!
//! Cancelling a task always waits for it (and anything it spawned) to stop,
//! so a timed-out attempt never keeps running in the background.
//!
//! # Modules
//!
//! - [`config`] - Cluster definition, credentials and derived configuration
//! - [`provider`] - Cloud infrastructure provisioning (GKE, EKS)
//! - [`cluster`] - Kubernetes operations against the provisioned cluster
//! - [`probe`] - Concurrent endpoint readiness polling
//! - [`dns`] - DNS propagation waits
//! - [`image`] - Controller image pre-flight check
//! - [`kube_utils`] - Shared kube-rs helpers
//! - [`error`] - Error types and kinds

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod dns;
pub mod error;
pub mod image;
pub mod kube_utils;
pub mod probe;
pub mod provider;
pub mod retry;
pub mod task;
pub mod timeout;
pub mod workflow;

pub use error::{Error, ErrorKind};
pub use workflow::{create_cluster, AttemptOutcome, WorkflowContext, WorkflowDeps, WorkflowSettings};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
