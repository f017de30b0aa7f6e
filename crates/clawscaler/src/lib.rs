//! Clawscaler - the Clawbernetes autoscaling daemon
//!
//! Loads a policy document, samples workload metrics from Prometheus, and
//! writes replica counts to a workload control plane. A small HTTP listener
//! serves `/metrics`, `/status` and `/healthz`.

#![forbid(unsafe_code)]

pub mod config;
pub mod control_plane;
pub mod daemon;
pub mod error;
pub mod server;

pub use config::{ControlPlaneConfig, DaemonConfig, HistoryConfig, SourceConfig};
pub use control_plane::{HttpControlPlane, ReplicaUpdate};
pub use daemon::{shutdown_signal, Daemon, RunningDaemon};
pub use error::{Result, ScalerError};
pub use server::{StatusEntry, StatusServer};
